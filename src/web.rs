//! Browser transport: a chat page, model stats and a WebSocket endpoint.
//!
//! Routes:
//! - `GET /`      chat page
//! - `GET /stats` chain table statistics as JSON
//! - `GET /ws`    WebSocket upgrade; the socket is handed to the matcher

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::chain::TextModel;
use crate::conn::Connection;
use crate::error::{Result, RouletteError};
use crate::matcher::Matcher;
use crate::ws::WsConn;

pub const WS_PATH: &str = "/ws";

const HEAD_LIMIT: usize = 2048;
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);
const PEEK_RETRY: Duration = Duration::from_millis(5);

pub const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Sock Roulette</title>
<style>
body { font-family: sans-serif; max-width: 40em; margin: 2em auto; }
#log { overflow-y: auto; height: 15em; border: 1px solid #ccc; padding: 0.5em; }
#log p { margin: 0; padding: 0; }
#log em { color: #555; }
</style>
</head>
<body>
<h1>Welcome to Sock Roulette</h1>
<div id="log"></div>
<form id="chat">
<input type="text" id="msg" autocomplete="off" autofocus>
<button type="submit" id="send">send</button>
</form>
<script>
const log = document.getElementById('log');
function show(text, italic) {
  const line = document.createElement('p');
  const node = document.createTextNode(text);
  if (italic) {
    const em = document.createElement('em');
    em.appendChild(node);
    line.appendChild(em);
  } else {
    line.appendChild(node);
  }
  log.appendChild(line);
  log.scrollTop = log.scrollHeight;
}
const scheme = location.protocol === 'https:' ? 'wss://' : 'ws://';
const ws = new WebSocket(scheme + location.host + '/ws');
ws.onmessage = (ev) => show(ev.data, true);
ws.onclose = () => {
  show('Your chat partner has disconnected', true);
  document.getElementById('msg').disabled = true;
  document.getElementById('send').disabled = true;
};
document.getElementById('chat').addEventListener('submit', (ev) => {
  ev.preventDefault();
  const input = document.getElementById('msg');
  if (!input.value) return;
  show(input.value, false);
  ws.send(input.value);
  input.value = '';
});
</script>
</body>
</html>
"#;

/// The parts of a request line the router needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub websocket_upgrade: bool,
}

/// Parse the head of an HTTP request. `Ok(None)` means more bytes are needed.
pub fn parse_head(bytes: &[u8]) -> Result<Option<RequestHead>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RouletteError::Http(e.to_string())),
    }
    let method = req.method.unwrap_or("GET").to_string();
    let target = req.path.unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/").to_string();
    let websocket_upgrade = req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("upgrade")
            && std::str::from_utf8(h.value)
                .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    });
    Ok(Some(RequestHead {
        method,
        path,
        websocket_upgrade,
    }))
}

fn response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    )
}

/// Build the full HTTP response for a non-WebSocket request.
pub fn route(head: &RequestHead, model: &TextModel) -> String {
    if head.method != "GET" {
        return response("405 Method Not Allowed", "text/plain", "Method Not Allowed");
    }
    match head.path.as_str() {
        "/" => response("200 OK", "text/html; charset=utf-8", INDEX_HTML),
        "/stats" => match serde_json::to_string(&model.stats()) {
            Ok(json) => response("200 OK", "application/json", &json),
            Err(_) => response("500 Internal Server Error", "text/plain", "stats unavailable"),
        },
        _ => response("404 Not Found", "text/plain", "Not Found"),
    }
}

pub async fn serve(listener: TcpListener, matcher: Arc<Matcher>, model: Arc<TextModel>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(%addr, "accepted http connection");
        let matcher = Arc::clone(&matcher);
        let model = Arc::clone(&model);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, matcher, model).await {
                warn!(%addr, error = %e, "connection error");
            }
        });
    }
}

/// Peek until a full request head is buffered, without consuming it.
///
/// Returns the head and the number of bytes peeked, or `None` if the client
/// closed before sending a complete head.
async fn peek_head(stream: &TcpStream) -> Result<Option<(RequestHead, usize)>> {
    match tokio::time::timeout(HEAD_TIMEOUT, peek_until_head(stream)).await {
        Ok(peeked) => peeked,
        Err(_) => Err(RouletteError::Http("request head timed out".to_string())),
    }
}

async fn peek_until_head(stream: &TcpStream) -> Result<Option<(RequestHead, usize)>> {
    let mut buf = [0u8; HEAD_LIMIT];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(head) = parse_head(&buf[..n])? {
            return Ok(Some((head, n)));
        }
        if n == buf.len() {
            return Err(RouletteError::Http("request head too large".to_string()));
        }
        // peek returns at once while old bytes are buffered
        if n == seen {
            tokio::time::sleep(PEEK_RETRY).await;
        }
        seen = n;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    matcher: Arc<Matcher>,
    model: Arc<TextModel>,
) -> Result<()> {
    // The WebSocket handshake re-reads the head itself, so only peek here.
    let Some((head, peeked)) = peek_head(&stream).await? else {
        return Ok(());
    };

    if head.websocket_upgrade {
        if head.path != WS_PATH {
            stream
                .write_all(response("404 Not Found", "text/plain", "Not Found").as_bytes())
                .await?;
            return Ok(());
        }
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let conn: Arc<dyn Connection> = Arc::new(WsConn::new(ws));
        let outcome = matcher.run(conn).await?;
        debug!(%outcome, "websocket finished");
        return Ok(());
    }

    let mut consumed = vec![0u8; peeked];
    stream.read_exact(&mut consumed).await?;
    stream.write_all(route(&head, &model).as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
