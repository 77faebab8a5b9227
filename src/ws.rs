//! WebSocket transport adapter.
//!
//! Each `write` goes out as one text frame. `read` drains incoming text and
//! binary frames as raw bytes, buffering whatever does not fit in the caller's
//! buffer. A close frame or the end of the frame stream reads as EOF.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::conn::{closed_error, CloseSignal, Connection};

struct FrameReader<S> {
    frames: SplitStream<WebSocketStream<S>>,
    pending: Vec<u8>,
}

impl<S> FrameReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.frames.next().await {
                None | Some(Ok(WsMessage::Close(_))) => return Ok(0),
                Some(Ok(WsMessage::Text(text))) => self.pending.extend_from_slice(text.as_bytes()),
                Some(Ok(WsMessage::Binary(bytes))) => self.pending.extend_from_slice(&bytes),
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// A [`Connection`] over an accepted WebSocket.
pub struct WsConn<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    reader: Mutex<FrameReader<S>>,
    signal: CloseSignal,
}

impl<S> WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, frames) = ws.split();
        Self {
            sink: Mutex::new(sink),
            reader: Mutex::new(FrameReader {
                frames,
                pending: Vec::new(),
            }),
            signal: CloseSignal::new(),
        }
    }
}

#[async_trait]
impl<S> Connection for WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.signal.is_closed() {
            return Err(closed_error());
        }
        tokio::select! {
            res = async { self.reader.lock().await.read(buf).await } => res,
            () = self.signal.closed() => Err(closed_error()),
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.signal.is_closed() {
            return Err(closed_error());
        }
        let text = String::from_utf8_lossy(buf).into_owned();
        tokio::select! {
            res = async { self.sink.lock().await.send(WsMessage::Text(text)).await } => {
                res.map(|()| buf.len()).map_err(io::Error::other)
            }
            () = self.signal.closed() => Err(closed_error()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        if !self.signal.fire() {
            return Ok(());
        }
        self.sink.lock().await.close().await.map_err(io::Error::other)
    }
}
