//! Accept loops that turn incoming sockets into matched connections.

use colored::*;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::chain::TextModel;
use crate::config::{Config, Transport};
use crate::conn::{Connection, StreamConn};
use crate::error::Result;
use crate::matcher::Matcher;

/// Bind the configured address and serve forever on the configured transport.
pub async fn run(config: &Config, matcher: Arc<Matcher>, model: Arc<TextModel>) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let local = listener.local_addr()?;

    match config.transport {
        Transport::Tcp => {
            eprintln!(
                "{}",
                format!("  Chat roulette listening on {local} (try: nc {} {})", local.ip(), local.port())
                    .bright_green()
            );
        }
        Transport::Web => {
            eprintln!(
                "{}",
                format!("  Chat roulette running at http://{local}").bright_green()
            );
        }
    }
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    info!(addr = %local, transport = %config.transport, "server started");

    match config.transport {
        Transport::Tcp => serve_tcp(listener, matcher).await,
        Transport::Web => crate::web::serve(listener, matcher, model).await,
    }
}

/// Hand every accepted socket to the matcher on its own task.
pub async fn serve_tcp(listener: TcpListener, matcher: Arc<Matcher>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(%addr, "accepted tcp connection");
        let matcher = Arc::clone(&matcher);
        tokio::spawn(async move { handle_tcp(stream, matcher).await });
    }
}

async fn handle_tcp(stream: TcpStream, matcher: Arc<Matcher>) {
    let conn: Arc<dyn Connection> = Arc::new(StreamConn::from_tcp(stream));
    match matcher.run(conn).await {
        Ok(outcome) => debug!(%outcome, "tcp connection finished"),
        Err(e) => warn!(error = %e, "tcp connection failed before matching"),
    }
}
