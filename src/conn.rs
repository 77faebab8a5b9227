//! The connection abstraction every chat party implements.
//!
//! A [`Connection`] is an ordered duplex byte stream with an explicit,
//! idempotent close. Closing must wake any task blocked in `read` or `write`
//! on the same connection; the relay relies on this to tear a session down
//! without waiting for the second copy direction.
//!
//! [`StreamConn`] adapts any tokio reader/writer pair (TCP sockets, in-memory
//! duplex pipes). The WebSocket adapter lives in [`crate::ws`] and the bot in
//! [`crate::bot`].

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

#[async_trait]
pub trait Connection: Send + Sync {
    /// Read into `buf`, returning the number of bytes read. `Ok(0)` is end of stream.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole of `buf`, returning its length.
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the connection. Calling it again is a no-op.
    async fn close(&self) -> io::Result<()>;
}

/// Error returned by reads and writes on a closed connection.
pub fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

/// One-shot close latch that async tasks can wait on.
#[derive(Debug)]
pub struct CloseSignal {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Trip the latch. Returns `true` only for the first caller.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        // send_replace updates the value even with no live receivers
        self.tx.send_replace(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolve once the latch has fired.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A [`Connection`] over a tokio reader and writer.
pub struct StreamConn<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    signal: CloseSignal,
}

/// In-memory connection half returned by [`duplex_pair`].
pub type DuplexConn = StreamConn<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

impl<R, W> StreamConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            signal: CloseSignal::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

impl StreamConn<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

/// An in-memory connection plus the peer end a test or local client drives.
pub fn duplex_pair(capacity: usize) -> (DuplexConn, DuplexStream) {
    let (local, remote) = tokio::io::duplex(capacity);
    let (reader, writer) = tokio::io::split(local);
    (StreamConn::new(reader, writer), remote)
}

#[async_trait]
impl<R, W> Connection for StreamConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
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
        tokio::select! {
            res = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(buf).await?;
                writer.flush().await?;
                Ok::<_, io::Error>(buf.len())
            } => res,
            () = self.signal.closed() => Err(closed_error()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        if !self.signal.fire() {
            return Ok(());
        }
        // Pending writes have released the lock once the signal fired.
        self.writer.lock().await.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_signal_fires_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_closed());
        // already fired: resolves immediately
        tokio::time::timeout(Duration::from_millis(100), signal.closed())
            .await
            .expect("closed() should resolve after fire");
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_conn_read_write() {
        let (conn, mut peer) = duplex_pair(64);
        conn.write(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_stream_conn_eof_when_peer_drops() {
        let (conn, peer) = duplex_pair(64);
        drop(peer);
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (conn, _peer) = duplex_pair(64);
        let conn = Arc::new(conn);
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read still blocked after close")
            .unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_write() {
        // capacity 1 and nobody reading: the second byte blocks
        let (conn, _peer) = duplex_pair(1);
        let conn = Arc::new(conn);
        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.write(b"blocked").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("write still blocked after close")
            .unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut peer) = duplex_pair(64);
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        assert!(conn.write(b"late").await.is_err());
        assert!(conn.read(&mut buf).await.is_err());
    }
}
