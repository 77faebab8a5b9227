//! Bidirectional relay between two paired connections.

use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chain::Trainer;
use crate::conn::Connection;
use crate::error::Result;

/// Sent to both parties once a session begins.
pub const CONNECTED_NOTICE: &[u8] = b"You are now connected to a chat partner\n";

const COPY_BUF_LEN: usize = 4096;

/// Copy `src` into `dst` until EOF or error, feeding each chunk to `tap` first.
async fn copy(
    src: Arc<dyn Connection>,
    dst: Arc<dyn Connection>,
    mut tap: Option<Trainer>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        if let Some(trainer) = tap.as_mut() {
            trainer.feed(&buf[..n]);
        }
        dst.write(&buf[..n]).await?;
        total += n as u64;
    }
}

async fn notify(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> io::Result<()> {
    a.write(CONNECTED_NOTICE).await?;
    b.write(CONNECTED_NOTICE).await?;
    Ok(())
}

/// Run a chat session between `a` and `b`.
///
/// Both sides are told they are connected, then bytes are copied in both
/// directions. The session ends at the first direction to finish, cleanly or
/// not, and both connections are closed before returning. Bytes read from `b`
/// are fed to `tap` when one is supplied. Returns the first direction's
/// outcome; a clean EOF is `Ok`.
pub async fn relay(
    a: Arc<dyn Connection>,
    b: Arc<dyn Connection>,
    tap: Option<Trainer>,
) -> Result<()> {
    let session = Uuid::new_v4();
    info!(%session, trained = tap.is_some(), "session started");

    let first = match notify(&a, &b).await {
        Ok(()) => {
            // room for both outcomes so the slower task never blocks on send
            let (done_tx, mut done_rx) = mpsc::channel::<io::Result<u64>>(2);
            for (src, dst, tap) in [
                (Arc::clone(&a), Arc::clone(&b), None),
                (Arc::clone(&b), Arc::clone(&a), tap),
            ] {
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let _ = done_tx.send(copy(src, dst, tap).await).await;
                });
            }
            drop(done_tx);
            done_rx.recv().await.unwrap_or(Ok(0))
        }
        Err(e) => Err(e),
    };

    match &first {
        Ok(bytes) => debug!(%session, bytes, "partner disconnected"),
        Err(e) => warn!(%session, error = %e, "relay error"),
    }

    for side in [&a, &b] {
        if let Err(e) = side.close().await {
            debug!(%session, error = %e, "close failed");
        }
    }
    info!(%session, "session ended");

    first.map(|_| ()).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TextModel;
    use crate::conn::duplex_pair;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn expect(peer: &mut DuplexStream, want: &[u8]) {
        let mut buf = vec![0u8; want.len()];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
            .await
            .expect("timed out waiting for data")
            .unwrap();
        assert_eq!(buf, want);
    }

    async fn expect_eof(peer: &mut DuplexStream) {
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("peer not closed")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_relay_notifies_and_copies_both_ways() {
        let (a, mut pa) = duplex_pair(1024);
        let (b, mut pb) = duplex_pair(1024);
        let session = tokio::spawn(relay(Arc::new(a), Arc::new(b), None));

        expect(&mut pa, CONNECTED_NOTICE).await;
        expect(&mut pb, CONNECTED_NOTICE).await;

        pa.write_all(b"hello from a").await.unwrap();
        expect(&mut pb, b"hello from a").await;
        pb.write_all(b"hi from b").await.unwrap();
        expect(&mut pa, b"hi from b").await;

        drop(pa);
        expect_eof(&mut pb).await;
        let outcome = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_relay_closes_both_sides_when_one_closes() {
        let (a, mut pa) = duplex_pair(1024);
        let (b, mut pb) = duplex_pair(1024);
        let a = Arc::new(a);
        let b = Arc::new(b);
        let session = tokio::spawn(relay(a.clone(), b.clone(), None));
        expect(&mut pa, CONNECTED_NOTICE).await;
        expect(&mut pb, CONNECTED_NOTICE).await;

        b.close().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("relay did not finish")
            .unwrap()
            .unwrap_err();
        assert!(a.is_closed());
        assert!(b.is_closed());
        expect_eof(&mut pa).await;
    }

    #[tokio::test]
    async fn test_relay_reports_notice_failure() {
        let (a, _pa) = duplex_pair(1024);
        let (b, _pb) = duplex_pair(1024);
        let a = Arc::new(a);
        let b = Arc::new(b);
        a.close().await.unwrap();
        let outcome = relay(a.clone(), b.clone(), None).await;
        assert!(outcome.is_err());
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn test_relay_taps_second_party_into_model() {
        let model = Arc::new(TextModel::new(2).unwrap());
        let (a, mut pa) = duplex_pair(1024);
        let (b, mut pb) = duplex_pair(1024);
        let session = tokio::spawn(relay(
            Arc::new(a),
            Arc::new(b),
            Some(model.trainer()),
        ));
        expect(&mut pa, CONNECTED_NOTICE).await;
        expect(&mut pb, CONNECTED_NOTICE).await;

        pb.write_all(b"nice to meet").await.unwrap();
        expect(&mut pa, b"nice to meet").await;
        pa.write_all(b"untapped words").await.unwrap();
        expect(&mut pb, b"untapped words").await;

        drop(pb);
        session.await.unwrap().unwrap();
        assert_eq!(model.suffixes(" "), vec!["nice"]);
        assert_eq!(model.suffixes("nice to"), vec!["meet"]);
        assert!(model.suffixes(" untapped").is_empty());
    }
}
