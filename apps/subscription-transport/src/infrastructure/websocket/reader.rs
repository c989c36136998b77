//! Frame Reader Task
//!
//! Pumps text frames from the read half of a connection into a bounded
//! channel so the handler's event loop can `select!` over frames, new
//! subscribers and the liveness tick at once. The first failure is sent
//! as a terminal `Err` and the task exits.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

/// Why reading stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// Close frame or end of stream.
    #[error("connection closed by upstream")]
    Closed,
    /// Transport failure.
    #[error("read error: {0}")]
    Transport(String),
}

/// One text frame, or the reason the connection can no longer be read.
pub type FrameResult = Result<String, ReadError>;

/// Spawn the reader for `stream`.
///
/// The task stops after forwarding a terminal error, when `cancel` fires,
/// or when the receiver is dropped.
pub fn spawn_reader<S>(
    mut stream: S,
    tx: mpsc::Sender<FrameResult>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = stream.next() => frame,
            };

            let forwarded = match frame {
                Some(Ok(Message::Text(text))) => Ok(text.as_str().to_string()),
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(frame = ?frame, "Upstream sent close frame");
                    Err(ReadError::Closed)
                }
                // Control frames are answered by tungstenite; binary frames are not part of either protocol.
                Some(Ok(_)) => continue,
                Some(Err(e)) => Err(ReadError::Transport(e.to_string())),
                None => Err(ReadError::Closed),
            };

            let terminal = forwarded.is_err();
            if tx.send(forwarded).await.is_err() || terminal {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    type Frame = Result<Message, tungstenite::Error>;

    #[tokio::test]
    async fn forwards_text_and_stops_at_close() {
        let frames = stream::iter(vec![
            Ok(Message::Text("a".into())),
            Ok(Message::Binary(vec![1, 2].into())),
            Ok(Message::Text("b".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("never".into())),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        spawn_reader(frames, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(Ok("a".to_string())));
        assert_eq!(rx.recv().await, Some(Ok("b".to_string())));
        assert_eq!(rx.recv().await, Some(Err(ReadError::Closed)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn end_of_stream_is_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        spawn_reader(stream::empty::<Frame>(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Err(ReadError::Closed)));
    }

    #[tokio::test]
    async fn transport_error_is_forwarded() {
        let frames = stream::iter(vec![Err(tungstenite::Error::ConnectionClosed)]);
        let (tx, mut rx) = mpsc::channel(1);
        spawn_reader(frames, tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Err(ReadError::Transport(_)))));
    }

    #[tokio::test]
    async fn cancellation_stops_reader() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_reader(stream::pending::<Frame>(), tx, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
