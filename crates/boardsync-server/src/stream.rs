use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use boardsync_core::ConnectionId;

use crate::notify::Notifier;

/// Response body of one stream. Yields queued frames; when the transport goes
/// away and the body is dropped, the connection is removed and, if it was the
/// user's last on its board, the board is told they left.
pub struct ConnectionStream {
    // Dropped before `frames`: the record must leave the registry before the
    // receiver closes, or a concurrent write could remove it unannounced.
    _guard: DisconnectGuard,
    frames: ReceiverStream<Bytes>,
}

impl ConnectionStream {
    pub fn new(id: ConnectionId, rx: mpsc::Receiver<Bytes>, notifier: Notifier) -> Self {
        Self {
            _guard: DisconnectGuard { id, notifier },
            frames: ReceiverStream::new(rx),
        }
    }
}

impl Stream for ConnectionStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx).map(|frame| frame.map(Ok))
    }
}

struct DisconnectGuard {
    id: ConnectionId,
    notifier: Notifier,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        // Already gone if it was kicked, swept or found dead during a write.
        let Some(conn) = self.notifier.registry().remove(&self.id) else {
            return;
        };
        debug!(connection_id = %self.id, "stream closed by transport");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let notifier = self.notifier.clone();
            runtime.spawn(async move {
                notifier.connection_closed(&conn).await;
            });
        }
    }
}
