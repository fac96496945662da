use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SinkError;

/// Write half of one open stream.
///
/// Writes never block: a slow reader must not stall a broadcast to everyone else.
pub trait EventSink: Send + Sync {
    fn write(&self, frame: &Bytes) -> Result<(), SinkError>;

    /// End the stream. Safe to call more than once.
    fn close(&self);
}

/// Sink backed by a bounded channel drained by the HTTP response body.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ChannelSink {
    pub fn new(queue_depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl EventSink for ChannelSink {
    fn write(&self, frame: &Bytes) -> Result<(), SinkError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SinkError::Closed);
        };
        tx.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn close(&self) {
        // Dropping the sender ends the receiver once queued frames drain.
        self.tx.lock().take();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records frames; can be switched to fail like a dead or congested reader.
    #[derive(Default)]
    pub struct RecordingSink {
        frames: Mutex<Vec<Bytes>>,
        fail_with: Mutex<Option<SinkError>>,
        closes: Mutex<usize>,
    }

    impl RecordingSink {
        pub fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self::default())
        }

        pub fn fail_with(&self, err: SinkError) {
            *self.fail_with.lock() = Some(err);
        }

        pub fn frames(&self) -> Vec<String> {
            self.frames
                .lock()
                .iter()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .collect()
        }

        pub fn count(&self) -> usize {
            self.frames.lock().len()
        }

        pub fn close_count(&self) -> usize {
            *self.closes.lock()
        }
    }

    impl EventSink for RecordingSink {
        fn write(&self, frame: &Bytes) -> Result<(), SinkError> {
            if let Some(err) = *self.fail_with.lock() {
                return Err(err);
            }
            self.frames.lock().push(frame.clone());
            Ok(())
        }

        fn close(&self) {
            *self.closes.lock() += 1;
        }
    }
}
