//! Runs a blocking feed on its own reader thread.
//!
//! The polling loop only ever waits a bounded time for the next frame, so a
//! quiet tracker cannot hold off shutdown or the minute-edge checkpoint.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{Detection, DetectionFeed, FeedError};

type Batch = Result<Option<Vec<Detection>>, FeedError>;

const QUEUE_DEPTH: usize = 4;

pub struct ThreadedFeed {
    batches: Receiver<Batch>,
    wait: Duration,
}

impl ThreadedFeed {
    /// Moves `feed` onto a reader thread. `next_batch` then waits at most
    /// `wait` and returns an empty batch when no frame arrived in time.
    pub fn spawn<F>(mut feed: F, wait: Duration) -> io::Result<Self>
    where
        F: DetectionFeed + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        thread::Builder::new()
            .name("feed-reader".into())
            .spawn(move || loop {
                let batch = feed.next_batch();
                let exhausted = matches!(batch, Ok(None));
                if tx.send(batch).is_err() || exhausted {
                    debug!("Feed reader stopped");
                    break;
                }
            })?;
        Ok(Self { batches: rx, wait })
    }
}

impl DetectionFeed for ThreadedFeed {
    fn next_batch(&mut self) -> Result<Option<Vec<Detection>>, FeedError> {
        match self.batches.recv_timeout(self.wait) {
            Ok(batch) => batch,
            Err(RecvTimeoutError::Timeout) => Ok(Some(Vec::new())),
            // reader thread gone without reporting exhaustion
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}
