//! Shared wake-up signal for admission waits
//!
//! Anything that can turn a denial into a permission (a constraint update,
//! a scheduled rate-limit refill, an expiry sweep) calls [`WakeSignal::notify`].
//! Waiters re-check their predicate after every notification and never poll.

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
pub struct WakeSignal {
    notify: Notify,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every current waiter
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    /// Suspend until `ready` returns true or `cancel` fires.
    ///
    /// The waiter registers before evaluating `ready`, so a notification
    /// sent between the check and the await is not lost.
    pub async fn wait_until<F>(&self, cancel: &CancellationToken, mut ready: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if ready() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }
}
