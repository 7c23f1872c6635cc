use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// Wakes up an engine's task when there is new work for it.
///
/// Signals are not lost if the engine is busy: a signal that arrives while nobody is waiting
///  causes the next wait to return immediately.
#[derive(Default)]
pub struct Wakeup {
    notify: Notify,
}

impl Wakeup {
    pub fn new() -> Wakeup {
        Wakeup::default()
    }

    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Waits for a signal or the deadline, whichever comes first. Returns `true` if it was
    ///  woken up by a signal.
    pub async fn wait_until(&self, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.notify.notified().await;
                true
            }
            Some(deadline) => {
                select! {
                    _ = self.notify.notified() => true,
                    _ = sleep_until(deadline) => false,
                }
            }
        }
    }
}
