use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::message::IncomingMessage;

/// Receives messages from other cluster members. Messages from each sender arrive in the
///  order they were sent, and each message at most once.
///
/// This is called on the receiver's task, so implementations should hand off long-running
///  work rather than doing it inline.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, message: IncomingMessage);
}
