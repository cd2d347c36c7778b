//! Downstream sink for normalized events.

use tokio::sync::mpsc;

use super::SecurityEvent;

/// Takes ownership of each event. Called on the capture thread, so it must
/// not block.
pub trait EventProcessor: Send + Sync {
    fn dispatch(&self, event: SecurityEvent);
}

/// Hands events to an unbounded channel. A closed receiver drops events.
#[derive(Debug, Clone)]
pub struct ChannelProcessor {
    tx: mpsc::UnboundedSender<SecurityEvent>,
}

impl ChannelProcessor {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SecurityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventProcessor for ChannelProcessor {
    fn dispatch(&self, event: SecurityEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event receiver closed, dropping event");
        }
    }
}

impl<F> EventProcessor for F
where
    F: Fn(SecurityEvent) + Send + Sync,
{
    fn dispatch(&self, event: SecurityEvent) {
        self(event)
    }
}
