//! Ordered fragment output for one turn

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::fragment::{MessageFragment, SessionEvent, TurnBuffer};

type Tap = Arc<dyn Fn(&MessageFragment) + Send + Sync>;

/// Serializes every emission of a turn onto one unbounded queue.
///
/// Text deltas from the agent loop and tool-phase events from the approval
/// hook share the same [`TurnBuffer`]; the buffer lock is held across the
/// send so fragments leave in the order their snapshots were taken.
pub struct FragmentWriter {
    buffer: Mutex<TurnBuffer>,
    tx: mpsc::UnboundedSender<MessageFragment>,
    tap: Option<Tap>,
}

impl FragmentWriter {
    pub fn new(buffer: TurnBuffer, tx: mpsc::UnboundedSender<MessageFragment>) -> Self {
        Self {
            buffer: Mutex::new(buffer),
            tx,
            tap: None,
        }
    }

    /// Observe every fragment as it is sent (used for group fan-out)
    pub fn with_tap(mut self, tap: impl Fn(&MessageFragment) + Send + Sync + 'static) -> Self {
        self.tap = Some(Arc::new(tap));
        self
    }

    /// Send a fragment that does not belong to the assistant bubble
    pub fn send(&self, fragment: MessageFragment) -> bool {
        let _order = self.lock();
        self.deliver(fragment)
    }

    /// Apply an event to the bubble and send the resulting snapshot
    pub fn emit(&self, event: SessionEvent) -> bool {
        let mut buffer = self.lock();
        let fragment = buffer.apply(event);
        self.deliver(fragment)
    }

    /// Replace the bubble with the failure text and send it
    pub fn fail(&self) -> bool {
        let mut buffer = self.lock();
        let fragment = buffer.fail();
        self.deliver(fragment)
    }

    /// Whether the consumer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TurnBuffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, fragment: MessageFragment) -> bool {
        if let Some(tap) = &self.tap {
            tap(&fragment);
        }
        if self.tx.send(fragment).is_err() {
            debug!("Fragment consumer closed, dropping emission");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emissions_arrive_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = FragmentWriter::new(TurnBuffer::with_bubble_id("b", "Assistant", false), tx);

        writer.send(MessageFragment::chat("u", "alice", "hi"));
        writer.emit(SessionEvent::TextDelta("He".to_string()));
        writer.emit(SessionEvent::TextDelta("llo".to_string()));

        assert_eq!(rx.recv().await.unwrap().bubble_id, "u");
        assert_eq!(rx.recv().await.unwrap().message, "He");
        let last = rx.recv().await.unwrap();
        assert_eq!(last.message, "Hello");
        assert_eq!(last.kind, FragmentKind::Chat);
    }

    #[tokio::test]
    async fn test_tap_sees_every_fragment() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let writer = FragmentWriter::new(TurnBuffer::new("Assistant", false), tx)
            .with_tap(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        writer.emit(SessionEvent::TextDelta("a".to_string()));
        writer.fail();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closed_consumer_reports_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = FragmentWriter::new(TurnBuffer::new("Assistant", false), tx);
        drop(rx);
        assert!(writer.is_closed());
        assert!(!writer.emit(SessionEvent::TextDelta("x".to_string())));
    }
}
