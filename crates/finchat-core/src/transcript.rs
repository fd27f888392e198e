//! Append-only chat transcript with live subscription.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::ChatMessage;

/// Live update emitted by a [`Transcript`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// A message was appended.
    Appended(ChatMessage),
    /// The whole transcript was replaced by this single message.
    Reset(ChatMessage),
}

/// Ordered session transcript.
///
/// Insertion order is display order. Messages are never edited or removed
/// individually; [`Transcript::reset`] is the only way to drop history.
pub struct Transcript {
    messages: RwLock<Vec<ChatMessage>>,
    sender: broadcast::Sender<TranscriptEvent>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    /// Create an empty transcript.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            messages: RwLock::new(Vec::with_capacity(32)),
            sender,
        }
    }

    /// Create a transcript seeded with one message.
    #[must_use]
    pub fn with_greeting(greeting: ChatMessage) -> Self {
        let transcript = Self::new();
        transcript.write().push(greeting);
        transcript
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ChatMessage>> {
        self.messages.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ChatMessage>> {
        self.messages.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and notify live listeners.
    pub fn push(&self, msg: ChatMessage) {
        self.write().push(msg.clone());
        let _ = self.sender.send(TranscriptEvent::Appended(msg)); // live listeners
    }

    /// Replace the whole history with a single message.
    pub fn reset(&self, msg: ChatMessage) {
        {
            let mut messages = self.write();
            messages.clear();
            messages.push(msg.clone());
        }
        let _ = self.sender.send(TranscriptEvent::Reset(msg));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<ChatMessage> {
        self.read().last().cloned()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.read().clone()
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.sender.subscribe()
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Lagged receivers silently skip the events they missed.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, TranscriptEvent> {
        let (history, rx) = {
            let messages = self.read();
            (messages.clone(), self.subscribe())
        };

        let hist = futures::stream::iter(history.into_iter().map(TranscriptEvent::Appended));
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;

    #[test]
    fn test_push_preserves_order() {
        let transcript = Transcript::new();
        transcript.push(ChatMessage::user("one"));
        transcript.push(ChatMessage::bot("two", Vec::new()));

        let contents: Vec<_> = transcript
            .snapshot()
            .iter()
            .map(|m| m.content().to_owned())
            .collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[test]
    fn test_reset_leaves_single_message() {
        let transcript = Transcript::with_greeting(ChatMessage::system("hello"));
        transcript.push(ChatMessage::user("a"));
        transcript.push(ChatMessage::user("b"));

        transcript.reset(ChatMessage::system("fresh"));
        assert_eq!(transcript.len(), 1);
        let last = transcript.last().unwrap();
        assert_eq!(last.role(), Role::System);
        assert_eq!(last.content(), "fresh");
    }

    #[tokio::test]
    async fn test_subscribers_see_appends_and_resets() {
        let transcript = Transcript::new();
        let mut rx = transcript.subscribe();

        let msg = ChatMessage::user("hi");
        transcript.push(msg.clone());
        transcript.reset(ChatMessage::system("cleared"));

        assert_eq!(rx.recv().await.unwrap(), TranscriptEvent::Appended(msg));
        assert!(matches!(rx.recv().await.unwrap(), TranscriptEvent::Reset(m) if m.content() == "cleared"));
    }

    #[tokio::test]
    async fn test_history_plus_stream_replays_then_follows() {
        let transcript = Transcript::with_greeting(ChatMessage::system("welcome"));
        let mut stream = transcript.history_plus_stream();

        transcript.push(ChatMessage::user("live"));

        let first = stream.next().await.unwrap();
        assert!(matches!(first, TranscriptEvent::Appended(m) if m.content() == "welcome"));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, TranscriptEvent::Appended(m) if m.content() == "live"));
    }
}
