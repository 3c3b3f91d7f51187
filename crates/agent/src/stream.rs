//! Streaming chat events.
//!
//! A streamed chat is a bounded channel of [`ChatEvent`]s: zero or more
//! `token` and `thought` events in order, then exactly one terminal event
//! (`complete`, `cancelled` or `error`). The generation worker waits when
//! the channel is full, so a slow consumer slows generation down instead of
//! losing tokens. A cancelled generation stops waiting. Dropping the
//! [`ChatStream`] cancels the generation.

use crate::assistant::ChatResponse;
use jarvis_core::{CancelFlag, Error, ThoughtLogEntry};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events buffered between the generation worker and the consumer.
pub const STREAM_CAPACITY: usize = 256;

/// How often a worker blocked on a full channel re-checks cancellation.
const FULL_CHANNEL_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Newly generated text.
    Token { text: String },

    /// A narrated orchestration step.
    Thought(ThoughtLogEntry),

    /// Generation finished normally.
    Complete(ChatResponse),

    /// Generation was cancelled; `partial` is the text produced so far.
    Cancelled { partial: String },

    /// Generation failed.
    Error {
        kind: String,
        message: String,
        partial: String,
    },
}

impl ChatEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Thought(_) => "thought",
            Self::Complete(_) => "complete",
            Self::Cancelled { .. } => "cancelled",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete(_) | Self::Cancelled { .. } | Self::Error { .. }
        )
    }

    pub fn from_error(error: &Error) -> Self {
        Self::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
            partial: error.partial_output().unwrap_or_default().to_string(),
        }
    }
}

/// Producer side of a chat stream.
///
/// A failed send means the consumer is gone; that cancels the generation.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
    cancel: CancelFlag,
}

impl EventSink {
    pub(crate) fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub(crate) async fn send(&self, event: ChatEvent) {
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
        }
    }

    /// For use on a blocking worker thread only.
    ///
    /// Waits while the channel is full, but gives up and drops the event as
    /// soon as the stream or `interrupt` is cancelled. Returns whether the
    /// event was delivered.
    pub(crate) fn send_blocking(&self, event: ChatEvent, interrupt: &CancelFlag) -> bool {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(back)) => {
                    if self.cancel.is_cancelled() || interrupt.is_cancelled() {
                        return false;
                    }
                    event = back;
                    std::thread::sleep(FULL_CHANNEL_POLL);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.cancel.cancel();
                    return false;
                }
            }
        }
    }
}

/// Consumer side of a streamed chat.
pub struct ChatStream {
    rx: mpsc::Receiver<ChatEvent>,
    cancel: CancelFlag,
    task: Option<JoinHandle<()>>,
    finished: bool,
}

impl ChatStream {
    pub(crate) fn channel() -> (EventSink, mpsc::Receiver<ChatEvent>, CancelFlag) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let cancel = CancelFlag::new();
        let sink = EventSink {
            tx,
            cancel: cancel.clone(),
        };
        (sink, rx, cancel)
    }

    pub(crate) fn new(rx: mpsc::Receiver<ChatEvent>, cancel: CancelFlag, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            cancel,
            task: Some(task),
            finished: false,
        }
    }

    /// The next event, or `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await?;
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Ask the generation to stop. It ends with a `cancelled` event within
    /// one decoding step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that can cancel this stream from elsewhere.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Drain every remaining event and wait for the worker to exit.
    pub async fn collect(mut self) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        events
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fill(sink: &EventSink) {
        let idle = CancelFlag::new();
        for i in 0..STREAM_CAPACITY {
            assert!(sink.send_blocking(ChatEvent::Token { text: i.to_string() }, &idle));
        }
    }

    #[test]
    fn blocked_send_gives_up_when_stream_is_cancelled() {
        let (sink, _rx, cancel) = ChatStream::channel();
        fill(&sink);

        let worker = {
            let sink = sink.clone();
            std::thread::spawn(move || {
                sink.send_blocking(ChatEvent::Token { text: "late".into() }, &CancelFlag::new())
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!worker.is_finished());

        let started = Instant::now();
        cancel.cancel();
        assert!(!worker.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn blocked_send_gives_up_on_interrupt() {
        let (sink, _rx, cancel) = ChatStream::channel();
        fill(&sink);

        let interrupt = CancelFlag::new();
        let worker = {
            let (sink, interrupt) = (sink.clone(), interrupt.clone());
            std::thread::spawn(move || {
                sink.send_blocking(ChatEvent::Token { text: "late".into() }, &interrupt)
            })
        };
        interrupt.cancel();
        assert!(!worker.join().unwrap());
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn send_to_dropped_consumer_cancels() {
        let (sink, rx, cancel) = ChatStream::channel();
        drop(rx);
        assert!(!sink.send_blocking(ChatEvent::Token { text: "x".into() }, &CancelFlag::new()));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn event_serialization_token() {
        let event = ChatEvent::Token {
            text: "Hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"token""#));
        assert!(json.contains(r#""text":"Hello""#));
    }

    #[test]
    fn event_serialization_thought_is_flat() {
        let event = ChatEvent::Thought(ThoughtLogEntry::new("Memory Search", "2 memories"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"thought""#));
        assert!(json.contains(r#""step":"Memory Search""#));
        assert!(json.contains(r#""timestamp""#));
    }

    #[test]
    fn error_event_carries_kind_and_partial() {
        let err = Error::Generation {
            error: jarvis_core::GenerationError::Decode("boom".into()),
            partial: "Hel".into(),
        };
        let event = ChatEvent::from_error(&err);
        assert_eq!(event.event_type(), "error");
        assert!(event.is_terminal());
        match event {
            ChatEvent::Error { kind, partial, .. } => {
                assert_eq!(kind, "decode_error");
                assert_eq!(partial, "Hel");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"type":"cancelled","partial":"Hi"}"#;
        let event: ChatEvent = serde_json::from_str(json).unwrap();
        match event {
            ChatEvent::Cancelled { partial } => assert_eq!(partial, "Hi"),
            _ => panic!("Wrong variant"),
        }
    }

    #[tokio::test]
    async fn stream_stops_after_terminal_event() {
        let (sink, rx, cancel) = ChatStream::channel();
        let task = tokio::spawn(async move {
            sink.send(ChatEvent::Token { text: "a".into() }).await;
            sink.send(ChatEvent::Cancelled { partial: "a".into() }).await;
            sink.send(ChatEvent::Token { text: "late".into() }).await;
        });
        let events = ChatStream::new(rx, cancel, task).collect().await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["token", "cancelled"]);
    }

    #[tokio::test]
    async fn dropped_stream_cancels_producer() {
        let (sink, rx, cancel) = ChatStream::channel();
        let flag = sink.cancel_flag().clone();
        let stream = ChatStream::new(rx, cancel, tokio::spawn(async {}));
        drop(stream);
        assert!(flag.is_cancelled());
        sink.send(ChatEvent::Token { text: "x".into() }).await;
        assert!(flag.is_cancelled());
    }
}
