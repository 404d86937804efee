//! Session event stream for presentation layers.
//!
//! One stream per session. It ends right after the single `answer` event.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Debugger-side progress: observations, executed commands.
    Trace,
    /// The policy's raw reasoning text.
    Cot,
    /// Final conclusion or failure report.
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub content: String,
}

impl SessionEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx: Some(tx) }, EventStream { rx })
}

/// Producer half, held by the driver.
#[derive(Debug)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    fn emit(&self, kind: EventKind, content: String) {
        if let Some(tx) = &self.tx {
            // A dropped consumer is not an error for the session.
            let _ = tx.send(SessionEvent { kind, content });
        }
    }

    pub fn trace(&self, content: impl Into<String>) {
        self.emit(EventKind::Trace, content.into());
    }

    pub fn cot(&self, content: impl Into<String>) {
        self.emit(EventKind::Cot, content.into());
    }

    /// Emits the terminal event and closes the stream. Later calls are ignored.
    pub fn answer(&mut self, content: impl Into<String>) {
        self.emit(EventKind::Answer, content.into());
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Consumer half; a finite [`Stream`] of [`SessionEvent`]s.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
