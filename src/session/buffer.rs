//! Delta coalescing
//!
//! Text and reasoning deltas can arrive token by token. They are buffered
//! for a short window and applied to the in-flight message in one go.

use std::time::Duration;
use tokio::time::Instant;

use crate::conversation::Message;

/// Buffers text and reasoning deltas for a fixed window
#[derive(Debug)]
pub struct DeltaBuffer {
    window: Duration,
    text: String,
    thinking: String,
    opened_at: Option<Instant>,
}

impl DeltaBuffer {
    /// Creates a buffer; a zero window flushes on every delta
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            text: String::new(),
            thinking: String::new(),
            opened_at: None,
        }
    }

    /// Buffers a text delta
    pub fn push_text(&mut self, delta: &str) {
        self.open();
        self.text.push_str(delta);
    }

    /// Buffers a reasoning delta
    pub fn push_thinking(&mut self, delta: &str) {
        self.open();
        self.thinking.push_str(delta);
    }

    fn open(&mut self) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.thinking.is_empty()
    }

    /// When the buffered deltas must be applied, if any are buffered
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.window)
    }

    /// Whether the window has elapsed
    pub fn is_due(&self) -> bool {
        self.deadline().map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Applies everything buffered to `message` and resets the window
    ///
    /// Returns the text portion that was applied.
    pub fn flush_into(&mut self, message: &mut Message) -> String {
        self.opened_at = None;
        if !self.thinking.is_empty() {
            message.append_thinking(&std::mem::take(&mut self.thinking));
        }
        let text = std::mem::take(&mut self.text);
        if !text.is_empty() {
            message.append_text(&text);
        }
        text
    }
}
