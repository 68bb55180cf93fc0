//! Outbound typing-indicator debounce.
//!
//! Keystrokes produce at most one "started typing" signal per window, and a
//! trailing "stopped typing" signal fires one window after the last
//! keystroke. Time is passed in explicitly so the session driver can own the
//! clock and tests can step it deterministically.

use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_TYPING_WINDOW: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Started,
    Stopped,
}

#[derive(Debug)]
pub struct TypingDebounce {
    window: Duration,
    last_started: Option<Instant>,
    stop_deadline: Option<Instant>,
}

impl TypingDebounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_started: None,
            stop_deadline: None,
        }
    }

    /// Records a keystroke at `now` and re-arms the stop timer.
    ///
    /// Returns [`TypingSignal::Started`] when more than one window has passed
    /// since the previous start signal, or when none has been sent yet.
    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        let due = self
            .last_started
            .is_none_or(|at| now.saturating_duration_since(at) > self.window);

        self.stop_deadline = Some(now + self.window);
        if due {
            self.last_started = Some(now);
            Some(TypingSignal::Started)
        } else {
            None
        }
    }

    /// When the pending stop signal is due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.stop_deadline
    }

    /// Fires the trailing stop signal once its deadline has been reached.
    pub fn poll_expired(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.stop_deadline {
            Some(deadline) if now >= deadline => {
                self.stop_deadline = None;
                Some(TypingSignal::Stopped)
            }
            _ => None,
        }
    }

    /// Cancels the pending stop timer.
    ///
    /// The start signal stays rate limited: a keystroke inside the window of
    /// the previous start still emits nothing.
    pub fn cancel(&mut self) {
        self.stop_deadline = None;
    }

    /// Forgets all typing history, for when the session is torn down.
    pub fn reset(&mut self) {
        self.last_started = None;
        self.stop_deadline = None;
    }
}

impl Default for TypingDebounce {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_WINDOW)
    }
}
