//! Manual override flag and the one-shot opening mailbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use pacer_core::{Channel, PacerError, Result};
use tokio::sync::Notify;

/// Single-slot "attempt now" request. Repeated requests collapse into one.
#[derive(Default)]
pub struct ManualTrigger {
    requested: AtomicBool,
    wake: Notify,
}

impl ManualTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake the loop. Returns immediately.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves after the next `request`, or immediately if one is already stored.
    pub async fn notified(&self) {
        self.wake.notified().await
    }
}

/// Single-slot overwritable mailbox for the next attempt's opening text.
pub struct OpeningMailbox {
    max_chars: usize,
    slot: Mutex<Option<String>>,
}

impl OpeningMailbox {
    pub fn new(channel: Channel) -> Self {
        Self {
            max_chars: channel.opening_max_chars(),
            slot: Mutex::new(None),
        }
    }

    /// Store `text` for the next placement, replacing anything already queued.
    pub fn set(&self, text: &str) -> Result<String> {
        let clean = sanitize(text);
        if clean.is_empty() {
            return Err(PacerError::InvalidInput("opening text is empty".into()));
        }
        let count = clean.chars().count();
        if count > self.max_chars {
            return Err(PacerError::InvalidInput(format!(
                "opening text is {count} chars, max {}",
                self.max_chars
            )));
        }
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(clean.clone());
        Ok(clean)
    }

    /// Consume the queued text, if any.
    pub fn take(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Put back text taken for a placement that failed, unless a newer one arrived.
    pub fn restore(&self, text: String) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(text);
        }
    }

    pub fn peek(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Drop control characters and collapse surrounding whitespace.
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}
