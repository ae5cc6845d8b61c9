//! Operator message pool shared by both channels.
//!
//! A random entry stands in for the voice opening when no one-shot text is
//! queued, and for the SMS body when no template is configured.

use std::sync::{Mutex, PoisonError};

use rand::seq::SliceRandom;

pub const MAX_MESSAGES: usize = 10;

#[derive(Default)]
pub struct MessagePool {
    messages: Mutex<Vec<String>>,
}

impl MessagePool {
    pub fn new(initial: Vec<String>) -> Self {
        let pool = Self::default();
        pool.replace(initial);
        pool
    }

    /// Replace the pool. Blank entries are dropped and at most
    /// `MAX_MESSAGES` are kept. Returns what was stored.
    pub fn replace<I, S>(&self, items: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cleaned: Vec<String> = items
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .take(MAX_MESSAGES)
            .collect();
        *self.messages.lock().unwrap_or_else(PoisonError::into_inner) = cleaned.clone();
        cleaned
    }

    pub fn list(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pick(&self) -> Option<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
