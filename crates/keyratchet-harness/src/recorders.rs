//! Recording event sink and full-ratchet starter.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use keyratchet_core::{ChannelEvent, ChannelId, EventSink, FullRatchetStarter, StarterError};

/// Event sink keeping every posted event, in order.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<ChannelEvent>>,
}

impl RecordingEvents {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events posted so far.
    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drain the events posted so far.
    pub fn take(&self) -> Vec<ChannelEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for RecordingEvents {
    fn post(&self, event: ChannelEvent) {
        tracing::debug!(?event, "Event posted");
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Full-ratchet starter that records requests, optionally failing them.
#[derive(Debug, Default)]
pub struct RecordingStarter {
    starts: Mutex<Vec<ChannelId>>,
    failing: AtomicBool,
}

impl RecordingStarter {
    /// Recorder that accepts every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent requests fail (they are still recorded).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Channels a full ratchet was requested for, in order.
    pub fn starts(&self) -> Vec<ChannelId> {
        self.starts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drain the recorded requests.
    pub fn take(&self) -> Vec<ChannelId> {
        std::mem::take(&mut *self.starts.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl FullRatchetStarter for RecordingStarter {
    fn start_full_ratchet(&self, channel: &ChannelId) -> Result<(), StarterError> {
        self.starts.lock().unwrap_or_else(PoisonError::into_inner).push(channel.clone());
        if self.failing.load(Ordering::Relaxed) {
            return Err(StarterError("protocol manager offline".to_string()));
        }
        Ok(())
    }
}
