//! Utterance queue bookkeeping for synthesis engines
//!
//! Synthesis engines play utterances one after another in submission order.
//! The [`UtteranceQueue`] tracks how many are pending, publishes the
//! speaking flag and lets one caller wait for the queue to drain.
//!
//! # Drain waiter
//!
//! At most one drain waiter is outstanding at any time. Arming a new waiter
//! releases the previous one, and so does [`UtteranceQueue::stop`]. A turn
//! therefore never hangs on a queue that was hard-cancelled underneath it.
//!
//! # Stale callbacks
//!
//! Every utterance carries the queue epoch it was submitted in. `stop`
//! starts a new epoch, and completion callbacks from an older epoch are
//! ignored, so a cancelled utterance that reports late cannot decrement
//! the count of the utterances queued after it.

use crate::utils::Signal;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Message shown when the host refuses audio playback
pub const PLAYBACK_NOT_ALLOWED: &str =
    "Audio playback not allowed. Please allow sound permission in browser/system settings.";

/// An utterance accepted by the queue
#[derive(Clone, Debug, PartialEq)]
pub struct Utterance {
    /// Trimmed text to speak
    pub text: String,

    /// Speaking rate multiplier
    pub rate: f32,

    /// Queue epoch the utterance was submitted in
    pub epoch: u64,

    /// Submission sequence number within the epoch
    pub seq: usize,
}

/// Why an utterance ended without finishing
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UtteranceError {
    /// Cancelled by a stop or a new immediate utterance
    Canceled,
    /// Interrupted by the host
    Interrupted,
    /// The host refused audio playback
    NotAllowed,
    /// Any other host error code
    Other(String),
}

impl UtteranceError {
    /// Message to publish on the error signal, if this counts as an error
    pub fn message(&self) -> Option<String> {
        match self {
            UtteranceError::Canceled | UtteranceError::Interrupted => None,
            UtteranceError::NotAllowed => Some(PLAYBACK_NOT_ALLOWED.to_string()),
            UtteranceError::Other(code) => Some(format!("Speech error: {}", code)),
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: usize,
    epoch: u64,
    next_seq: usize,
    drain_waiter: Option<oneshot::Sender<()>>,
}

/// Pending-utterance bookkeeping shared between an engine and its player
#[derive(Clone, Debug)]
pub struct UtteranceQueue {
    inner: Arc<Mutex<QueueInner>>,
    speaking: Signal<bool>,
    error: Signal<Option<String>>,
}

impl Default for UtteranceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            speaking: Signal::new(false),
            error: Signal::new(None),
        }
    }

    /// True while an utterance is audible
    pub fn speaking(&self) -> &Signal<bool> {
        &self.speaking
    }

    /// Most recent playback error
    pub fn error(&self) -> &Signal<Option<String>> {
        &self.error
    }

    /// Number of utterances queued or playing
    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    /// Accept a sentence for playback behind whatever is already queued
    ///
    /// Blank text is dropped. Accepting clears any stale error.
    pub fn enqueue(&self, text: &str, rate: f32) -> Option<Utterance> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.error.set_if_changed(None);

        let mut inner = self.inner.lock();
        inner.pending += 1;
        let utterance = Utterance {
            text: text.to_string(),
            rate,
            epoch: inner.epoch,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;
        Some(utterance)
    }

    /// Cancel everything pending and accept one utterance to speak at once
    pub fn replace_with(&self, text: &str, rate: f32) -> Utterance {
        self.stop();
        self.error.set_if_changed(None);

        let mut inner = self.inner.lock();
        inner.pending = 1;
        let utterance = Utterance {
            text: text.trim().to_string(),
            rate,
            epoch: inner.epoch,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;
        utterance
    }

    /// Whether the utterance still belongs to the current epoch
    pub fn is_current(&self, utterance: &Utterance) -> bool {
        self.inner.lock().epoch == utterance.epoch
    }

    /// The player started speaking `utterance`
    pub fn started(&self, utterance: &Utterance) {
        if !self.is_current(utterance) {
            return;
        }
        self.speaking.set_if_changed(true);
        self.error.set_if_changed(None);
    }

    /// The player finished speaking `utterance`
    pub fn finished(&self, utterance: &Utterance) {
        self.settle(utterance);
    }

    /// The player gave up on `utterance`
    pub fn failed(&self, utterance: &Utterance, reason: &UtteranceError) {
        if !self.is_current(utterance) {
            return;
        }
        if let Some(message) = reason.message() {
            warn!("Utterance {} failed: {}", utterance.seq, message);
            self.error.set(Some(message));
        }
        self.settle(utterance);
    }

    /// Wait until no utterance is pending or playing
    ///
    /// Resolves immediately when the queue is already empty. Also resolves
    /// when the queue is stopped or another caller arms a newer waiter.
    pub async fn wait_for_drain(&self) {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.pending == 0 {
                return;
            }
            let (tx, rx) = oneshot::channel();
            if inner.drain_waiter.replace(tx).is_some() {
                debug!("Replacing outstanding drain waiter");
            }
            rx
        };
        // A dropped sender means the waiter was released early
        let _ = rx.await;
    }

    /// Hard-cancel: forget pending utterances and release the drain waiter
    pub fn stop(&self) {
        let waiter = {
            let mut inner = self.inner.lock();
            inner.pending = 0;
            inner.epoch += 1;
            inner.next_seq = 0;
            inner.drain_waiter.take()
        };
        drop(waiter);
        self.speaking.set_if_changed(false);
    }

    fn settle(&self, utterance: &Utterance) {
        let waiter = {
            let mut inner = self.inner.lock();
            if inner.epoch != utterance.epoch {
                return;
            }
            inner.pending = inner.pending.saturating_sub(1);
            if inner.pending > 0 {
                return;
            }
            inner.drain_waiter.take()
        };

        self.speaking.set_if_changed(false);
        if let Some(tx) = waiter {
            let _ = tx.send(());
        }
    }
}
