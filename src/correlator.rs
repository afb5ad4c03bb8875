//! Matches inbound status frames to outstanding requests.
//!
//! The device echoes the command byte of every command it answers, so a
//! response is correlated to its request purely by that byte. At most one
//! waiter may be registered per command byte at a time; registering a second
//! replaces the first (its receiver resolves as closed). The streaming loop
//! never has two requests of the same command in flight, so the single-slot
//! table is an invariant enforced by sequencing, not by the table itself.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::protocol::StatusFrame;

pub struct ResponseCorrelator {
    pending: Mutex<HashMap<u8, SyncSender<StatusFrame>>>,
}

/// A registered waiter for one command's response.
///
/// Dropping a pending response (including implicitly after a timed-out
/// `wait`) removes its registration from the table.
pub struct PendingResponse<'a> {
    correlator: &'a ResponseCorrelator,
    command: u8,
    rx: Receiver<StatusFrame>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a waiter for the next response echoing `command`.
    ///
    /// Register before writing the command to the socket, otherwise a fast
    /// response can arrive with no waiter in place.
    pub fn register(&self, command: u8) -> PendingResponse<'_> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.pending.lock().unwrap().insert(command, tx);
        PendingResponse {
            correlator: self,
            command,
            rx,
        }
    }

    /// Completes the waiter matching this frame's command echo, if any.
    ///
    /// Frames with no matching waiter are simply dropped here; passive
    /// status tracking happens before dispatch reaches the correlator.
    pub fn complete(&self, frame: StatusFrame) {
        let waiter = self.pending.lock().unwrap().remove(&frame.command);
        if let Some(tx) = waiter {
            // The receiver may have timed out and gone away already.
            let _ = tx.send(frame);
        }
    }

    /// Drops every outstanding waiter so each resolves as `ConnectionClosed`.
    pub fn fail_all(&self) {
        self.pending.lock().unwrap().clear();
    }

    fn remove(&self, command: u8) {
        self.pending.lock().unwrap().remove(&command);
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingResponse<'_> {
    /// Blocks until the correlated response arrives or the deadline passes.
    ///
    /// Whichever of completion and timeout happens first wins; the loser's
    /// registration is removed.
    pub fn wait(self, timeout: Duration) -> Result<StatusFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::ResponseTimeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    /// Like [`wait`](Self::wait), but against an absolute deadline.
    ///
    /// Several waiters can share one deadline this way; a frame that was
    /// already completed into the channel still resolves even when the
    /// deadline has passed.
    pub fn wait_until(self, deadline: Instant) -> Result<StatusFrame> {
        self.wait(deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.correlator.remove(self.command);
    }
}
