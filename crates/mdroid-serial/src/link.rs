//! [`SerialLink`] – one microcontroller connection.
//!
//! A link walks `Closed → Opening → Reading → Closed`.  It never goes back
//! from `Reading` to `Opening` on its own; after a failure the
//! [`LinkManager`](crate::manager::LinkManager) builds a fresh link once the
//! reconnect backoff has elapsed.
//!
//! While `Reading`, every cycle first writes at most one queued command (only
//! when this link holds the writer role) and then blocks on one inbound
//! read, so outgoing commands are never starved by a busy inbound stream.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mdroid_store::StateStore;
use mdroid_types::Message;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::{FrameReader, apply_frame};
use crate::error::LinkError;
use crate::transport::Transport;

const READ_CHUNK: usize = 1024;

/// Lifecycle state of a [`SerialLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Reading,
}

/// A single serial connection and its outbound command queue.
///
/// The queue is only ever filled through
/// [`LinkManager::route`](crate::manager::LinkManager::route).
#[derive(Debug)]
pub struct SerialLink {
    device: String,
    baud_rate: u32,
    state: Mutex<LinkState>,
    outbound: Mutex<VecDeque<Message>>,
}

impl SerialLink {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            state: Mutex::new(LinkState::Closed),
            outbound: Mutex::new(VecDeque::new()),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, next: LinkState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(device = %self.device, from = ?*state, to = ?next, "link state");
        *state = next;
    }

    // -----------------------------------------------------------------------
    // Outbound queue
    // -----------------------------------------------------------------------

    pub(crate) fn enqueue(&self, message: Message) {
        debug!(device = %self.device, command = %message.text, id = %message.id, "command queued");
        self.queue().push_back(message);
    }

    /// Texts of the commands still waiting for the wire, oldest first.
    pub fn queued(&self) -> Vec<String> {
        self.queue().iter().map(|m| m.text.clone()).collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue().len()
    }

    /// Oldest command that has not passed its deadline.  Expired commands
    /// in front of it are discarded.
    fn pop_sendable(&self) -> Option<Message> {
        let mut queue = self.queue();
        while let Some(message) = queue.pop_front() {
            if message.is_expired() {
                warn!(
                    device = %self.device,
                    command = %message.text,
                    awaiting_ack = message.awaiting_ack,
                    "command expired before send; dropped"
                );
                continue;
            }
            return Some(message);
        }
        None
    }

    /// Empty the queue, returning whatever had not been sent.
    pub(crate) fn drain(&self) -> Vec<Message> {
        self.queue().drain(..).collect()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Read loop
    // -----------------------------------------------------------------------

    /// Run the read loop on `transport` until `stop` flips to `true`
    /// (returns `Ok`) or the transport fails (returns the error).
    ///
    /// Blocking: call from a blocking thread.  Undecodable input is logged
    /// and skipped; it never ends the loop.
    pub fn run(
        &self,
        transport: &mut dyn Transport,
        store: &StateStore,
        is_writer: &dyn Fn() -> bool,
        stop: &watch::Receiver<bool>,
    ) -> Result<(), LinkError> {
        self.set_state(LinkState::Reading);
        info!(device = %self.device, baud = self.baud_rate, "link reading");

        let mut reader = FrameReader::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if *stop.borrow() {
                info!(device = %self.device, "link stopped");
                return Ok(());
            }

            if is_writer()
                && let Some(message) = self.pop_sendable()
            {
                let mut line = message.text.into_bytes();
                line.push(b'\n');
                transport.write_all(&line)?;
                debug!(device = %self.device, id = %message.id, awaiting_ack = message.awaiting_ack, "command written");
            }

            let read = transport.read(&mut chunk)?;
            if read == 0 {
                continue;
            }
            reader.push(&chunk[..read]);
            while let Some(frame) = reader.next_frame() {
                match frame {
                    Ok(frame) => {
                        apply_frame(store, &frame, &self.device);
                    }
                    Err(e) => warn!(device = %self.device, error = %e, "undecodable input"),
                }
            }
        }
    }
}
