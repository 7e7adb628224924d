//! Mock transport for testing
//!
//! [`MockConnector`] hands out [`MockDevice`] handles by path.  A test
//! injects inbound bytes, inspects what the hub wrote, and unplugs or
//! replugs the device to exercise the reconnect path.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{Connector, Transport};
use crate::error::LinkError;

struct DeviceState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    plugged: bool,
    /// Bumped on unplug so transports opened earlier start failing.
    generation: u64,
    opens: usize,
}

struct DeviceShared {
    state: Mutex<DeviceState>,
    wakeup: Condvar,
}

/// Test-side handle to one simulated microcontroller.
#[derive(Clone)]
pub struct MockDevice {
    shared: Arc<DeviceShared>,
}

impl MockDevice {
    fn new() -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                state: Mutex::new(DeviceState {
                    inbound: VecDeque::new(),
                    written: Vec::new(),
                    plugged: true,
                    generation: 0,
                    opens: 0,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes for the hub to read.
    pub fn inject(&self, data: &[u8]) {
        self.lock().inbound.extend(data);
        self.shared.wakeup.notify_all();
    }

    /// Every line the hub has written, in order.
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.lock().written)
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Simulate removing the device: open transports fail on their next
    /// read and new opens are refused until [`MockDevice::plug`].
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.plugged = false;
        state.generation += 1;
        state.inbound.clear();
        drop(state);
        self.shared.wakeup.notify_all();
    }

    pub fn plug(&self) {
        self.lock().plugged = true;
    }

    /// How many times the device has been opened successfully.
    pub fn opens(&self) -> usize {
        self.lock().opens
    }
}

/// Transport bound to one [`MockDevice`] generation.
pub struct MockTransport {
    device: MockDevice,
    generation: u64,
    read_timeout: Duration,
}

impl MockTransport {
    fn check_attached(&self, state: &DeviceState) -> io::Result<()> {
        if state.generation == self.generation {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device removed"))
        }
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        let mut state = self.device.lock();
        loop {
            self.check_attached(&state)?;
            if !state.inbound.is_empty() {
                let n = state.inbound.len().min(buffer.len());
                for (slot, byte) in buffer.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            state = self
                .device
                .shared
                .wakeup
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.device.lock();
        self.check_attached(&state)?;
        state.written.extend_from_slice(data);
        Ok(())
    }
}

/// Connector that opens [`MockTransport`]s for registered devices.
#[derive(Clone, Default)]
pub struct MockConnector {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `path`, created plugged-in on first use.
    pub fn device(&self, path: &str) -> MockDevice {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_insert_with(MockDevice::new)
            .clone()
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        device: &str,
        _baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn Transport>, LinkError> {
        let handle = self.device(device);
        let mut state = handle.lock();
        if !state.plugged {
            return Err(LinkError::Open {
                device: device.to_string(),
                details: "no such device".to_string(),
            });
        }
        state.opens += 1;
        let generation = state.generation;
        drop(state);
        Ok(Box::new(MockTransport {
            device: handle,
            generation,
            read_timeout,
        }))
    }
}
