use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::cancel::Cancellation;

/// Host-assigned name of a serial device, e.g. "/dev/ttyUSB0" or "COM3".
pub type DeviceIdentifier = String;

/// The set of devices visible at one instant. BTreeSet gives us a stable
/// (lexicographic) iteration order, which is what we use to break ties when
/// several devices appear at once.
pub type PortSnapshot = BTreeSet<DeviceIdentifier>;

#[derive(Debug)]
pub struct EnumerationError {
    pub reason: String,
}

impl std::fmt::Display for EnumerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unable to enumerate serial ports: {}", self.reason)
    }
}

impl std::error::Error for EnumerationError {}

pub trait PortRegistry {
    fn list_ports(&self) -> Result<PortSnapshot, EnumerationError>;
}

/// SystemPorts enumerates ports via the OS (through serialport).
pub struct SystemPorts;

impl PortRegistry for SystemPorts {
    fn list_ports(&self) -> Result<PortSnapshot, EnumerationError> {
        match serialport::available_ports() {
            Ok(ports) => Ok(ports.into_iter().map(|port| port.port_name).collect()),
            Err(e) => Err(EnumerationError {
                reason: e.to_string(),
            }),
        }
    }
}

#[derive(Debug)]
pub enum HotplugError {
    Enumeration(EnumerationError),
    TimedOut(Duration),
    Cancelled,
}

impl std::fmt::Display for HotplugError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HotplugError::Enumeration(e) => e.fmt(f),
            HotplugError::TimedOut(timeout) => write!(
                f,
                "no new serial device appeared within {:.1}s",
                timeout.as_secs_f64()
            ),
            HotplugError::Cancelled => write!(f, "cancelled while waiting for a new device"),
        }
    }
}

impl std::error::Error for HotplugError {}

impl From<EnumerationError> for HotplugError {
    fn from(e: EnumerationError) -> Self {
        HotplugError::Enumeration(e)
    }
}

/// Returns the (lexicographically) first identifier in `current` that isn't
/// in `baseline`.
pub fn first_new_port(baseline: &PortSnapshot, current: &PortSnapshot) -> Option<DeviceIdentifier> {
    current.difference(baseline).next().cloned()
}

/// Polls `registry` until a port that isn't part of `baseline` shows up.
///
/// Hardware enumeration gives us no notifications, so this is a plain
/// bounded-frequency poll. Without a `timeout` this blocks until a device
/// appears or `cancellation` is tripped.
pub fn wait_for_new_port(
    registry: &dyn PortRegistry,
    baseline: &PortSnapshot,
    poll_interval: Duration,
    timeout: Option<Duration>,
    cancellation: &Cancellation,
) -> Result<DeviceIdentifier, HotplugError> {
    info!("Waiting for new serial device to be plugged in...");
    // A timeout too large to represent as a deadline never expires.
    let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
    loop {
        if cancellation.is_cancelled() {
            return Err(HotplugError::Cancelled);
        }
        let current = registry.list_ports()?;
        if let Some(port) = first_new_port(baseline, &current) {
            return Ok(port);
        }
        debug!("no new ports yet ({} visible)", current.len());

        let mut sleep_for = poll_interval;
        if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
            let now = Instant::now();
            if now >= deadline {
                return Err(HotplugError::TimedOut(timeout));
            }
            sleep_for = std::cmp::min(sleep_for, deadline - now);
        }
        if cancellation.sleep(sleep_for) {
            return Err(HotplugError::Cancelled);
        }
    }
}
