//! Stream multiplexer
//!
//! Grants each physical audio device to at most one holder at a time. The
//! holder may attach the subprocess that actually opens the device; the
//! multiplexer kills it on release or preemption so no device handle outlives
//! its lease.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use super::lease::{AudioDevice, ConflictPolicy, LeaseInfo, Purpose, StreamLease};
use crate::utils::error::{AppError, AppResult};

struct Holder {
    lease: StreamLease,
    process: Option<Child>,
}

#[derive(Default)]
struct Slot {
    holder: Option<Holder>,
    failed_at: Option<Instant>,
    failure: Option<String>,
}

impl Slot {
    fn held_by(&self, lease: &StreamLease) -> bool {
        self.holder
            .as_ref()
            .map_or(false, |h| h.lease.id() == lease.id())
    }
}

#[derive(Default)]
struct Slots {
    microphone: Slot,
    speaker: Slot,
}

impl Slots {
    fn get(&self, device: AudioDevice) -> &Slot {
        match device {
            AudioDevice::Microphone => &self.microphone,
            AudioDevice::Speaker => &self.speaker,
        }
    }

    fn get_mut(&mut self, device: AudioDevice) -> &mut Slot {
        match device {
            AudioDevice::Microphone => &mut self.microphone,
            AudioDevice::Speaker => &mut self.speaker,
        }
    }
}

/// Current holder and last failure of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLeaseStatus {
    pub device: AudioDevice,
    pub holder: Option<LeaseInfo>,
    pub last_failure: Option<String>,
}

/// Stop a child that may already have exited
fn stop_child(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn busy(device: AudioDevice, holder: &StreamLease) -> AppError {
    AppError::ResourceBusy(format!("{} is in use for {}", device, holder.purpose()))
}

pub struct StreamMultiplexer {
    backoff: Duration,
    slots: Mutex<Slots>,
    released: Condvar,
}

impl StreamMultiplexer {
    /// `backoff` is the minimum wait after a failed device open
    pub fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            slots: Mutex::new(Slots::default()),
            released: Condvar::new(),
        }
    }

    fn check_backoff(&self, slot: &Slot, device: AudioDevice) -> AppResult<()> {
        if let Some(failed_at) = slot.failed_at {
            let elapsed = failed_at.elapsed();
            if elapsed < self.backoff {
                return Err(AppError::ResourceBusy(format!(
                    "{} failed {}ms ago ({}), retry in {}ms",
                    device,
                    elapsed.as_millis(),
                    slot.failure.as_deref().unwrap_or("unknown error"),
                    (self.backoff - elapsed).as_millis()
                )));
            }
        }
        Ok(())
    }

    /// Acquire `device` for `purpose`, resolving conflicts with `policy`
    pub fn acquire(
        &self,
        device: AudioDevice,
        purpose: Purpose,
        policy: ConflictPolicy,
    ) -> AppResult<StreamLease> {
        let mut slots = self.slots.lock();
        self.check_backoff(slots.get(device), device)?;

        match policy {
            ConflictPolicy::Reject => {
                if let Some(holder) = &slots.get(device).holder {
                    return Err(busy(device, &holder.lease));
                }
            }
            ConflictPolicy::Wait { timeout } => {
                let deadline = Instant::now() + timeout;
                while slots.get(device).holder.is_some() {
                    if self.released.wait_until(&mut slots, deadline).timed_out() {
                        if let Some(holder) = &slots.get(device).holder {
                            return Err(busy(device, &holder.lease));
                        }
                    }
                }
            }
            ConflictPolicy::Preempt { grace } => {
                let victim = slots.get_mut(device).holder.as_mut().map(|holder| {
                    holder.lease.revoke();
                    if let Some(mut child) = holder.process.take() {
                        stop_child(&mut child);
                    }
                    holder.lease.clone()
                });

                if let Some(victim) = victim {
                    tracing::info!(
                        "Preempting {} on {} for {}",
                        victim.purpose(),
                        device,
                        purpose
                    );
                    let deadline = Instant::now() + grace;
                    while slots.get(device).held_by(&victim) {
                        if self.released.wait_until(&mut slots, deadline).timed_out() {
                            break;
                        }
                    }
                    let slot = slots.get_mut(device);
                    if slot.held_by(&victim) {
                        tracing::warn!(
                            "{} did not release {} within {:?}, force-clearing",
                            victim.purpose(),
                            device,
                            grace
                        );
                        slot.holder = None;
                    }
                }
            }
        }

        let lease = StreamLease::new(device, purpose);
        slots.get_mut(device).holder = Some(Holder {
            lease: lease.clone(),
            process: None,
        });
        tracing::debug!("Granted {} to {} ({})", device, purpose, lease.id());
        Ok(lease)
    }

    /// Release a lease. Idempotent; a stale or revoked lease is a no-op.
    ///
    /// Returns whether the device was actually freed.
    pub fn release(&self, lease: &StreamLease) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(lease.device());
        if !slot.held_by(lease) {
            return false;
        }

        if let Some(mut holder) = slot.holder.take() {
            if let Some(mut child) = holder.process.take() {
                stop_child(&mut child);
            }
        }
        self.released.notify_all();
        tracing::debug!("Released {} from {}", lease.device(), lease.purpose());
        true
    }

    /// Release after a device failure and start the retry backoff
    pub fn report_failure(&self, lease: &StreamLease, reason: &str) {
        self.release(lease);
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(lease.device());
        slot.failed_at = Some(Instant::now());
        slot.failure = Some(reason.to_string());
        tracing::warn!("{} failed for {}: {}", lease.device(), lease.purpose(), reason);
    }

    /// Hand the subprocess that opened the device to the multiplexer.
    ///
    /// If the lease was revoked in the meantime the process is stopped at once.
    pub fn attach_process(&self, lease: &StreamLease, mut child: Child) -> AppResult<()> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(lease.device());
        match slot.holder.as_mut() {
            Some(holder) if holder.lease.id() == lease.id() && !lease.is_revoked() => {
                if let Some(mut previous) = holder.process.replace(child) {
                    stop_child(&mut previous);
                }
                Ok(())
            }
            _ => {
                stop_child(&mut child);
                Err(AppError::ResourceBusy(format!(
                    "{} lease for {} was revoked",
                    lease.device(),
                    lease.purpose()
                )))
            }
        }
    }

    /// Wait for the lease's attached process to exit, killing it after `timeout`
    pub fn wait_process(&self, lease: &StreamLease, timeout: Duration) -> AppResult<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut slots = self.slots.lock();
                let slot = slots.get_mut(lease.device());
                let holder = match slot.holder.as_mut() {
                    Some(holder) if holder.lease.id() == lease.id() => holder,
                    _ => {
                        return Err(AppError::ResourceBusy(format!(
                            "{} lease for {} was revoked",
                            lease.device(),
                            lease.purpose()
                        )))
                    }
                };
                let Some(child) = holder.process.as_mut() else {
                    return Err(AppError::InvalidArgument(format!(
                        "no process attached to {} lease",
                        lease.device()
                    )));
                };

                if let Some(status) = child.try_wait()? {
                    holder.process = None;
                    return Ok(status);
                }
                if Instant::now() >= deadline {
                    stop_child(child);
                    holder.process = None;
                    return Err(AppError::ProtocolTimeout(format!(
                        "{} process did not finish within {:?}",
                        lease.purpose(),
                        timeout
                    )));
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Current holder of `device`
    pub fn holder(&self, device: AudioDevice) -> Option<LeaseInfo> {
        self.slots
            .lock()
            .get(device)
            .holder
            .as_ref()
            .map(|h| h.lease.info())
    }

    pub fn status(&self) -> Vec<DeviceLeaseStatus> {
        let slots = self.slots.lock();
        [AudioDevice::Microphone, AudioDevice::Speaker]
            .into_iter()
            .map(|device| {
                let slot = slots.get(device);
                DeviceLeaseStatus {
                    device,
                    holder: slot.holder.as_ref().map(|h| h.lease.info()),
                    last_failure: slot.failure.clone(),
                }
            })
            .collect()
    }

    /// Revoke and release every lease
    pub fn release_all(&self) {
        let mut slots = self.slots.lock();
        for device in [AudioDevice::Microphone, AudioDevice::Speaker] {
            if let Some(mut holder) = slots.get_mut(device).holder.take() {
                holder.lease.revoke();
                if let Some(mut child) = holder.process.take() {
                    stop_child(&mut child);
                }
            }
        }
        self.released.notify_all();
    }
}
