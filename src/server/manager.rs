//! Fixed pool of virtual modems

use std::path::Path;

use super::device::{Device, DeviceError, DeviceState};
use crate::hylafax::FaxqNotifier;

/// Device names are this prefix plus the pool index
pub const MODEM_PREFIX: &str = "freeswitch";

pub struct DeviceManager {
    devices: Vec<Device>,
}

impl DeviceManager {
    /// Start `count` devices named `<prefix>0..<prefix>N-1`
    ///
    /// If any device fails to start, the ones already running are set down.
    pub fn new(
        prefix: &str,
        count: u32,
        spool: &Path,
        faxq: &FaxqNotifier,
    ) -> Result<Self, DeviceError> {
        let mut devices = Vec::with_capacity(count as usize);
        for i in 0..count {
            match Device::spawn(&format!("{}{}", prefix, i), spool, faxq.clone()) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    for device in &devices {
                        device.set_down();
                    }
                    return Err(e);
                }
            }
        }
        tracing::info!("Started {} virtual modems", devices.len());
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// First ready device in pool order, now marked busy with `reason`
    pub async fn allocate(&self, reason: &str) -> Result<Device, DeviceError> {
        for device in &self.devices {
            if device.try_acquire(reason).await? {
                return Ok(device.clone());
            }
        }
        Err(DeviceError::NoneAvailable)
    }

    /// Name of the device `allocate` would pick right now, without taking it
    pub async fn next_ready(&self) -> Option<String> {
        for device in &self.devices {
            if let Ok(DeviceState::Ready) = device.state().await {
                return Some(device.name().to_string());
            }
        }
        None
    }

    /// Take every device down and wait until all have processed it
    pub async fn set_all_down(&self) {
        for device in &self.devices {
            device.set_down();
        }
        for device in &self.devices {
            if let Err(e) = device.state().await {
                tracing::warn!("{}", e);
            }
        }
    }
}
