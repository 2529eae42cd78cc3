//! Probe inventory: what is actually plugged in.
//!
//! Enumerates the host USB bus and joins the result against the configured
//! probe catalog. The join key is the vendor serial; probes configured
//! without one fall back to a VID/PID match. The bus view is behind a trait
//! so tests and the CLI can substitute a canned source.

use std::fmt;

use nusb::MaybeFuture;
use serde::Serialize;

use crate::config::{HubConfig, ProbeInterface, ProbeSpec, UsbId};

/// One attached USB device, reduced to the attributes we join on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub vid: u16,
    pub pid: u16,
    pub serial: Option<String>,
}

/// A view of the host USB bus.
pub trait UsbSource: fmt::Debug + Send + Sync {
    fn devices(&self) -> Vec<UsbDevice>;
}

/// The real bus view.
#[derive(Debug, Default)]
pub struct NusbSource;

impl UsbSource for NusbSource {
    fn devices(&self) -> Vec<UsbDevice> {
        let devices = match nusb::list_devices().wait() {
            Ok(devices) => devices,
            Err(error) => {
                tracing::warn!("listing USB devices failed: {error}");
                return Vec::new();
            }
        };

        devices
            .map(|device| UsbDevice {
                vid: device.vendor_id(),
                pid: device.product_id(),
                serial: device.serial_number().map(str::to_string),
            })
            .collect()
    }
}

/// How a configured probe was matched to an attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Serial,
    VidPid,
    None,
}

/// Status record for one configured probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub id: u16,
    pub name: String,
    pub interface: ProbeInterface,
    pub connected: bool,
    pub observed_serial: Option<String>,
    pub expected_serial: Option<String>,
    #[serde(rename = "match")]
    pub matched: MatchKind,
}

/// Joins the configured catalog with the live bus view.
#[derive(Debug)]
pub struct Inventory {
    source: Box<dyn UsbSource>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        Self {
            source: Box::new(NusbSource),
        }
    }

    pub fn with_source(source: Box<dyn UsbSource>) -> Self {
        Self { source }
    }

    /// Status records for every configured probe, in config order.
    #[tracing::instrument(skip_all)]
    pub fn status(&self, config: &HubConfig) -> Vec<ProbeStatus> {
        let devices = self.source.devices();
        config
            .probes
            .iter()
            .map(|probe| join_probe(probe, &devices))
            .collect()
    }

    /// Status for one probe id, if configured.
    pub fn status_of(&self, config: &HubConfig, probe_id: u16) -> Option<ProbeStatus> {
        let probe = config.probe(probe_id)?;
        Some(join_probe(probe, &self.source.devices()))
    }

    /// Status records matching a filter, AND-combined.
    pub fn search(&self, config: &HubConfig, filter: &SearchFilter) -> Vec<ProbeStatus> {
        let devices = self.source.devices();
        config
            .probes
            .iter()
            .filter(|probe| filter.matches(probe))
            .map(|probe| join_probe(probe, &devices))
            .collect()
    }
}

fn join_probe(probe: &ProbeSpec, devices: &[UsbDevice]) -> ProbeStatus {
    let matched_device = match &probe.serial {
        Some(expected) => devices.iter().find(|d| {
            d.vid == probe.vid.0 && d.pid == probe.pid.0 && d.serial.as_deref() == Some(expected)
        }),
        None => devices
            .iter()
            .find(|d| d.vid == probe.vid.0 && d.pid == probe.pid.0),
    };

    let matched = match (&probe.serial, matched_device) {
        (_, None) => MatchKind::None,
        (Some(_), Some(_)) => MatchKind::Serial,
        (None, Some(_)) => MatchKind::VidPid,
    };

    ProbeStatus {
        id: probe.id,
        name: probe.name.clone(),
        interface: probe.interface,
        connected: matched_device.is_some(),
        observed_serial: matched_device.and_then(|d| d.serial.clone()),
        expected_serial: probe.serial.clone(),
        matched,
    }
}

/// Search filters over the configured catalog. All present fields must
/// match; `name` is a case-insensitive substring, VID/PID are numeric.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub interface: Option<ProbeInterface>,
    pub vid: Option<UsbId>,
    pub pid: Option<UsbId>,
    pub serial: Option<String>,
    pub name: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, probe: &ProbeSpec) -> bool {
        if self.interface.is_some_and(|i| i != probe.interface) {
            return false;
        }
        if self.vid.is_some_and(|vid| vid != probe.vid) {
            return false;
        }
        if self.pid.is_some_and(|pid| pid != probe.pid) {
            return false;
        }
        if let Some(serial) = &self.serial {
            if probe.serial.as_deref() != Some(serial.as_str()) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !probe.name.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        true
    }
}
