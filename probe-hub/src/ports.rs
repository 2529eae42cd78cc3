//! Deterministic port assignment.
//!
//! Every probe id owns one port per service, at `base + probe_id`. No state,
//! no bookkeeping; uniqueness of probe ids (checked at config load) makes the
//! assignment collision-free as long as the bases are spaced wider than the
//! highest probe id.

use serde::{Deserialize, Serialize};

use crate::config::Mode;

fn default_gdb_base() -> u16 {
    3330
}

fn default_telnet_base() -> u16 {
    4440
}

fn default_rtt_base() -> u16 {
    19020
}

fn default_print_base() -> u16 {
    8880
}

/// The `ports` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortsSection {
    #[serde(default = "default_gdb_base")]
    pub gdb_base: u16,
    #[serde(default = "default_telnet_base")]
    pub telnet_base: u16,
    #[serde(default = "default_rtt_base")]
    pub rtt_base: u16,
    #[serde(default = "default_print_base")]
    pub print_base: u16,
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            gdb_base: default_gdb_base(),
            telnet_base: default_telnet_base(),
            rtt_base: default_rtt_base(),
            print_base: default_print_base(),
        }
    }
}

/// The TCP ports owned by one probe for the duration of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionPorts {
    pub gdb: u16,
    pub telnet: u16,
    pub rtt: u16,
    pub print: u16,
}

impl SessionPorts {
    /// The port whose client connections define session liveness.
    pub fn primary(&self, mode: Mode) -> u16 {
        match mode {
            Mode::Print => self.print,
            _ => self.gdb,
        }
    }
}

impl PortsSection {
    pub fn allocate(&self, probe_id: u16) -> SessionPorts {
        SessionPorts {
            gdb: self.gdb_base + probe_id,
            telnet: self.telnet_base + probe_id,
            rtt: self.rtt_base + probe_id,
            print: self.print_base + probe_id,
        }
    }

    pub(crate) fn bases(&self) -> [(&'static str, u16); 4] {
        [
            ("gdb_base", self.gdb_base),
            ("telnet_base", self.telnet_base),
            ("rtt_base", self.rtt_base),
            ("print_base", self.print_base),
        ]
    }
}
