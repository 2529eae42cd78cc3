use colored::Colorize;

use probe_hub::config::{ProbeInterface, UsbId};
use probe_hub::inventory::{Inventory, SearchFilter};
use probe_hub::HubConfig;

#[derive(clap::Parser)]
pub struct Cmd {
    /// Only probes with this interface kind (e.g. jlink, cmsis-dap)
    #[clap(long)]
    interface: Option<ProbeInterface>,

    /// Only probes with this USB vendor id (hex, `0x` optional)
    #[clap(long)]
    vid: Option<UsbId>,

    /// Only probes with this USB product id (hex, `0x` optional)
    #[clap(long)]
    pid: Option<UsbId>,

    /// Only the probe with this exact serial
    #[clap(long)]
    serial: Option<String>,

    /// Only probes whose name contains this string (case-insensitive)
    #[clap(long)]
    name: Option<String>,

    /// Emit machine-readable JSON instead of a table
    #[clap(long)]
    json: bool,
}

impl Cmd {
    /// Returns whether anything matched, for the exit code.
    pub fn run(self, config: &HubConfig) -> anyhow::Result<bool> {
        let filter = SearchFilter {
            interface: self.interface,
            vid: self.vid,
            pid: self.pid,
            serial: self.serial,
            name: self.name,
        };

        let inventory = Inventory::new();
        let matches = inventory.search(config, &filter);

        if self.json {
            println!("{}", serde_json::to_string_pretty(&matches)?);
            return Ok(!matches.is_empty());
        }

        if matches.is_empty() {
            println!("No matching probes.");
            return Ok(false);
        }

        for probe in &matches {
            let state = if probe.connected {
                "connected".green()
            } else {
                "disconnected".red()
            };
            println!(
                "[{}]: {} ({}) {}",
                probe.id, probe.name, probe.interface, state
            );
        }
        Ok(true)
    }
}
