use colored::Colorize;

use probe_hub::inventory::Inventory;
use probe_hub::HubConfig;

#[derive(clap::Parser)]
pub struct Cmd {
    /// Emit machine-readable JSON instead of a table
    #[clap(long)]
    json: bool,
}

impl Cmd {
    pub fn run(self, config: &HubConfig) -> anyhow::Result<()> {
        let inventory = Inventory::new();
        let status = inventory.status(config);

        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }

        if status.is_empty() {
            println!("No probes configured.");
            return Ok(());
        }

        for probe in &status {
            let state = if probe.connected {
                match probe.observed_serial.as_deref() {
                    Some(serial) => format!("connected (serial {serial})").green(),
                    None => "connected".green(),
                }
            } else {
                "disconnected".red()
            };
            println!(
                "[{}]: {} ({}) {}",
                probe.id, probe.name, probe.interface, state
            );
        }
        Ok(())
    }
}
