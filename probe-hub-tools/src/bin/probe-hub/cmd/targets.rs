use probe_hub::HubConfig;

#[derive(clap::Parser)]
pub struct Cmd {
    /// Also list the (toolchain, probe) compose services implied by the config
    #[clap(long)]
    compose: bool,
}

impl Cmd {
    pub fn run(self, config: &HubConfig) -> anyhow::Result<()> {
        for (name, target) in &config.targets {
            println!("{name}: {}", target.description);
            for (label, interfaces) in [
                ("debug", &target.compatible_probes.debug),
                ("flash", &target.compatible_probes.flash),
                ("print", &target.compatible_probes.print),
            ] {
                if interfaces.is_empty() {
                    continue;
                }
                let list: Vec<&str> = interfaces.iter().map(|i| i.as_str()).collect();
                println!("  {label}: {}", list.join(", "));
            }
            for (interface, policy) in &target.transports {
                let allowed: Vec<&str> = policy.allowed.iter().map(|t| t.as_str()).collect();
                println!(
                    "  transports[{interface}]: default {}, allowed {}",
                    policy.default,
                    allowed.join(", ")
                );
            }
        }

        if self.compose {
            println!();
            println!("compose services:");
            for pair in config.compose_pairs() {
                println!("  {} (probe {})", pair.service, pair.probe_id);
            }
        }
        Ok(())
    }
}
