use std::sync::Arc;

use probe_hub::{Hub, HubConfig};

#[derive(clap::Parser)]
pub struct Cmd {
    /// Override the configured bind address
    #[clap(long)]
    address: Option<String>,

    /// Override the configured HTTP port
    #[clap(long, short)]
    port: Option<u16>,
}

impl Cmd {
    pub async fn run(self, config: HubConfig) -> anyhow::Result<()> {
        let address = self
            .address
            .unwrap_or_else(|| config.server.address.clone());
        let port = self.port.unwrap_or(config.server.port);

        tracing::info!(
            probes = config.probes.len(),
            targets = config.targets.len(),
            "starting probe hub"
        );

        let hub = Arc::new(Hub::new(config));
        probe_hub::server::serve(hub, &address, port).await
    }
}
