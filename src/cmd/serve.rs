//! HTTP service command: `numberhub serve`.

use anyhow::Result;

use numberhub::config::HubConfig;
use numberhub::hub::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    mut config: HubConfig,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    start_server(ServerConfig {
        hub: config,
        dev_mode: dev,
    })
    .await
}
