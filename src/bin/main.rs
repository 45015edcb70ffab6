use std::env;
use std::time::Duration;

use rtmfp::{RtmfpServer, ServerSettings};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = load_config()?;
    log::info!(
        "Starting RTMFP server on {}:{} (sweep every {:?})",
        settings.address,
        settings.port,
        settings.manage_interval
    );

    let server = RtmfpServer::new(settings);
    server.run().await?;
    Ok(())
}

fn load_config() -> Result<ServerSettings, Box<dyn std::error::Error>> {
    let defaults = ServerSettings::default();

    Ok(ServerSettings {
        port: env::var("RTMFP_PORT")
            .unwrap_or_else(|_| defaults.port.to_string())
            .parse()?,
        address: env::var("RTMFP_ADDRESS").unwrap_or_else(|_| defaults.address.clone()),
        manage_interval: env_duration_secs("RTMFP_MANAGE_INTERVAL", defaults.manage_interval),
        connection_timeout: env_duration_secs("RTMFP_CONNECTION_TIMEOUT", defaults.connection_timeout),
        handshake_timeout: env_duration_secs("RTMFP_HANDSHAKE_TIMEOUT", defaults.handshake_timeout),
        group_timeout: env_duration_secs("RTMFP_GROUP_TIMEOUT", defaults.group_timeout),
        keepalive_interval: env_duration_secs("RTMFP_KEEPALIVE_INTERVAL", defaults.keepalive_interval),
        max_keepalives: env::var("RTMFP_MAX_KEEPALIVES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_keepalives),
        server_keepalive_ms: defaults.server_keepalive_ms,
        client_keepalive_ms: defaults.client_keepalive_ms,
        auth: env::var("RTMFP_AUTH")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    })
}

fn env_duration_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
