//! Send one HTTP request to the Unified Endpoint.
//!
//! Usage: cargo run --example send -- <session-json> <method> <path> <body>

use soratun::{ClientOptions, Tunnel, TunnelOptions, UnifiedEndpointHttpClient};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let [_, config_path, method, path, body] = args.as_slice() else {
        eprintln!("Usage: {} <session-json> <method> <path> <body>", args[0]);
        std::process::exit(1);
    };

    log::info!("Loading session from: {}", config_path);
    let session = soratun::parse_configuration(&std::fs::read(config_path)?)?;

    let tunnel = Arc::new(Tunnel::create(&session, TunnelOptions::default()).await?);
    if let Some(elapsed) = tunnel.time_since_last_handshake() {
        log::info!("Handshake completed {:?} ago", elapsed);
    }

    let client = UnifiedEndpointHttpClient::new(tunnel.clone(), ClientOptions::for_session(&session))?;
    let result = client.send(method, path, body).await;
    tunnel.close();

    match result {
        Ok(response) => println!("{}", response),
        Err(e) => {
            log::error!("Request failed: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
