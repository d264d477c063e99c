use rtp_engine::application::{Endpoint, EndpointHandle};
use rtp_engine::config::EngineConfig;
use rtp_engine::infrastructure::media::SessionKey;
use rtp_engine::infrastructure::metrics::init_metrics;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// PCMU silence
const SILENCE: u8 = 0xFF;
/// Samples per millisecond at 8 kHz
const SAMPLES_PER_MS: usize = 8;

/// Usage: rtp-engine [config.toml] [remote-rtp-address]
///
/// With a remote address, streams silence to it until Ctrl-C.
/// Without one, runs a short loopback call between two local endpoints.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting rtp-engine v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let remote: Option<SocketAddr> = args.next().map(|a| a.parse()).transpose()?;

    // Load configuration
    let config = EngineConfig::load(config_path.as_deref())?;
    info!("Configuration loaded: {:?}", config);

    if let Some(listen) = config.endpoint.metrics_listen {
        info!("Initializing Prometheus metrics exporter on {}", listen);
        init_metrics(listen)?;
    }

    match remote {
        Some(remote) => stream_to(config, remote).await,
        None => demo_loopback(config).await,
    }
}

fn silence(config: &EngineConfig) -> Bytes {
    let samples = SAMPLES_PER_MS * config.rtp.packetization_ms as usize;
    Bytes::from(vec![SILENCE; samples])
}

async fn stream_to(config: EngineConfig, remote: SocketAddr) -> anyhow::Result<()> {
    let payload = silence(&config);
    let mut ticker = tokio::time::interval(config.packetization());
    let (endpoint, handle, mut deliveries) = Endpoint::bind(config).await?;
    let task = tokio::spawn(endpoint.run());

    let key = handle.create_session(remote, true).await?;
    info!("Streaming to {} (session {}), press Ctrl-C to stop", remote, key);

    loop {
        tokio::select! {
            _ = ticker.tick() => handle.send_payload(key, payload.clone()).await?,
            Some(delivery) = deliveries.recv() => {
                tracing::debug!("{} bytes from {}", delivery.payload.len(), delivery.source);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down...");
    print_stats(&handle, key).await;
    handle.terminate(key).await?;
    handle.shutdown();
    task.await??;
    Ok(())
}

async fn demo_loopback(config: EngineConfig) -> anyhow::Result<()> {
    info!("=== Loopback Call Demo ===");

    let mut local = config.clone();
    local.endpoint.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
    local.endpoint.rtp_port = 0;

    let (alice, alice_handle, _alice_rx) = Endpoint::bind(local.clone()).await?;
    let (bob, bob_handle, mut bob_rx) = Endpoint::bind(local).await?;
    let alice_task = tokio::spawn(alice.run());
    let bob_task = tokio::spawn(bob.run());

    let to_bob = alice_handle
        .create_session(bob_handle.local_rtp(), true)
        .await?;
    let to_alice = bob_handle
        .create_session(alice_handle.local_rtp(), false)
        .await?;
    info!("Sessions created: {} and {}", to_bob, to_alice);

    let payload = silence(&config);
    let mut ticker = tokio::time::interval(config.packetization());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    let mut delivered = 0usize;

    while tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = ticker.tick() => alice_handle.send_payload(to_bob, payload.clone()).await?,
            Some(_) = bob_rx.recv() => delivered += 1,
        }
    }
    info!("Bob received {} payloads", delivered);

    print_stats(&bob_handle, to_alice).await;
    let stats = alice_handle.terminate(to_bob).await?;
    info!("Alice final statistics:\n{}", stats.to_json()?);

    alice_handle.shutdown();
    bob_handle.shutdown();
    alice_task.await??;
    bob_task.await??;

    info!("=== Loopback Call Demo Complete ===");
    Ok(())
}

async fn print_stats(handle: &EndpointHandle, key: SessionKey) {
    match handle.stats(key).await {
        Ok(stats) => match stats.to_json() {
            Ok(json) => info!("Session {} statistics:\n{}", key, json),
            Err(e) => warn!("Failed to render statistics: {}", e),
        },
        Err(e) => warn!("No statistics for {}: {}", key, e),
    }
}
