//! OMM tunnel stream demo
//!
//! Runs a queue consumer and a queue provider back to back over an
//! in-memory transport and exchanges queue messages through a tunnel
//! stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omm_tunnel_auth::{JwtClaims, JwtValidator};
use omm_tunnel_client::{
    ClientConfig, DriverHandle, QueueMsgProducer, QueuePayload, Reactor, ReactorDriver,
    ReactorEvent, TunnelSessionConfig,
};
use omm_tunnel_proto::{DirectoryUpdate, NackCode, ServiceEntry, ServiceState};
use omm_tunnel_session::AckPolicy;
use omm_tunnel_transport::MemoryTransport;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Service id the demo provider publishes in its directory
const DEMO_SERVICE_ID: u16 = 1;

/// OMM tunnel - tunnel streams and queue messaging
#[derive(Parser, Debug)]
#[command(name = "omm-tunnel")]
#[command(about = "OMM tunnel - tunnel streams and queue messaging")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "OMM_TUNNEL_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a consumer and a provider back to back and exchange queue messages
    Demo {
        /// YAML client configuration (defaults are used when absent)
        #[arg(long, env = "OMM_TUNNEL_CONFIG")]
        config: Option<PathBuf>,

        /// Destination queue; repeat for several (overrides the configuration)
        #[arg(long = "destination")]
        destinations: Vec<String>,

        /// Stop after this many seconds (0 = run until Ctrl+C)
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Authenticate the tunnel with a JWT signed by this secret
        #[arg(long, env = "OMM_TUNNEL_JWT_SECRET")]
        jwt_secret: Option<String>,

        /// Let the provider acknowledge queue messages itself, rejecting
        /// every fifth one
        #[arg(long)]
        manual_ack: bool,
    },
    /// Print the default client configuration as YAML
    Config,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn default_config() -> Result<ClientConfig> {
    let tunnel = TunnelSessionConfig::builder()
        .name("QueueConsumer")
        .service_name("DIRECT_FEED")
        .queue_source_name("QUEUE_A")
        .build()
        .map_err(anyhow::Error::msg)?;

    ClientConfig::builder()
        .tunnel(tunnel)
        .destination("QUEUE_B")
        .build()
        .map_err(anyhow::Error::msg)
}

#[derive(Debug, Default)]
struct DemoStats {
    received: usize,
    acked: usize,
    nacked: usize,
    expired: usize,
}

async fn on_provider_event(
    event: ReactorEvent,
    provider: &DriverHandle<MemoryTransport>,
    provider_config: &TunnelSessionConfig,
    stats: &mut DemoStats,
) -> Result<()> {
    match event {
        ReactorEvent::TunnelRequest(request) => {
            info!(
                stream_id = %request.stream_id,
                name = %request.name,
                service_id = request.service_id,
                "Accepting tunnel stream"
            );
            let config = provider_config.clone();
            let result = provider
                .call(move |reactor, _| reactor.accept(request.stream_id, config))
                .await
                .context("Provider driver stopped")?;
            if let Err(e) = result {
                warn!("Tunnel stream rejected: {}", e);
            }
        }
        ReactorEvent::QueueData {
            stream_id,
            data,
            ack_required,
        } => {
            stats.received += 1;
            match serde_json::from_slice::<QueuePayload>(&data.payload) {
                Ok(payload) => info!(
                    identifier = data.identifier,
                    from = %data.source_name,
                    "Queue message #{}: {}",
                    payload.sequence,
                    payload.text
                ),
                Err(_) => info!(identifier = data.identifier, "Queue message ({} bytes)", data.payload.len()),
            }

            if ack_required {
                let identifier = data.identifier;
                let result = if identifier % 5 == 0 {
                    provider
                        .call(move |reactor, _| {
                            reactor.nack(stream_id, identifier, NackCode::InvalidContent, "Rejected by demo provider")
                        })
                        .await
                } else {
                    provider.call(move |reactor, _| reactor.ack(stream_id, identifier)).await
                };
                if let Err(e) = result.context("Provider driver stopped")? {
                    warn!(identifier, "Failed to acknowledge queue message: {}", e);
                }
            }
        }
        ReactorEvent::TunnelOpened { stream_id, .. } => {
            info!(stream_id = %stream_id, "Provider tunnel stream open");
        }
        ReactorEvent::TunnelClosed { stream_id, state, .. } => {
            info!(stream_id = %stream_id, "Provider tunnel stream closed: {}", state);
        }
        other => debug!("Provider event: {:?}", other),
    }
    Ok(())
}

fn on_consumer_event(event: ReactorEvent, stats: &mut DemoStats) {
    match event {
        ReactorEvent::TunnelOpened {
            stream_id,
            class_of_service,
        } => info!(
            stream_id = %stream_id,
            minor = class_of_service.protocol_minor_version,
            "Consumer tunnel stream open"
        ),
        ReactorEvent::LoginAccepted { user_name, .. } => info!(user = %user_name, "Login accepted"),
        ReactorEvent::QueueRefresh { refresh, .. } => {
            info!(source = %refresh.source_name, depth = refresh.queue_depth, "Queue stream: {}", refresh.state)
        }
        ReactorEvent::QueueAck { ack, .. } => match ack.outcome {
            omm_tunnel_proto::AckOutcome::Ack => {
                stats.acked += 1;
                info!(identifier = ack.identifier, "Queue message acknowledged");
            }
            omm_tunnel_proto::AckOutcome::Nack { code, text } => {
                stats.nacked += 1;
                warn!(identifier = ack.identifier, code = ?code, "Queue message rejected: {}", text);
            }
        },
        ReactorEvent::QueueDataExpired { expired, .. } => {
            stats.expired += 1;
            warn!(identifier = expired.identifier, code = ?expired.undeliverable_code, "Queue message expired");
        }
        ReactorEvent::TunnelClosed {
            stream_id,
            state,
            cause,
            ..
        } => warn!(stream_id = %stream_id, cause = ?cause, "Consumer tunnel stream closed: {}", state),
        other => debug!("Consumer event: {:?}", other),
    }
}

async fn run_demo(
    mut config: ClientConfig,
    duration: u64,
    jwt_secret: Option<String>,
    manual_ack: bool,
) -> Result<()> {
    let mut provider_config = TunnelSessionConfig::builder()
        .name("QueueProvider")
        .domain_type(config.tunnel.domain_type)
        .queue_capable(true)
        .ack_policy(if manual_ack { AckPolicy::Manual } else { AckPolicy::Auto })
        .build()
        .map_err(anyhow::Error::msg)?;

    let (consumer_transport, provider_transport) = MemoryTransport::pair();
    let mut provider = Reactor::provider(provider_transport);

    if let Some(secret) = jwt_secret {
        if config.tunnel.user_name.is_empty() {
            config.tunnel.user_name = "demo".to_string();
        }
        let claims = JwtClaims::new(
            config.tunnel.user_name.clone(),
            "omm-tunnel-demo".to_string(),
            "omm-tunnel".to_string(),
            chrono::Duration::hours(1),
        );
        let token = JwtValidator::encode(secret.as_bytes(), &claims).context("Failed to sign login token")?;
        config.tunnel.use_authentication = true;
        config.tunnel.token = Some(token);

        provider_config.use_authentication = true;
        provider = provider.with_login_validator(Arc::new(JwtValidator::new(secret.as_bytes())));
        info!(user = %config.tunnel.user_name, "Tunnel authentication enabled");
    }

    let mut consumer = Reactor::consumer(consumer_transport);
    consumer.on_directory_update(&DirectoryUpdate::new(vec![ServiceEntry::add(
        DEMO_SERVICE_ID,
        &config.tunnel.service_name,
    )
    .with_capabilities(vec![config.tunnel.domain_type])
    .with_state(ServiceState::Up, Some(true))]));

    let (consumer_handle, mut consumer_events) = ReactorDriver::new(consumer, config.dispatch_interval)
        .with_producer(QueueMsgProducer::new(&config.producer))
        .spawn();
    let (provider_handle, mut provider_events) =
        ReactorDriver::new(provider, config.dispatch_interval).spawn();

    let tunnel = config.tunnel.clone();
    let stream_id = consumer_handle
        .call(move |reactor, now| reactor.open(tunnel, now))
        .await
        .context("Consumer driver stopped")?
        .context("Failed to open tunnel stream")?;
    info!(stream_id = %stream_id, service = %config.tunnel.service_name, "Tunnel stream created");

    let mut stats = DemoStats::default();
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = &mut deadline, if duration > 0 => {
                info!("Demo finished after {} seconds", duration);
                break;
            }
            Some(event) = provider_events.recv() => {
                on_provider_event(event, &provider_handle, &provider_config, &mut stats).await?;
            }
            Some(event) = consumer_events.recv() => {
                on_consumer_event(event, &mut stats);
            }
            else => {
                error!("Both dispatch drivers stopped");
                break;
            }
        }
    }

    let close = consumer_handle
        .call(move |reactor, _| reactor.close(stream_id, false))
        .await
        .context("Consumer driver stopped")?;
    if let Err(e) = close {
        warn!("Failed to close tunnel stream: {}", e);
    }

    consumer_handle.shutdown().await.context("Consumer driver failed")?;
    provider_handle.shutdown().await.context("Provider driver failed")?;

    info!(
        received = stats.received,
        acked = stats.acked,
        nacked = stats.nacked,
        expired = stats.expired,
        "Demo stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Demo {
            config,
            destinations,
            duration,
            jwt_secret,
            manual_ack,
        } => {
            let mut client_config = match config {
                Some(path) => ClientConfig::from_file(&path)
                    .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
                None => default_config()?,
            };
            if !destinations.is_empty() {
                client_config.producer.destinations = destinations;
            }
            client_config.validate().map_err(anyhow::Error::msg)?;

            info!("OMM tunnel demo starting...");
            run_demo(client_config, duration, jwt_secret, manual_ack).await
        }
        Commands::Config => {
            let yaml = serde_yaml::to_string(&default_config()?).context("Failed to render configuration")?;
            println!("{}", yaml);
            Ok(())
        }
    }
}
