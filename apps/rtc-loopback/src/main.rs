mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;
use clap::Parser;
use logging::{LogConfig, LogLevel};
use tracing::{debug, info};
use transport_bus::{Bus, LocalBus};
use transport_webrtc::{
    ClientConfig, ConnectionFactory, ProviderConfig, RtcProvider, WebRtcFactory, connect,
};

#[derive(Parser, Debug)]
#[command(
    name = "rtc-loopback",
    about = "Negotiate a data channel with itself over an in-process bus and echo messages"
)]
struct Cli {
    /// Number of messages to echo.
    #[arg(long, default_value_t = 4, env = "RTC_LOOPBACK_MESSAGES")]
    messages: usize,

    /// Size in bytes of each message.
    #[arg(long, default_value_t = 40_960, env = "RTC_LOOPBACK_MESSAGE_BYTES")]
    message_bytes: usize,

    /// Largest frame written to the data channel, header included.
    #[arg(long, env = "RTC_SIGNAL_MAX_SEGMENT_BYTES")]
    segment_bytes: Option<usize>,

    /// Skip STUN and negotiate with host candidates only.
    #[arg(long)]
    no_stun: bool,

    /// Seconds to wait for the data channel to open.
    #[arg(long, default_value_t = 20, env = "RTC_LOOPBACK_TIMEOUT_SECS")]
    timeout_secs: u64,

    #[arg(long, value_enum, default_value_t = LogLevel::Info, env = "RTC_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr", env = "RTC_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("initialise logging")?;

    let (provider_config, client_config) = configs(&cli);
    let factory: Arc<dyn ConnectionFactory> =
        Arc::new(WebRtcFactory::new().context("build webrtc api")?);
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());

    let provider = Arc::new(RtcProvider::setup(
        provider_config,
        Arc::clone(&bus),
        Arc::clone(&factory),
    )?);
    let echo = tokio::spawn(serve_echo(Arc::clone(&provider)));

    let started = Instant::now();
    let session = connect(client_config.clone(), bus, factory)
        .await
        .context("establish data channel")?;
    info!(
        session_id = %session.session_id(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "data channel open"
    );
    let peer = session.into_peer(client_config.max_segment_size);

    let started = Instant::now();
    for index in 0..cli.messages {
        let message = pattern(index, cli.message_bytes);
        peer.write(message.clone())
            .await
            .with_context(|| format!("send message {index}"))?;
        let echoed = peer
            .read()
            .await
            .with_context(|| format!("receive echo {index}"))?;
        if echoed != message {
            bail!(
                "echo {index} differs: sent {} bytes, received {}",
                message.len(),
                echoed.len()
            );
        }
        debug!(index, bytes = message.len(), "echo verified");
    }
    info!(
        messages = cli.messages,
        bytes = cli.messages * cli.message_bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all echoes verified"
    );

    peer.close().await.context("close client channel")?;
    let served = echo.await.context("join echo task")??;
    ensure!(
        served == cli.messages,
        "provider echoed {served} messages, expected {}",
        cli.messages
    );
    provider.shutdown().await;
    Ok(())
}

fn configs(cli: &Cli) -> (ProviderConfig, ClientConfig) {
    let mut provider = ProviderConfig::from_env();
    let mut client = ClientConfig::from_env();
    let ready_timeout = Duration::from_secs(cli.timeout_secs.max(1));
    provider.ready_timeout = ready_timeout;
    client.ready_timeout = ready_timeout;
    if let Some(segment_bytes) = cli.segment_bytes {
        provider.max_segment_size = segment_bytes;
        client.max_segment_size = segment_bytes;
    }
    if cli.no_stun {
        provider.ice_servers.clear();
        client.ice_servers.clear();
    }
    (provider, client)
}

async fn serve_echo(provider: Arc<RtcProvider>) -> Result<usize> {
    let accepted = provider
        .accept()
        .await
        .context("provider stopped before a peer connected")?;
    info!(session_id = %accepted.session_id, "accepted peer");
    let mut echoed = 0;
    // ChannelClosed ends the loop once the client hangs up
    while let Ok(message) = accepted.peer.read().await {
        accepted.peer.write(message).await?;
        echoed += 1;
    }
    accepted.peer.close().await?;
    Ok(echoed)
}

fn pattern(index: usize, len: usize) -> Bytes {
    (0..len)
        .map(|offset| ((offset + index * 31) % 251) as u8)
        .collect::<Vec<_>>()
        .into()
}
