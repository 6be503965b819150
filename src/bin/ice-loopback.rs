use anyhow::{bail, Context, Result};
use clap::Parser;
use ice_connection::{
    init_logging, ComponentId, ConnectionConfig, IceConnection, IceConnectionListener, IceState,
    MediaType, UdpHostEngine,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect two ICE connections over local UDP", long_about = None)]
struct Args {
    /// JSON connection config; missing fields take defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of ICE components (overrides config)
    #[arg(long)]
    components: Option<u32>,

    /// Local address to bind sockets on
    #[arg(short, long, default_value = "127.0.0.1")]
    bind_ip: IpAddr,

    /// Lowest local port (overrides config)
    #[arg(long)]
    min_port: Option<u16>,

    /// Highest local port (overrides config)
    #[arg(long)]
    max_port: Option<u16>,

    /// Messages sent per component in each direction
    #[arg(short, long, default_value_t = 5)]
    messages: usize,

    /// Seconds to wait for each phase
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug)]
enum PeerEvent {
    State(&'static str, IceState),
    Data(&'static str, ComponentId, Vec<u8>),
}

/// Forwards connection callbacks into the main task
struct ChannelListener {
    name: &'static str,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl IceConnectionListener for ChannelListener {
    fn on_nice_data(&self, component_id: ComponentId, data: &[u8], _connection: &IceConnection) {
        let _ = self.tx.send(PeerEvent::Data(self.name, component_id, data.to_vec()));
    }

    fn update_ice_state(&self, state: IceState, _connection: &IceConnection) {
        let _ = self.tx.send(PeerEvent::State(self.name, state));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config = build_config(&args)?;
    println!("ICE loopback v{}", ice_connection::VERSION);
    println!("Components: {}", config.ice_components);
    println!("Bind address: {}", args.bind_ip);
    println!("Port range: {}-{}", config.min_port, config.max_port);
    println!();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let offerer_listener = Arc::new(ChannelListener { name: "offerer", tx: tx.clone() });
    let answerer_listener = Arc::new(ChannelListener { name: "answerer", tx });

    let offerer = IceConnection::new(config.clone(), UdpHostEngine::new(args.bind_ip))?;
    let answerer = IceConnection::new(config.clone(), UdpHostEngine::new(args.bind_ip))?;
    offerer.set_listener(&offerer_listener);
    answerer.set_listener(&answerer_listener);

    let phase_timeout = Duration::from_secs(args.timeout);
    let started = Instant::now();

    offerer.start()?;
    answerer.start()?;

    let peers = [&offerer, &answerer];
    timeout(phase_timeout, wait_for_state(&mut rx, &peers, IceState::CandidatesGathered))
        .await
        .context("Timed out gathering candidates")??;

    for candidate in offerer.local_candidates() {
        println!("offerer  candidate: {}", candidate);
    }
    for candidate in answerer.local_candidates() {
        println!("answerer candidate: {}", candidate);
    }

    offerer.set_remote_candidates(&answerer.local_candidates())?;
    answerer.set_remote_candidates(&offerer.local_candidates())?;

    timeout(phase_timeout, wait_for_state(&mut rx, &peers, IceState::Ready))
        .await
        .context("Timed out establishing connectivity")??;
    println!("Connected in {:?}", started.elapsed());

    for component_id in 1..=config.ice_components {
        for i in 0..args.messages {
            offerer.send_data(component_id, format!("offer {}/{}", component_id, i).as_bytes())?;
            answerer.send_data(component_id, format!("answer {}/{}", component_id, i).as_bytes())?;
        }
    }

    let expected = 2 * args.messages * config.ice_components as usize;
    let mut received = 0;
    if timeout(phase_timeout, count_data(&mut rx, expected, &mut received)).await.is_err() {
        info!("Stopped waiting for data after {:?}", phase_timeout);
    }

    offerer.close();
    answerer.close();

    println!();
    println!("Messages received: {}/{}", received, expected);
    println!("Final states: offerer={} answerer={}", offerer.ice_state(), answerer.ice_state());

    if received < expected {
        bail!("Lost {} message(s)", expected - received);
    }

    Ok(())
}

fn build_config(args: &Args) -> Result<ConnectionConfig> {
    let mut config = match &args.config {
        Some(path) => ConnectionConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => ConnectionConfig::new(MediaType::Data, "loopback"),
    };

    if let Some(components) = args.components {
        config.ice_components = components;
    }
    if let Some(min_port) = args.min_port {
        config.min_port = min_port;
    }
    if let Some(max_port) = args.max_port {
        config.max_port = max_port;
    }

    config.validate()?;
    Ok(config)
}

/// Wait until every peer reached `target`; fails if any peer failed
async fn wait_for_state(
    rx: &mut mpsc::UnboundedReceiver<PeerEvent>,
    peers: &[&Arc<IceConnection>],
    target: IceState,
) -> Result<()> {
    loop {
        if peers.iter().any(|p| p.ice_state() == IceState::Failed) {
            bail!("ICE connection failed");
        }
        if peers.iter().all(|p| p.ice_state() >= target) {
            return Ok(());
        }

        match rx.recv().await {
            Some(PeerEvent::State(name, state)) => info!("{} is now {}", name, state),
            Some(event) => debug!("Ignoring {:?} while waiting for {}", event, target),
            None => bail!("Listeners went away"),
        }
    }
}

async fn count_data(rx: &mut mpsc::UnboundedReceiver<PeerEvent>, expected: usize, received: &mut usize) {
    while *received < expected {
        match rx.recv().await {
            Some(PeerEvent::Data(name, component_id, data)) => {
                debug!("{} got {:?} on component {}", name, String::from_utf8_lossy(&data), component_id);
                *received += 1;
            }
            Some(PeerEvent::State(name, state)) => info!("{} is now {}", name, state),
            None => break,
        }
    }
}
