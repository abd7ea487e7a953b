//! Coordination network simulator.
//!
//! Starts a number of coordination sessions on one in-memory transport, lets
//! them discover each other and elect a coordinator, drives a demo stream
//! through its lifecycle from the coordinator, and leaves cleanly when the run
//! is over or on Ctrl-C.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use coord_resource::backend::MemoryTransport;
use coord_resource::Transport;
use coord_runtime::StreamState;
use coord_session::{CoordinationSession, SessionEventKind};
use coord_wire::{Metadata, Node, StreamConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

#[macro_use]
mod logging;
mod config;

use config::NodeConfig;

const DEMO_STREAM: &str = "demo";
const DEMO_SAMPLES: u32 = 10;
const STATE_WAIT: Duration = Duration::from_secs(5);

/// Local coordination network simulator
#[derive(Parser, Debug)]
#[command(name = "coord", version, about = "Coordination network simulator over an in-memory transport")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "coord.yaml")]
    config: PathBuf,

    /// Base node name; nodes are named `<node-id>-<n>`
    #[arg(long)]
    node_id: Option<String>,

    /// Network to form
    #[arg(long)]
    network: Option<String>,

    /// Number of nodes to start
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// How long to keep the network up after the demo, e.g. 5s
    #[arg(long, default_value = "3s")]
    run_for: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Heartbeat interval, e.g. 1s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Silence after which a node is dropped, e.g. 5s
    #[arg(long)]
    node_timeout: Option<humantime::Duration>,
}

impl Args {
    fn apply_to(&self, config: &mut NodeConfig) {
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(network) = &self.network {
            config.coordination.network_name = network.clone();
        }
        if let Some(interval) = &self.heartbeat_interval {
            config.coordination.heartbeat_interval = *interval.as_ref();
        }
        if let Some(timeout) = &self.node_timeout {
            config.coordination.node_timeout = *timeout.as_ref();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    info!("Starting coord simulator v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config.validate()?;

    if args.nodes == 0 {
        anyhow::bail!("--nodes must be at least 1");
    }
    if args.nodes > config.coordination.max_nodes + 1 {
        component_warn!(
            "sim",
            "{} nodes requested but the coordinator admits {}; the rest will be rejected",
            args.nodes,
            config.coordination.max_nodes
        );
    }

    let transport = Arc::new(MemoryTransport::default());
    let sessions = start_sessions(&config, transport, args.nodes)?;

    let outcome = tokio::select! {
        result = simulate(&config, &sessions, *args.run_for) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            component_info!("sim", "Interrupted, leaving network");
            Ok(())
        }
    };

    // Participants first so the coordinator sees every departure
    let (coordinators, participants): (Vec<_>, Vec<_>) =
        sessions.iter().partition(|session| session.is_coordinator());
    for session in participants.into_iter().chain(coordinators) {
        if let Err(e) = session.leave().await {
            component_error!("sim", "Node {} failed to leave: {}", session.local().id(), e);
        }
    }

    component_info!("sim", "Simulation finished");
    outcome
}

fn start_sessions(
    config: &NodeConfig,
    transport: Arc<MemoryTransport>,
    count: usize,
) -> anyhow::Result<Vec<CoordinationSession>> {
    (0..count)
        .map(|n| {
            let mut node = Node::generate(format!("{}-{}", config.node_id, n));
            for (key, value) in &config.capabilities {
                node = node.with_capability(key.clone(), value.clone());
            }
            let transport: Arc<dyn Transport> = transport.clone();
            CoordinationSession::new(config.coordination.clone(), node, transport)
                .with_context(|| format!("failed to create session {}", n))
        })
        .collect()
}

async fn simulate(
    config: &NodeConfig,
    sessions: &[CoordinationSession],
    run_for: Duration,
) -> anyhow::Result<()> {
    let watchers: Vec<_> = sessions
        .iter()
        .map(|session| tokio::spawn(log_events(session.local().id().to_string(), session.subscribe())))
        .collect();

    let mut joined = Vec::new();
    for session in sessions {
        match session.join().await {
            Ok(()) => {
                let role = if session.is_coordinator() { "coordinator" } else { "participant" };
                component_info!("sim", "Node {} joined as {}", session.local().id(), role);
                joined.push(session);
            }
            Err(e) => component_warn!("sim", "Node {} could not join: {}", session.local().id(), e),
        }
    }

    let coordinator = joined
        .iter()
        .copied()
        .find(|session| session.is_coordinator())
        .context("no node became coordinator")?;

    coordinator
        .wait_for_nodes(joined.len(), config.coordination.join_timeout)
        .await
        .context("network did not converge")?;
    let snapshot = coordinator.snapshot().await;
    component_info!(
        "sim",
        "Network {} converged: {} nodes, coordinator {}, phase {}",
        config.coordination.network_name,
        snapshot.topology.len(),
        coordinator.local().id(),
        snapshot.phase
    );

    let mut greeting = Metadata::new();
    greeting.insert("text".to_string(), "hello from the coordinator".into());
    coordinator.send_user_message(greeting).await?;

    run_demo_stream(coordinator, &joined).await?;

    component_info!("sim", "Keeping the network up for {:?}", run_for);
    tokio::time::sleep(run_for).await;

    match serde_yaml::to_string(&coordinator.snapshot().await) {
        Ok(yaml) => component_debug!("sim", "Final coordinator snapshot:\n{}", yaml),
        Err(e) => component_warn!("sim", "Could not render snapshot: {}", e),
    }
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}

async fn run_demo_stream(
    coordinator: &CoordinationSession,
    joined: &[&CoordinationSession],
) -> anyhow::Result<()> {
    let stream = coordinator
        .create_stream(StreamConfig::new(DEMO_STREAM, 1, 100.0))
        .await?;
    component_info!("stream", "Created stream {}", DEMO_STREAM);

    coordinator.start_stream(DEMO_STREAM).await?;
    stream.wait_for_state(StreamState::Active, STATE_WAIT).await?;

    let mut listeners = Vec::new();
    for session in joined.iter().filter(|session| !session.is_coordinator()) {
        if let Some(handle) = session.stream(DEMO_STREAM).await {
            if handle.wait_for_state(StreamState::Active, STATE_WAIT).await.is_ok() {
                listeners.push((session.local().id().to_string(), handle.subscribe()));
            }
        }
    }

    for n in 0..DEMO_SAMPLES {
        let sample = (n as f32).to_le_bytes();
        stream.push(Bytes::copy_from_slice(&sample)).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    for (node, mut samples) in listeners {
        let mut received = 0;
        while samples.try_recv().is_ok() {
            received += 1;
        }
        component_info!("stream", "Node {} received {} samples", node, received);
    }

    coordinator.pause_stream(DEMO_STREAM).await?;
    component_info!("stream", "Paused stream {}", DEMO_STREAM);
    coordinator.resume_stream(DEMO_STREAM, true).await?;
    component_info!("stream", "Resumed stream {} with flush", DEMO_STREAM);
    coordinator.stop_stream(DEMO_STREAM).await?;
    coordinator.destroy_stream(DEMO_STREAM).await?;
    component_info!("stream", "Destroyed stream {}", DEMO_STREAM);
    Ok(())
}

async fn log_events(node: String, mut events: broadcast::Receiver<coord_session::SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match &event.kind {
                SessionEventKind::PhaseChanged { from, to } => {
                    component_debug!("events", "[{}] phase {} -> {}", node, from, to)
                }
                SessionEventKind::Fatal { unit, reason } => {
                    component_error!("events", "[{}] unit {} failed: {}", node, unit, reason)
                }
                kind => component_info!("events", "[{}] #{} {:?}", node, event.sequence, kind),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                component_warn!("events", "[{}] missed {} events", node, missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
