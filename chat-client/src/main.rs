//! Chat Client Simulator
//!
//! Runs several anonymous chat clients in one process:
//! - Every client advertises a rendezvous code in a shared in-memory directory
//! - Clients discover each other and connect over a loopback transport
//! - Connected pairs exchange profiles and a chat line, then move on ("next")
//!
//! Prints Prometheus-style metrics on exit.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use session_core::{
    ChannelObserver, ConnectionOrchestrator, Directory, EndReason, LoopbackNetwork,
    MemoryDirectory, Metrics, Mode, SessionConfig, SessionEvent, Status, SyntheticCamera,
    Transport,
};

// ============================================================================
// Constants
// ============================================================================

/// Default number of simulated clients
const DEFAULT_PEERS: usize = 4;

/// Default run time in seconds
const DEFAULT_DURATION_SECS: u64 = 10;

/// How long a pair stays together after the first chat line arrives
const DEFAULT_HOLD_MS: u64 = 500;

/// Main loop pacing
const LOOP_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --config <path>    Session config JSON (optional)
    // --peers <n>        Number of simulated clients
    // --mode <mode>      text | video
    // --duration <secs>  Run time before shutting down
    // --hold-ms <ms>     Time a pair stays connected after chatting

    let mut config = match parse_arg(&args, "--config") {
        Some(path) => SessionConfig::load(Path::new(&path))?,
        None => SessionConfig::default(),
    };
    if let Some(mode) = parse_arg(&args, "--mode") {
        config.mode = mode.parse::<Mode>()?;
    }
    let peers: usize = parse_arg(&args, "--peers")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| "Invalid --peers value")?
        .unwrap_or(DEFAULT_PEERS);
    let duration: u64 = parse_arg(&args, "--duration")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| "Invalid --duration value")?
        .unwrap_or(DEFAULT_DURATION_SECS);
    let hold: u64 = parse_arg(&args, "--hold-ms")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| "Invalid --hold-ms value")?
        .unwrap_or(DEFAULT_HOLD_MS);

    if peers == 0 {
        return Err("--peers must be at least 1".into());
    }

    log::info!("Chat client simulator starting...");
    log::info!("  Peers:    {}", peers);
    log::info!("  Mode:     {}", config.mode);
    log::info!("  Duration: {}s", duration);
    log::info!("  Tick:     {}ms", config.tick_interval_ms);

    // Stop cleanly on SIGINT/SIGTERM
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let directory: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let network: Arc<dyn Transport> = Arc::new(LoopbackNetwork::new());
    let metrics = Arc::new(Metrics::new());

    let mut drivers = Vec::with_capacity(peers);
    for index in 0..peers {
        let (observer, events) = ChannelObserver::new();
        let session = ConnectionOrchestrator::builder(
            peer_config(&config, index),
            Arc::clone(&directory),
            Arc::clone(&network),
        )
        .media(Arc::new(SyntheticCamera))
        .observer(Arc::new(observer))
        .metrics(Arc::clone(&metrics))
        .build()?;

        session.start_episode(config.mode)?;
        drivers.push(PeerDriver::new(
            format!("peer-{}", index),
            session,
            events,
            Duration::from_millis(hold),
        ));
    }

    let deadline = Instant::now() + Duration::from_secs(duration);
    while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
        for driver in &mut drivers {
            driver.step(Instant::now());
        }
        std::thread::sleep(LOOP_INTERVAL);
    }

    if shutdown.load(Ordering::Relaxed) {
        log::info!("Signal received, shutting down");
    }

    for driver in &drivers {
        driver.session.end_episode(EndReason::LocalStop);
    }

    let chats: usize = drivers.iter().map(|d| d.chats_received).sum();
    let sessions: usize = drivers.iter().map(|d| d.sessions).sum();
    log::info!(
        "Simulation finished: {} sessions, {} chat lines, {} clients online",
        sessions,
        chats,
        drivers[0].session.online_count()
    );

    print!("{}", metrics.render());
    Ok(())
}

/// Parse a `--flag value` pair from the argument list
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Per-client config: a configured local id gets an index suffix so every
/// simulated client stays distinct
fn peer_config(base: &SessionConfig, index: usize) -> SessionConfig {
    let mut config = base.clone();
    if let Some(id) = &base.local_id {
        config.local_id = Some(format!("{}{}", id, index));
    }
    config
}

// ============================================================================
// Peer Driver
// ============================================================================

/// Plays the user of one simulated client
struct PeerDriver {
    name: String,
    session: ConnectionOrchestrator,
    events: Receiver<SessionEvent>,
    hold: Duration,
    /// When to move on to the next partner
    leave_at: Option<Instant>,
    chats_received: usize,
    sessions: usize,
}

impl PeerDriver {
    fn new(
        name: String,
        session: ConnectionOrchestrator,
        events: Receiver<SessionEvent>,
        hold: Duration,
    ) -> Self {
        PeerDriver {
            name,
            session,
            events,
            hold,
            leave_at: None,
            chats_received: 0,
            sessions: 0,
        }
    }

    fn step(&mut self, now: Instant) {
        let events: Vec<_> = self.events.try_iter().collect();
        for event in events {
            self.handle(event, now);
        }

        if self.leave_at.is_some_and(|at| now >= at) {
            self.leave_at = None;
            log::info!("[{}] next", self.name);
            if let Err(e) = self.session.next() {
                log::warn!("[{}] cannot requeue: {}", self.name, e);
            }
        }
    }

    fn handle(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Status(Status::Connected) => {
                self.sessions += 1;
                let peer = self.session.snapshot().peer_code.unwrap_or_default();
                log::info!("[{}] connected to {}", self.name, peer);
                let greeting = format!("hello from {}", self.name);
                if let Err(e) = self.session.send_chat(&greeting) {
                    log::warn!("[{}] chat not sent: {}", self.name, e);
                }
            }
            SessionEvent::Status(Status::Disconnected) => {
                self.leave_at = None;
                let reason = self.session.snapshot().last_end;
                log::info!("[{}] disconnected ({:?})", self.name, reason);
                // The partner left; look for another one
                if matches!(
                    reason,
                    Some(EndReason::PeerDisconnected | EndReason::PeerClosed)
                ) {
                    if let Err(e) = self.session.requeue() {
                        log::warn!("[{}] cannot requeue: {}", self.name, e);
                    }
                }
            }
            SessionEvent::Status(status) => {
                log::debug!("[{}] {}", self.name, status);
            }
            SessionEvent::Chat { sender, text, .. } => {
                self.chats_received += 1;
                log::info!("[{}] {}: {}", self.name, sender, text);
                if self.leave_at.is_none() {
                    self.leave_at = Some(now + self.hold);
                }
            }
            SessionEvent::Profile(profile) => {
                log::info!("[{}] partner profile: {}", self.name, profile["username"]);
            }
            SessionEvent::RemoteStream(stream) => {
                log::debug!("[{}] receiving {:?} stream", self.name, stream.kind);
            }
            SessionEvent::Notice(notice) => {
                log::warn!("[{}] {}", self.name, notice);
            }
        }
    }
}
