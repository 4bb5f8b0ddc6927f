//! Integration tests for the session core
//!
//! These tests run real orchestrators, each with its own listener and
//! matchmaking threads, against an in-memory directory and the loopback
//! transport. Timings are shortened so a full match takes milliseconds.

use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use session_core::transport::{Connection, ConnectionEvent, Endpoint};
use session_core::{
    ChannelObserver, ConnectionOrchestrator, Directory, EndReason, LocalStream, LoopbackNetwork,
    MemoryDirectory, Metrics, Mode, Notice, SendOutcome, SessionConfig, SessionError,
    SessionEvent, Status, StreamKind, SyntheticCamera, Transport, TransportError,
};

/// Upper bound for anything that should happen "soon"
const PATIENCE: Duration = Duration::from_secs(10);

struct World {
    directory: Arc<MemoryDirectory>,
    network: LoopbackNetwork,
    metrics: Arc<Metrics>,
}

struct Client {
    session: ConnectionOrchestrator,
    events: Receiver<SessionEvent>,
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        tick_interval_ms: 20,
        attempt_timeout_ms: 400,
        profile_send_delay_ms: 10,
        event_poll_ms: 5,
        ..SessionConfig::default()
    }
}

impl World {
    fn new() -> Self {
        World {
            directory: Arc::new(MemoryDirectory::new()),
            network: LoopbackNetwork::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn client(&self, config: SessionConfig) -> Client {
        self.client_with(config, false)
    }

    fn client_with(&self, config: SessionConfig, camera: bool) -> Client {
        let (observer, events) = ChannelObserver::new();
        let mut builder = ConnectionOrchestrator::builder(
            config,
            Arc::clone(&self.directory) as Arc<dyn Directory>,
            Arc::new(self.network.clone()) as Arc<dyn Transport>,
        )
        .observer(Arc::new(observer))
        .metrics(Arc::clone(&self.metrics));
        if camera {
            builder = builder.media(Arc::new(SyntheticCamera));
        }
        Client {
            session: builder.build().unwrap(),
            events,
        }
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn wait_for_event(
    events: &Receiver<SessionEvent>,
    mut wanted: impl FnMut(&SessionEvent) -> bool,
) -> Option<SessionEvent> {
    let deadline = Instant::now() + PATIENCE;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) if wanted(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

fn paired(a: &Client, b: &Client) -> bool {
    let sa = a.session.snapshot();
    let sb = b.session.snapshot();
    sa.status == Status::Connected
        && sb.status == Status::Connected
        && sa.share_code.is_some()
        && sa.peer_code == sb.share_code
        && sb.peer_code == sa.share_code
}

/// Start both clients and wait until they are connected to each other,
/// requeueing whichever side loses a connection race.
fn connect_pair(a: &Client, b: &Client, mode: Mode) -> bool {
    a.session.start_episode(mode).unwrap();
    b.session.start_episode(mode).unwrap();

    wait_until(PATIENCE, || {
        if paired(a, b) {
            return true;
        }
        for client in [a, b] {
            if client.session.status() == Status::Disconnected {
                let _ = client.session.requeue();
            }
        }
        false
    })
}

#[test]
fn test_two_clients_match_and_chat() {
    let world = World::new();
    let a = world.client(fast_config());
    let b = world.client(fast_config());

    assert!(connect_pair(&a, &b, Mode::Text));

    let roles = (a.session.snapshot().role, b.session.snapshot().role);
    assert_ne!(roles.0, roles.1);

    assert_eq!(a.session.send_chat("hello").unwrap(), SendOutcome::Sent);
    let event = wait_for_event(&b.events, |e| matches!(e, SessionEvent::Chat { .. }));
    match event {
        Some(SessionEvent::Chat { sender, text, .. }) => {
            assert_eq!(text, "hello");
            assert_eq!(sender, a.session.local_id());
        }
        other => panic!("expected chat, got {:?}", other),
    }

    // Both records are marked connected while the session lasts
    for client in [&a, &b] {
        let code = client.session.share_code().unwrap();
        assert!(world.directory.get(&code).unwrap().connected);
    }
    assert!(world.metrics.active_sessions.load(Ordering::Relaxed) >= 2);
}

#[test]
fn test_chat_queued_before_connect_delivered_once() {
    let world = World::new();
    // Ticks once at start, then only listens
    let a = world.client(SessionConfig {
        tick_interval_ms: 60_000,
        ..fast_config()
    });
    let b = world.client(fast_config());

    a.session.start_episode(Mode::Text).unwrap();
    assert!(wait_until(PATIENCE, || a.session.status() == Status::Matching));
    thread::sleep(Duration::from_millis(30));

    assert_eq!(a.session.send_chat("hello").unwrap(), SendOutcome::Queued);
    assert_eq!(a.session.snapshot().queued_messages, 1);

    b.session.start_episode(Mode::Text).unwrap();
    assert!(wait_until(PATIENCE, || paired(&a, &b)));
    assert_eq!(a.session.snapshot().queued_messages, 0);

    assert!(wait_for_event(&b.events, |e| matches!(e, SessionEvent::Chat { .. })).is_some());
    thread::sleep(Duration::from_millis(200));
    let repeats = b
        .events
        .try_iter()
        .filter(|e| matches!(e, SessionEvent::Chat { .. }))
        .count();
    assert_eq!(repeats, 0);
}

#[test]
fn test_profiles_exchanged_after_connect() {
    let world = World::new();
    let a = world.client(SessionConfig {
        local_id: Some("user_aaaa1111".to_string()),
        ..fast_config()
    });
    let b = world.client(SessionConfig {
        local_id: Some("user_bbbb2222".to_string()),
        ..fast_config()
    });

    assert!(connect_pair(&a, &b, Mode::Text));

    let profile = wait_for_event(&a.events, |e| matches!(e, SessionEvent::Profile(_)));
    match profile {
        Some(SessionEvent::Profile(value)) => assert_eq!(value["username"], "User2222"),
        other => panic!("expected profile, got {:?}", other),
    }
    assert!(wait_for_event(&b.events, |e| matches!(e, SessionEvent::Profile(_))).is_some());
    assert_eq!(b.session.remote_profile().unwrap()["username"], "User1111");
}

#[test]
fn test_end_episode_is_idempotent_and_releases_code() {
    let world = World::new();
    let a = world.client(fast_config());

    a.session.start_episode(Mode::Text).unwrap();
    let first_code = a.session.share_code().unwrap();
    assert!(world.directory.get(&first_code).is_some());

    a.session.end_episode(EndReason::LocalStop);
    let once = a.session.snapshot();
    a.session.end_episode(EndReason::LocalStop);
    assert_eq!(a.session.snapshot(), once);

    assert_eq!(once.status, Status::Disconnected);
    assert_eq!(once.share_code, None);
    assert!(!once.connected);
    assert!(!once.channel_open);
    assert!(world.directory.get(&first_code).is_none());
    assert!(!world.network.has_endpoint(&first_code));

    a.session.requeue().unwrap();
    let second_code = a.session.share_code().unwrap();
    assert_ne!(second_code, first_code);
    assert!(a.session.status().is_searching());
    a.session.stop();
}

#[test]
fn test_double_start_is_ignored() {
    let world = World::new();
    let a = world.client(fast_config());

    a.session.start_episode(Mode::Text).unwrap();
    let code = a.session.share_code();
    a.session.start_episode(Mode::Video).unwrap();

    let snapshot = a.session.snapshot();
    assert_eq!(snapshot.share_code, code);
    assert_eq!(snapshot.mode, Mode::Text);
    assert_eq!(snapshot.episode, 1);
    a.session.stop();
}

#[test]
fn test_offer_rejected_while_connected() {
    let world = World::new();
    let a = world.client(fast_config());
    let b = world.client(fast_config());
    assert!(connect_pair(&a, &b, Mode::Text));

    let a_code = a.session.share_code().unwrap();
    let b_code = b.session.share_code().unwrap();
    let intruder: Arc<dyn Endpoint> = world.network.create_endpoint("QQQQQ").unwrap();
    let link: Arc<dyn Connection> = intruder
        .dial(&a_code, &LocalStream::placeholder("QQQQQ"))
        .unwrap();
    // The rejection may land before the channel request does
    let channel = link.open_data_channel();
    assert!(matches!(channel, Ok(_) | Err(TransportError::ChannelClosed)));

    assert_eq!(link.next_event(PATIENCE), Some(ConnectionEvent::Closed));
    assert_eq!(a.session.status(), Status::Connected);
    assert_eq!(a.session.snapshot().peer_code, Some(b_code));
    assert!(world.metrics.offers_rejected_total.load(Ordering::Relaxed) >= 1);
}

#[test]
fn test_disconnect_ends_remote_episode() {
    let world = World::new();
    let a = world.client(fast_config());
    let b = world.client(fast_config());
    assert!(connect_pair(&a, &b, Mode::Text));

    a.session.stop();

    assert!(wait_until(PATIENCE, || b.session.status() == Status::Disconnected));
    assert_eq!(b.session.snapshot().last_end, Some(EndReason::PeerDisconnected));
    assert_eq!(a.session.snapshot().last_end, Some(EndReason::LocalStop));
    assert!(wait_until(PATIENCE, || world.directory.is_empty()));
}

#[test]
fn test_next_requeues_local_side() {
    let world = World::new();
    let a = world.client(fast_config());
    let b = world.client(fast_config());
    assert!(connect_pair(&a, &b, Mode::Text));
    let episode = a.session.snapshot().episode;

    a.session.next().unwrap();

    let snapshot = a.session.snapshot();
    assert!(snapshot.episode > episode);
    assert!(snapshot.status.is_searching());
    assert!(wait_until(PATIENCE, || b.session.status() == Status::Disconnected));
    assert_eq!(b.session.snapshot().last_end, Some(EndReason::PeerDisconnected));
    a.session.stop();
}

#[test]
fn test_join_by_code() {
    let world = World::new();
    let a = world.client(SessionConfig {
        tick_interval_ms: 60_000,
        ..fast_config()
    });
    let b = world.client(SessionConfig {
        tick_interval_ms: 60_000,
        ..fast_config()
    });

    a.session.start_episode(Mode::Text).unwrap();
    let code = a.session.share_code().unwrap();
    b.session.join(Mode::Text, &code.to_lowercase()).unwrap();

    assert!(wait_until(PATIENCE, || paired(&a, &b)));
    assert_eq!(b.session.snapshot().peer_code, Some(code));
}

#[test]
fn test_modes_do_not_match() {
    let world = World::new();
    let a = world.client(fast_config());
    let b = world.client_with(fast_config(), true);

    a.session.start_episode(Mode::Text).unwrap();
    b.session.start_episode(Mode::Video).unwrap();
    thread::sleep(Duration::from_millis(300));

    assert!(a.session.status().is_searching());
    assert!(b.session.status().is_searching());
    assert_eq!(a.session.online_count(), 2);
    assert_eq!(world.metrics.dial_attempts_total.load(Ordering::Relaxed), 0);
}

#[test]
fn test_video_sessions_exchange_streams() {
    let world = World::new();
    let a = world.client_with(fast_config(), true);
    let b = world.client_with(fast_config(), true);

    assert!(connect_pair(&a, &b, Mode::Video));

    let stream = wait_for_event(&a.events, |e| matches!(e, SessionEvent::RemoteStream(_)));
    match stream {
        Some(SessionEvent::RemoteStream(stream)) => assert_eq!(stream.kind, StreamKind::Camera),
        other => panic!("expected remote stream, got {:?}", other),
    }
}

#[test]
fn test_missing_camera_falls_back_to_text() {
    let world = World::new();
    let a = world.client(SessionConfig {
        media_fallback_to_text: true,
        ..fast_config()
    });

    a.session.start_episode(Mode::Video).unwrap();

    assert_eq!(a.session.snapshot().mode, Mode::Text);
    let code = a.session.share_code().unwrap();
    assert_eq!(world.directory.get(&code).unwrap().mode, Mode::Text);
    assert!(wait_for_event(&a.events, |e| *e == SessionEvent::Notice(Notice::MediaFallback)).is_some());
    a.session.stop();
}

#[test]
fn test_missing_camera_aborts_without_fallback() {
    let world = World::new();
    let a = world.client(fast_config());

    let err = a.session.start_episode(Mode::Video).unwrap_err();

    assert!(matches!(err, SessionError::Media(_)));
    assert_eq!(a.session.status(), Status::Idle);
    assert!(world.directory.is_empty());
    assert_eq!(world.network.endpoint_count(), 0);
}

#[test]
fn test_endpoint_failure_returns_to_idle() {
    let world = World::new();
    let a = world.client(fast_config());
    world.network.set_unavailable(true);

    let err = a.session.start_episode(Mode::Text).unwrap_err();

    assert!(matches!(err, SessionError::Endpoint(_)));
    assert_eq!(a.session.status(), Status::Idle);
    assert_eq!(a.session.share_code(), None);
    assert!(wait_for_event(&a.events, |e| matches!(
        e,
        SessionEvent::Notice(Notice::EndpointUnavailable(_))
    ))
    .is_some());

    world.network.set_unavailable(false);
    a.session.start_episode(Mode::Text).unwrap();
    assert!(a.session.status().is_searching());
    a.session.stop();
}

#[test]
fn test_four_clients_pair_up() {
    let world = World::new();
    let clients: Vec<_> = (0..4).map(|_| world.client(fast_config())).collect();
    for client in &clients {
        client.session.start_episode(Mode::Text).unwrap();
    }

    let all_paired = wait_until(PATIENCE, || {
        let snapshots: Vec<_> = clients.iter().map(|c| c.session.snapshot()).collect();
        for client in &clients {
            if client.session.status() == Status::Disconnected {
                let _ = client.session.requeue();
            }
        }
        snapshots.iter().all(|s| {
            s.status == Status::Connected
                && snapshots
                    .iter()
                    .any(|o| o.share_code.is_some() && o.share_code == s.peer_code && o.peer_code == s.share_code)
        })
    });

    assert!(all_paired);
    assert!(world.metrics.matches_total.load(Ordering::Relaxed) >= 4);
}
