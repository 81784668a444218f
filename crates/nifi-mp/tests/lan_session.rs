//! LAN transport over loopback: handshake, refusal, mesh, lockstep and host loss.
//!
//! Every transport binds to ephemeral ports on 127.0.0.1, so tests can run in
//! parallel. The host side only advances when something calls `process()`,
//! which a pump thread does for the duration of each test.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nifi_mp::{
    HostRecv, InstanceId, LanError, LanEvent, LanSettings, LanTransport, MpSettings, MpTransport,
};
use nifi_proto::constants::{PROTOCOL_VERSION, REPLY_SLOT_SIZE};
use nifi_proto::control::PlayerStatus;
use nifi_proto::header::PacketKind;
use tracing_subscriber::EnvFilter;

const DEADLINE: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn loopback(name: &str) -> LanSettings {
    LanSettings {
        player_name: name.to_string(),
        bind_addr: Ipv4Addr::LOCALHOST,
        game_port: 0,
        client_port: 0,
        broadcast_addr: Ipv4Addr::LOCALHOST,
        discovery_port: 0,
        discovery_interval_ms: 50,
        rx_lifetime_ms: 1000,
        mp: MpSettings {
            recv_timeout_ms: 50,
            ..MpSettings::default()
        },
        ..LanSettings::default()
    }
}

fn inst(i: usize) -> InstanceId {
    InstanceId::new(i).unwrap()
}

/// Calls `process()` on a transport until dropped.
struct Pump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Pump {
    fn start(lan: Arc<LanTransport>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                lan.process();
                thread::sleep(Duration::from_millis(2));
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Poll `cond` until it holds or the deadline passes.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn host_addr(host: &LanTransport) -> String {
    host.local_addr().unwrap().to_string()
}

fn hosted(name: &str, max_players: usize) -> Arc<LanTransport> {
    let host = Arc::new(LanTransport::new(loopback(name)).unwrap());
    host.start_host(name, max_players).unwrap();
    host
}

#[test]
fn client_joins_and_sees_player_list() -> anyhow::Result<()> {
    init_tracing();
    let host = hosted("Ness", 4);
    let _pump = Pump::start(host.clone());

    let client = LanTransport::new(loopback("Lucas"))?;
    client.start_client("Lucas", &host_addr(&host))?;
    assert_eq!(client.my_id(), Some(1));
    assert!(!client.is_host());
    assert!(host.is_host());

    assert!(wait_for(|| host.num_players() == 2
        && host
            .player_list()
            .iter()
            .any(|p| p.id == 1 && p.status == PlayerStatus::Client)));
    assert!(wait_for(|| {
        client.process();
        client.num_players() == 2
    }));

    let players = client.player_list();
    let host_entry = players.iter().find(|p| p.id == 0).unwrap();
    assert_eq!(host_entry.name, "Ness");
    assert_eq!(host_entry.status, PlayerStatus::Host);
    assert!(!host_entry.is_local);

    let me = players.iter().find(|p| p.id == 1).unwrap();
    assert_eq!(me.name, "Lucas");
    assert!(me.is_local);
    assert_eq!(client.max_players(), 4);
    Ok(())
}

#[test]
fn mismatched_version_is_refused() {
    init_tracing();
    let host = hosted("Ness", 4);
    let _pump = Pump::start(host.clone());

    let client = LanTransport::new(LanSettings {
        protocol_version: PROTOCOL_VERSION + 1,
        ..loopback("Lucas")
    })
    .unwrap();

    let started = Instant::now();
    let result = client.start_client("Lucas", &host_addr(&host));
    assert!(
        matches!(result, Err(LanError::VersionMismatch { theirs, .. }) if theirs == PROTOCOL_VERSION),
        "unexpected result {result:?}"
    );
    assert!(started.elapsed() < DEADLINE);
    assert!(!client.is_active());

    // The reserved slot is given back once the connection drops.
    assert!(wait_for(|| host.num_players() == 1));
}

#[test]
fn full_session_is_refused() {
    init_tracing();
    let host = hosted("Ness", 1);
    let _pump = Pump::start(host.clone());

    let client = LanTransport::new(loopback("Lucas")).unwrap();
    let result = client.start_client("Lucas", &host_addr(&host));
    assert!(
        matches!(result, Err(LanError::SessionFull)),
        "unexpected result {result:?}"
    );
    assert_eq!(host.num_players(), 1);
}

#[test]
fn unreachable_host_times_out() {
    init_tracing();
    let client = LanTransport::new(LanSettings {
        connect_timeout_ms: 300,
        ..loopback("Lucas")
    })
    .unwrap();

    // Nothing listens on this socket, so the QUIC handshake never completes.
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = silent.local_addr().unwrap().to_string();

    let started = Instant::now();
    let result = client.start_client("Lucas", &addr);
    assert!(
        matches!(result, Err(LanError::Timeout | LanError::ConnectionFailed(_))),
        "unexpected result {result:?}"
    );
    assert!(started.elapsed() < DEADLINE);
}

#[test]
fn second_session_is_rejected() {
    init_tracing();
    let host = hosted("Ness", 4);
    assert!(matches!(
        host.start_host("Ness", 4),
        Err(LanError::AlreadyActive)
    ));
    assert!(matches!(
        host.start_host("Ness", 17),
        Err(LanError::InvalidPlayerCount(17))
    ));
}

#[test]
fn cmd_reply_cycle_over_lan() {
    init_tracing();
    let host = hosted("Ness", 4);
    let client = Arc::new(LanTransport::new(loopback("Lucas")).unwrap());

    {
        let _pump = Pump::start(host.clone());
        client.start_client("Lucas", &host_addr(&host)).unwrap();
        assert!(wait_for(|| {
            client.process();
            client.num_players() == 2 && host.num_players() == 2
        }));
    }

    host.begin(inst(0));
    client.begin(inst(1));
    assert!(wait_for(|| {
        host.process();
        client.process();
        host.connected_mask().bits() == 0b11 && client.connected_mask().bits() == 0b11
    }));

    for ts in [100u64, 101, 102] {
        host.send_cmd(inst(0), b"X", ts).unwrap();

        let mut buf = [0u8; 64];
        let mut got_cmd = false;
        let deadline = Instant::now() + DEADLINE;
        while !got_cmd && Instant::now() < deadline {
            if let HostRecv::Frame(frame) = client.recv_host_packet(inst(1), &mut buf) {
                if frame.kind == PacketKind::Command && frame.timestamp == ts {
                    assert_eq!(&buf[..frame.len], b"X");
                    got_cmd = true;
                }
            }
        }
        assert!(got_cmd, "client never saw CMD {ts}");

        let reply = format!("pong {ts}");
        client
            .send_reply(inst(1), reply.as_bytes(), ts, 1)
            .unwrap();

        let mut replies = vec![0u8; 15 * REPLY_SLOT_SIZE];
        let mut aids = 0;
        let deadline = Instant::now() + DEADLINE;
        while aids & 0b10 == 0 && Instant::now() < deadline {
            aids |= host.recv_replies(inst(0), &mut replies, ts, 0b10);
        }
        assert_eq!(aids, 0b10, "cycle {ts}");
        assert_eq!(&replies[..reply.len()], reply.as_bytes());
    }
}

#[test]
fn regular_frames_reach_the_host() {
    init_tracing();
    let host = hosted("Ness", 4);
    let client = LanTransport::new(loopback("Lucas")).unwrap();
    {
        let _pump = Pump::start(host.clone());
        client.start_client("Lucas", &host_addr(&host)).unwrap();
        assert!(wait_for(|| {
            client.process();
            client.num_players() == 2 && host.num_players() == 2
        }));
    }

    client.send_packet(inst(1), b"beacon frame", 7).unwrap();

    let mut buf = [0u8; 64];
    let mut received = None;
    assert!(wait_for(|| {
        received = host.recv_packet(inst(0), &mut buf);
        received.is_some()
    }));
    let frame = received.unwrap();
    assert_eq!(frame.kind, PacketKind::Data);
    assert_eq!(frame.timestamp, 7);
    assert_eq!(&buf[..frame.len], b"beacon frame");
}

/// Host plus two clients, joined one after the other.
fn three_player_session() -> (Arc<LanTransport>, LanTransport, LanTransport) {
    let host = hosted("Ness", 4);
    let first = LanTransport::new(loopback("Lucas")).unwrap();
    let second = LanTransport::new(loopback("Kumatora")).unwrap();

    let pump = Pump::start(host.clone());
    first.start_client("Lucas", &host_addr(&host)).unwrap();
    second.start_client("Kumatora", &host_addr(&host)).unwrap();
    assert_eq!(first.my_id(), Some(1));
    assert_eq!(second.my_id(), Some(2));
    assert!(wait_for(|| {
        first.process();
        second.process();
        host.num_players() == 3 && first.num_players() == 3 && second.num_players() == 3
    }));
    drop(pump);

    (host, first, second)
}

#[test]
fn clients_exchange_frames_directly() {
    init_tracing();
    let (host, first, second) = three_player_session();
    let _pump = Pump::start(host.clone());

    // The later client dials the earlier one once it sees the player list;
    // keep sending until that connection is up.
    let mut buf = [0u8; 64];
    let mut received = None;
    assert!(wait_for(|| {
        second.process();
        second.send_packet(inst(2), b"from two", 3).unwrap();
        received = first.recv_packet(inst(1), &mut buf);
        received.is_some()
    }));
    let frame = received.unwrap();
    assert_eq!(frame.kind, PacketKind::Data);
    assert_eq!(frame.timestamp, 3);
    assert_eq!(&buf[..frame.len], b"from two");

    let mut received = None;
    assert!(wait_for(|| {
        first.process();
        first.send_packet(inst(1), b"from one", 4).unwrap();
        received = second.recv_packet(inst(2), &mut buf);
        received.is_some()
    }));
    assert_eq!(&buf[..received.unwrap().len], b"from one");
}

#[test]
fn silent_client_yields_partial_mask_over_lan() {
    init_tracing();
    let (host, first, second) = three_player_session();

    host.begin(inst(0));
    first.begin(inst(1));
    second.begin(inst(2));
    assert!(wait_for(|| {
        host.process();
        first.process();
        second.process();
        host.connected_mask().bits() == 0b111
    }));

    host.send_cmd(inst(0), b"X", 40).unwrap();

    let mut buf = [0u8; 64];
    let mut got_cmd = false;
    let deadline = Instant::now() + DEADLINE;
    while !got_cmd && Instant::now() < deadline {
        if let HostRecv::Frame(frame) = first.recv_host_packet(inst(1), &mut buf) {
            got_cmd = frame.kind == PacketKind::Command && frame.timestamp == 40;
        }
    }
    assert!(got_cmd, "first client never saw the CMD");
    first.send_reply(inst(1), b"one", 40, 1).unwrap();

    // The second client stays in the exchange but never answers.
    let mut replies = vec![0u8; 15 * REPLY_SLOT_SIZE];
    let mut aids = 0;
    let deadline = Instant::now() + DEADLINE;
    while aids & 0b10 == 0 && Instant::now() < deadline {
        let started = Instant::now();
        aids |= host.recv_replies(inst(0), &mut replies, 40, 0b110);
        assert!(started.elapsed() < DEADLINE, "reply collection blocked");
    }
    assert_eq!(aids, 0b10);
    assert_eq!(&replies[..3], b"one");

    // Nothing more arrives: a further collection gives up with no replies.
    assert_eq!(host.recv_replies(inst(0), &mut replies, 40, 0b110), 0);
}

#[test]
fn blocking_receive_does_not_hold_the_session() {
    init_tracing();
    let host = Arc::new(
        LanTransport::new(LanSettings {
            mp: MpSettings {
                recv_timeout_ms: 500,
                ..MpSettings::default()
            },
            ..loopback("Ness")
        })
        .unwrap(),
    );
    host.start_host("Ness", 4).unwrap();
    host.begin(inst(0));

    let receiver = {
        let host = host.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            host.recv_host_packet(inst(0), &mut buf)
        })
    };
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    assert_eq!(host.connected_mask().bits(), 0b1);
    assert!(host.is_host());
    let waited = started.elapsed();
    assert!(
        waited < Duration::from_millis(100),
        "session state was locked for {waited:?}"
    );

    assert_eq!(receiver.join().unwrap(), HostRecv::Timeout);
}

#[test]
fn client_detects_host_loss() {
    init_tracing();
    let host = hosted("Ness", 4);
    let client = LanTransport::new(loopback("Lucas")).unwrap();
    let events = client.subscribe();
    {
        let _pump = Pump::start(host.clone());
        client.start_client("Lucas", &host_addr(&host)).unwrap();
        assert!(wait_for(|| {
            client.process();
            client.num_players() == 2 && host.num_players() == 2
        }));
    }

    host.begin(inst(0));
    client.begin(inst(1));
    assert!(wait_for(|| {
        host.process();
        client.process();
        client.connected_mask().bits() == 0b11
    }));

    host.send_cmd(inst(0), b"X", 1).unwrap();
    let mut buf = [0u8; 16];
    assert!(wait_for(|| matches!(
        client.recv_host_packet(inst(1), &mut buf),
        HostRecv::Frame(_)
    )));

    host.end_session();

    let mut host_gone = false;
    let mut disconnected = false;
    assert!(wait_for(|| {
        client.process();
        host_gone |= client.recv_host_packet(inst(1), &mut buf) == HostRecv::HostGone;
        disconnected |= events
            .try_iter()
            .any(|e| matches!(e, LanEvent::Disconnected { .. }));
        host_gone && disconnected
    }));
}

#[test]
fn browser_lists_hosted_session() {
    init_tracing();
    // Fixed port: the browser has to know where beacons go.
    const PORT: u16 = 47_163;
    let browse_settings = LanSettings {
        discovery_port: PORT,
        ..loopback("Lucas")
    };
    let browser = LanTransport::new(browse_settings).unwrap();
    let events = browser.subscribe();
    browser.start_discovery().unwrap();

    let host = LanTransport::new(LanSettings {
        discovery_port: PORT,
        ..loopback("Ness")
    })
    .unwrap();
    host.start_host("Ness", 4).unwrap();

    let mut notified = false;
    assert!(wait_for(|| {
        notified |= events
            .try_iter()
            .any(|e| e == LanEvent::DiscoveryListChanged);
        notified && browser.discovery_list().contains_key(&Ipv4Addr::LOCALHOST)
    }));
    let list = browser.discovery_list();
    let entry = &list[&Ipv4Addr::LOCALHOST];
    assert_eq!(entry.session_name, "Ness's game");
    assert_eq!(entry.num_players, 1);
    assert_eq!(entry.max_players, 4);

    browser.end_discovery();
}
