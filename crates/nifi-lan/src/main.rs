use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use nifi_mp::{
    ConfigStore, HostRecv, InstanceId, LanEvent, LanSettings, LanTransport, LocalMp,
    MemoryConfigStore, MpSettings, MpTransport, TomlConfigStore,
};
use nifi_proto::constants::{MAX_PLAYERS, MAX_RECV_PAYLOAD, REPLY_SLOT_SIZE};
use nifi_proto::header::PacketKind;

/// DS local-wireless exchange over LAN
#[derive(Parser, Debug)]
#[command(name = "nifi-lan")]
#[command(about = "Host, join or browse LAN multiplayer sessions", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: Level,

    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a session and drive the lockstep exchange as player 0.
    Host {
        #[command(flatten)]
        net: NetArgs,

        /// Maximum number of players, including the host
        #[arg(short, long, default_value_t = 4)]
        max_players: usize,
    },
    /// Join a session and answer the host's commands.
    Join {
        #[command(flatten)]
        net: NetArgs,

        /// Host address, `ip` or `ip:port`
        host: String,
    },
    /// List sessions advertised on the local network.
    Browse {
        #[command(flatten)]
        net: NetArgs,

        /// How long to listen, in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Run several instances in this process over shared memory.
    Local {
        /// Number of instances (the first one hosts)
        #[arg(short, long, default_value_t = 4)]
        instances: usize,

        /// Frames to run
        #[arg(long, default_value_t = 300)]
        frames: u64,

        /// Receive timeout in milliseconds
        #[arg(long, default_value_t = 25)]
        recv_timeout_ms: u64,
    },
}

#[derive(Args, Debug)]
struct NetArgs {
    /// Player name
    #[arg(short, long)]
    name: Option<String>,

    /// Address to bind sockets to
    #[arg(long, default_value = "0.0.0.0")]
    bind: Ipv4Addr,

    /// Game port (host listen port)
    #[arg(long, default_value_t = nifi_proto::constants::GAME_PORT)]
    port: u16,

    /// Discovery port
    #[arg(long, default_value_t = nifi_proto::constants::DISCOVERY_PORT)]
    discovery_port: u16,

    /// Receive timeout in milliseconds
    #[arg(long)]
    recv_timeout_ms: Option<u64>,

    /// Frames to run (0 = until the session ends)
    #[arg(long, default_value_t = 0)]
    frames: u64,
}

impl NetArgs {
    fn settings(&self, store: &dyn ConfigStore) -> LanSettings {
        let mut settings = LanSettings::load(store);
        if let Some(name) = &self.name {
            settings.player_name = name.clone();
        }
        settings.bind_addr = self.bind;
        settings.game_port = self.port;
        settings.discovery_port = self.discovery_port;
        if let Some(ms) = self.recv_timeout_ms {
            settings.mp.recv_timeout_ms = ms;
        }
        settings
    }
}

/// Emulated frame period (~60 Hz).
const FRAME: Duration = Duration::from_micros(16_667);

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("io", "nifi", "nifi-lan")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn open_store(path: Option<PathBuf>) -> anyhow::Result<Box<dyn ConfigStore>> {
    match path.or_else(default_config_path) {
        Some(path) => {
            let store = TomlConfigStore::open(&path)?;
            info!(path = %store.path().display(), "using settings file");
            Ok(Box::new(store))
        }
        None => {
            warn!("no config directory; settings will not be saved");
            Ok(Box::new(MemoryConfigStore::new()))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut store = open_store(args.config)?;
    match args.command {
        Command::Host { net, max_players } => {
            let settings = LanSettings {
                max_players: max_players as u8,
                ..net.settings(store.as_ref())
            };
            let lan = LanTransport::new(settings.clone())?;
            lan.start_host(&settings.player_name, max_players)?;
            settings.store(store.as_mut())?;
            info!(addr = ?lan.local_addr(), "hosting as {}", settings.player_name);
            run_host(&lan, net.frames);
        }
        Command::Join { net, host } => {
            let settings = net.settings(store.as_ref());
            let lan = LanTransport::new(settings.clone())?;
            lan.start_client(&settings.player_name, &host)?;
            settings.store(store.as_mut())?;
            info!(player_id = ?lan.my_id(), "joined {host}");
            run_client(&lan, net.frames);
        }
        Command::Browse { net, seconds } => {
            let lan = LanTransport::new(net.settings(store.as_ref()))?;
            browse(&lan, Duration::from_secs(seconds))?;
        }
        Command::Local {
            instances,
            frames,
            recv_timeout_ms,
        } => run_local(instances, frames, recv_timeout_ms)?,
    }

    Ok(())
}

fn run_host(lan: &LanTransport, frames: u64) {
    let Some(me) = InstanceId::new(0) else {
        return;
    };
    let events = lan.subscribe();
    lan.begin(me);

    let mut replies = vec![0u8; (MAX_PLAYERS - 1) * REPLY_SLOT_SIZE];
    let mut frame = 0u64;
    while frames == 0 || frame < frames {
        let started = Instant::now();
        lan.process();
        for event in events.try_iter() {
            if event == LanEvent::PlayerListChanged {
                log_players(lan);
            }
        }

        let others = lan.connected_mask().bits() & !me.bit();
        if others != 0 {
            if let Err(e) = lan.send_cmd(me, &frame.to_le_bytes(), frame) {
                warn!(error = %e, "CMD send failed");
            }
            let aids = lan.recv_replies(me, &mut replies, frame, others);
            if aids != others {
                info!(frame, expected = others, got = aids, "partial replies");
            }
        }

        frame += 1;
        thread::sleep(FRAME.saturating_sub(started.elapsed()));
    }

    lan.end(me);
    lan.end_session();
}

fn run_client(lan: &LanTransport, frames: u64) {
    let Some(my_id) = lan.my_id() else {
        return;
    };
    let Some(me) = InstanceId::new(my_id as usize) else {
        return;
    };
    let events = lan.subscribe();
    lan.begin(me);

    let mut buf = vec![0u8; MAX_RECV_PAYLOAD];
    let mut answered = 0u64;
    while frames == 0 || answered < frames {
        lan.process();
        for event in events.try_iter() {
            match event {
                LanEvent::PlayerListChanged => log_players(lan),
                LanEvent::Disconnected { reason } => {
                    warn!(%reason, "session lost");
                    return;
                }
                LanEvent::DiscoveryListChanged => {}
            }
        }

        match lan.recv_host_packet(me, &mut buf) {
            HostRecv::Frame(frame) if frame.kind == PacketKind::Command => {
                let reply = [my_id, frame.len as u8];
                if let Err(e) = lan.send_reply(me, &reply, frame.timestamp, my_id as u16) {
                    warn!(error = %e, "reply send failed");
                }
                answered += 1;
            }
            HostRecv::Frame(_) | HostRecv::Timeout => {}
            HostRecv::HostGone => {
                warn!("host left the exchange");
                break;
            }
        }
    }

    lan.end(me);
    lan.end_session();
}

fn browse(lan: &LanTransport, duration: Duration) -> anyhow::Result<()> {
    let events = lan.subscribe();
    lan.start_discovery()?;
    info!("listening for sessions for {}s", duration.as_secs());

    let deadline = Instant::now() + duration;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        if events.recv_timeout(left).is_err() {
            break;
        }
        for (addr, entry) in lan.discovery_list() {
            info!(
                %addr,
                session = %entry.session_name,
                players = format_args!("{}/{}", entry.num_players, entry.max_players),
                status = entry.status,
                "session"
            );
        }
    }

    lan.end_discovery();
    Ok(())
}

fn log_players(lan: &LanTransport) {
    for p in lan.player_list() {
        info!(
            id = p.id,
            name = %p.name,
            status = ?p.status,
            addr = %p.address,
            ping = p.ping,
            local = p.is_local,
            "player"
        );
    }
}

fn run_local(instances: usize, frames: u64, recv_timeout_ms: u64) -> anyhow::Result<()> {
    if !(2..=MAX_PLAYERS).contains(&instances) {
        anyhow::bail!("instances must be between 2 and {MAX_PLAYERS}");
    }
    if frames == 0 {
        anyhow::bail!("--frames must be at least 1");
    }

    let mp = Arc::new(LocalMp::new(MpSettings {
        recv_timeout_ms,
        ..MpSettings::default()
    }));
    let ids: Vec<InstanceId> = (0..instances).filter_map(InstanceId::new).collect();
    for id in &ids {
        mp.begin(*id);
    }

    let clients: Vec<_> = ids[1..]
        .iter()
        .map(|&id| {
            let mp = mp.clone();
            thread::spawn(move || {
                let mut buf = vec![0u8; MAX_RECV_PAYLOAD];
                loop {
                    match mp.recv_host_packet(id, &mut buf) {
                        HostRecv::Frame(frame) if frame.kind == PacketKind::Command => {
                            let reply = [id.index() as u8];
                            if let Err(e) =
                                mp.send_reply(id, &reply, frame.timestamp, id.index() as u16)
                            {
                                warn!(instance = id.index(), error = %e, "reply send failed");
                            }
                        }
                        HostRecv::Frame(_) | HostRecv::Timeout => {}
                        HostRecv::HostGone => break,
                    }
                }
                mp.end(id);
            })
        })
        .collect();

    let host = ids[0];
    let expected = ids[1..].iter().fold(0u16, |mask, id| mask | id.bit());
    let mut replies = vec![0u8; (MAX_PLAYERS - 1) * REPLY_SLOT_SIZE];
    let mut partial = 0u64;
    for frame in 0..frames {
        mp.send_cmd(host, &frame.to_le_bytes(), frame)?;
        if mp.recv_replies(host, &mut replies, frame, expected) != expected {
            partial += 1;
        }
    }
    mp.end(host);

    for client in clients {
        let _ = client.join();
    }
    info!(frames, partial, "local session finished");
    Ok(())
}
