//! QUIC plumbing for the LAN transport.
//!
//! Every instance runs one endpoint that both accepts and dials. Each peer
//! connection carries:
//! - a control stream per direction (unidirectional, first byte
//!   [`ChannelKind::Control`], then `[u32 len][message]` frames),
//! - gameplay frames as datagrams, or as a one-shot [`ChannelKind::Mp`]
//!   stream when a frame does not fit in a datagram.
//!
//! Network tasks never touch session state; they report [`NetEvent`]s over a
//! `crossbeam-channel` that the transport drains from the emulator thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::Sender;
use nifi_proto::channel::ChannelKind;
use quinn::{ClientConfig, Connection, ConnectionError, Endpoint, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::PrivatePkcs8KeyDer;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::framing::{StreamFramer, encode_frame};
use crate::error::LanError;

/// Name presented in TLS; peers do not check it.
const SERVER_NAME: &str = "nifi.lan";

pub(crate) const CLOSE_NORMAL: u32 = 0;
pub(crate) const CLOSE_SESSION_FULL: u32 = 1;
pub(crate) const CLOSE_PROTOCOL: u32 = 2;
pub(crate) const CLOSE_REFUSED: u32 = 3;

/// Identity of one peer connection for the lifetime of the session.
pub(crate) type PeerKey = usize;

/// Queue of already-framed control messages for one peer.
pub(crate) type OutboundTx = mpsc::UnboundedSender<Bytes>;

#[derive(Debug)]
pub(crate) enum NetEvent {
    Connected {
        key: PeerKey,
        conn: Connection,
        outbound: OutboundTx,
        /// Player we dialed, `None` for accepted connections.
        dialed: Option<u8>,
    },
    ConnectFailed {
        dialed: Option<u8>,
        addr: SocketAddr,
        reason: String,
    },
    Disconnected {
        key: PeerKey,
        /// Application close code sent by the peer, if it closed cleanly.
        code: Option<u64>,
        reason: String,
    },
    Control {
        key: PeerKey,
        data: Bytes,
    },
    Mp {
        key: PeerKey,
        data: Bytes,
    },
}

pub(crate) fn close(conn: &Connection, code: u32, reason: &str) {
    conn.close(VarInt::from_u32(code), reason.as_bytes());
}

/// Create the session endpoint bound to `bind`. Must be given a handle to
/// the runtime that will drive it.
pub(crate) fn build_endpoint(handle: &Handle, bind: SocketAddr) -> Result<Endpoint, LanError> {
    let _guard = handle.enter();
    let mut endpoint = Endpoint::server(server_config()?, bind)
        .map_err(|e| LanError::Endpoint(format!("bind {bind}: {e}")))?;
    endpoint.set_default_client_config(client_config()?);
    Ok(endpoint)
}

fn transport_config() -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(1)));
    transport.max_idle_timeout(Some(VarInt::from_u32(10_000).into()));
    transport
}

fn server_config() -> Result<ServerConfig, LanError> {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string(), "localhost".to_string()])
            .map_err(|e| LanError::Tls(e.to_string()))?;
    let key = PrivatePkcs8KeyDer::from(signing_key.serialize_der());

    let mut config = ServerConfig::with_single_cert(vec![cert.der().clone()], key.into())
        .map_err(|e| LanError::Tls(e.to_string()))?;
    config.transport_config(Arc::new(transport_config()));
    Ok(config)
}

fn client_config() -> Result<ClientConfig, LanError> {
    // `ClientConfig::builder()` needs a process-wide provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let supported_algs = rustls::crypto::CryptoProvider::get_default()
        .map(|p| p.signature_verification_algorithms)
        .ok_or_else(|| LanError::Tls("no rustls CryptoProvider available".to_string()))?;

    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    tls.dangerous()
        .set_certificate_verifier(Arc::new(LanCertVerifier { supported_algs }));

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| LanError::Tls(format!("failed to build QUIC crypto config: {e}")))?;
    let mut config = ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config()));
    Ok(config)
}

/// Accepts whatever certificate a LAN peer presents, but still checks that
/// the handshake was signed with its key.
#[derive(Debug)]
struct LanCertVerifier {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for LanCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Accept incoming peers until the endpoint is closed.
pub(crate) async fn run_accept_loop(endpoint: Endpoint, tx: Sender<NetEvent>) {
    while let Some(incoming) = endpoint.accept().await {
        let tx = tx.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => {
                    debug!(peer = %conn.remote_address(), "incoming LAN connection");
                    spawn_connection(conn, None, tx);
                }
                Err(e) => debug!(error = %e, "incoming LAN connection failed"),
            }
        });
    }
}

/// Dial `addr` in the background; the outcome arrives as `Connected` or
/// `ConnectFailed`.
pub(crate) fn dial(
    handle: &Handle,
    endpoint: &Endpoint,
    addr: SocketAddr,
    dialed: Option<u8>,
    timeout: Duration,
    tx: Sender<NetEvent>,
) {
    let endpoint = endpoint.clone();
    handle.spawn(async move {
        let result = match endpoint.connect(addr, SERVER_NAME) {
            Ok(connecting) => match tokio::time::timeout(timeout, connecting).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("timed out".to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(conn) => {
                debug!(peer = %addr, ?dialed, "outgoing LAN connection established");
                spawn_connection(conn, dialed, tx);
            }
            Err(reason) => {
                let _ = tx.send(NetEvent::ConnectFailed {
                    dialed,
                    addr,
                    reason,
                });
            }
        }
    });
}

fn spawn_connection(conn: Connection, dialed: Option<u8>, tx: Sender<NetEvent>) {
    let key = conn.stable_id();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();

    if tx
        .send(NetEvent::Connected {
            key,
            conn: conn.clone(),
            outbound: out_tx,
            dialed,
        })
        .is_err()
    {
        close(&conn, CLOSE_NORMAL, "shutting down");
        return;
    }

    tokio::spawn(write_control(conn.clone(), out_rx));
    tokio::spawn(accept_streams(conn.clone(), tx.clone()));
    tokio::spawn(read_datagrams(conn.clone(), tx.clone()));
    tokio::spawn(async move {
        let err = conn.closed().await;
        let code = match &err {
            ConnectionError::ApplicationClosed(close) => Some(close.error_code.into_inner()),
            _ => None,
        };
        let _ = tx.send(NetEvent::Disconnected {
            key,
            code,
            reason: err.to_string(),
        });
    });
}

async fn write_control(conn: Connection, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut send = match conn.open_uni().await {
        Ok(send) => send,
        Err(e) => {
            debug!(error = %e, "failed to open control stream");
            return;
        }
    };
    if send.write_all(&[ChannelKind::Control as u8]).await.is_err() {
        return;
    }

    while let Some(frame) = rx.recv().await {
        if let Err(e) = send.write_all(&frame).await {
            debug!(error = %e, "control stream write failed");
            break;
        }
    }
    let _ = send.finish();
}

async fn accept_streams(conn: Connection, tx: Sender<NetEvent>) {
    let key = conn.stable_id();
    while let Ok(recv) = conn.accept_uni().await {
        tokio::spawn(read_stream(key, recv, tx.clone()));
    }
}

async fn read_stream(key: PeerKey, mut recv: quinn::RecvStream, tx: Sender<NetEvent>) {
    let mut kind = [0u8; 1];
    if recv.read_exact(&mut kind).await.is_err() {
        return;
    }
    let Some(kind) = ChannelKind::from_repr(kind[0]) else {
        warn!(key, channel = kind[0], "unknown stream channel");
        return;
    };

    let mut framer = StreamFramer::new(4096);
    loop {
        framer.buf_mut().reserve(4096);
        match recv.read_buf(framer.buf_mut()).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                trace!(key, error = %e, "stream read ended");
                break;
            }
        }

        let frames = match framer.drain_frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!(key, error = %e, "dropping malformed stream");
                break;
            }
        };
        for data in frames {
            let event = match kind {
                ChannelKind::Control => NetEvent::Control { key, data },
                ChannelKind::Mp => NetEvent::Mp { key, data },
            };
            if tx.send(event).is_err() {
                return;
            }
        }
    }
}

async fn read_datagrams(conn: Connection, tx: Sender<NetEvent>) {
    let key = conn.stable_id();
    while let Ok(data) = conn.read_datagram().await {
        if tx.send(NetEvent::Mp { key, data }).is_err() {
            break;
        }
    }
}

/// Send one gameplay frame, as a datagram when it fits.
pub(crate) fn send_mp(handle: &Handle, conn: &Connection, packet: Bytes) {
    if conn
        .max_datagram_size()
        .is_some_and(|max| packet.len() <= max)
    {
        match conn.send_datagram(packet.clone()) {
            Ok(()) => return,
            Err(quinn::SendDatagramError::TooLarge) => {}
            Err(e) => {
                trace!(error = %e, "datagram send failed");
                return;
            }
        }
    }

    let conn = conn.clone();
    handle.spawn(async move {
        let mut send = match conn.open_uni().await {
            Ok(send) => send,
            Err(e) => {
                trace!(error = %e, "failed to open MP stream");
                return;
            }
        };
        let mut buf = BytesMut::with_capacity(1 + 4 + packet.len());
        buf.put_u8(ChannelKind::Mp as u8);
        buf.extend_from_slice(&encode_frame(&packet));
        if let Err(e) = send.write_all(&buf).await {
            trace!(error = %e, "MP stream write failed");
            return;
        }
        let _ = send.finish();
    });
}

/// Queue a control message for `outbound`.
pub(crate) fn send_control(outbound: &OutboundTx, msg: &[u8]) {
    // A closed queue means the peer is going away; its Disconnected event
    // follows.
    let _ = outbound.send(encode_frame(msg));
}
