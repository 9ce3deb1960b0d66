//! Owns the long-lived "P2P" socket — the one and only reader of it —
//! accepts inbound session requests, and opens outbound sessions by
//! connection code or by directory index (§4.6).
//!
//! The P2P socket carries REQ/ACK handshake literals only (§9 "Shared
//! vs. per-session sockets": "this spec mandates the single P2P control
//! socket and a separate data-plane socket per session, because data
//! framing (1440 B) collides with control framing (17 B) if
//! multiplexed"). Each session gets its own locally-bound data socket;
//! REQ and ACK each carry two optional trailing bytes announcing the
//! sender's dedicated data-socket port, so both sides learn where to
//! send key-agreement and data traffic before the session opens.

use crate::connection_code;
use crate::directory::Directory;
use crate::error::{PortsError, Result};
use crate::session::{AuthHooks, NoAuth, Session};
use crate::user::{Device, User};
use crossbeam_channel::{bounded, Sender};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const REQ: &[u8] = b"PORTS_SESSION_REQ";
const ACK: &[u8] = b"PORTS_SESSION_ACK";

/// Largest single UDP read the accept loop expects: the REQ/ACK
/// literals plus their two-byte trailing port are both far smaller than
/// this, but the buffer is shared with nothing else.
const RECV_BUF_LEN: usize = 64;

/// Read timeout set on every per-session data socket, matching the P2P
/// socket's own poll cadence.
const DATA_SOCKET_POLL: Duration = Duration::from_millis(200);

pub type SessionId = u64;

pub struct SessionManager {
    p2p_socket: Arc<UdpSocket>,
    pub p2p_local_addr: SocketAddr,
    sessions: DashMap<(Ipv4Addr, u16), Arc<Session>>,
    ids: DashMap<SessionId, (Ipv4Addr, u16)>,
    endpoint_to_id: DashMap<(Ipv4Addr, u16), SessionId>,
    /// One-shot notification per in-flight outbound handshake, keyed by
    /// the peer's P2P control endpoint. The accept loop is still the
    /// only `recv_from` caller on the shared socket, so an ACK's payload
    /// (the peer's announced data-socket port) has to reach
    /// `handshake()` this way rather than by a second reader on the
    /// same socket.
    pending_acks: DashMap<(Ipv4Addr, u16), Sender<SocketAddr>>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    directory: Arc<Directory>,
    attempt_key_agreement: bool,
    /// Default auth hooks handed to every new session at construction
    /// time (§9 "avoid dynamic rebinding after Active"). Set this once,
    /// before the first peer connects, via [`Self::set_default_auth_hooks`]
    /// — a per-session setter can no longer win the race once `open()`
    /// has already driven the session past `Authenticating`.
    default_auth_hooks: RwLock<Arc<dyn AuthHooks>>,
}

impl SessionManager {
    pub fn new(directory: Arc<Directory>, attempt_key_agreement: bool) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        let local_addr = socket.local_addr()?;
        let manager = Arc::new(Self {
            p2p_socket: Arc::new(socket),
            p2p_local_addr: local_addr,
            sessions: DashMap::new(),
            ids: DashMap::new(),
            endpoint_to_id: DashMap::new(),
            pending_acks: DashMap::new(),
            next_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(true)),
            directory,
            attempt_key_agreement,
            default_auth_hooks: RwLock::new(Arc::new(NoAuth)),
        });
        manager.clone().spawn_accept_loop();
        Ok(manager)
    }

    pub fn generate_code(&self, local_ip: Ipv4Addr) -> String {
        connection_code::encode(local_ip, self.p2p_local_addr.port())
    }

    /// Install the hooks every *subsequently created* session will start
    /// with. Must be called before the first peer connects — existing
    /// sessions are unaffected.
    pub fn set_default_auth_hooks(&self, hooks: Arc<dyn AuthHooks>) {
        *self.default_auth_hooks.write() = hooks;
    }

    fn spawn_accept_loop(self: Arc<Self>) {
        thread::spawn(move || {
            let mut buf = [0u8; RECV_BUF_LEN];
            while self.running.load(Ordering::Relaxed) {
                match self.p2p_socket.recv_from(&mut buf) {
                    Ok((n, src)) => self.route_inbound(&buf[..n], src),
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        tracing::error!(error = %e, "p2p accept loop lost its socket, stopping");
                        break;
                    }
                }
            }
        });
    }

    /// Single demultiplexing point for the shared socket: REQ spawns or
    /// re-acks a session, ACK notifies whichever `handshake()` call is
    /// waiting on this peer. Key agreement and data never arrive here —
    /// each session reads those off its own dedicated socket.
    fn route_inbound(self: &Arc<Self>, data: &[u8], src: SocketAddr) {
        if data.len() >= REQ.len() && &data[..REQ.len()] == REQ {
            self.handle_req(data, src);
            return;
        }

        let SocketAddr::V4(src_v4) = src else { return };
        if data.len() >= ACK.len() && &data[..ACK.len()] == ACK {
            let peer_data_port = Self::trailing_port(data, ACK.len()).unwrap_or(src_v4.port());
            let peer_data_addr = SocketAddr::new((*src_v4.ip()).into(), peer_data_port);
            let key = (*src_v4.ip(), src_v4.port());
            if let Some(tx) = self.pending_acks.get(&key) {
                let _ = tx.send(peer_data_addr);
            }
        }
    }

    /// Parse the two optional trailing bytes of a REQ/ACK literal as the
    /// sender's dedicated data-socket port.
    fn trailing_port(data: &[u8], literal_len: usize) -> Option<u16> {
        if data.len() >= literal_len + 2 {
            Some(u16::from_be_bytes([data[literal_len], data[literal_len + 1]]))
        } else {
            None
        }
    }

    fn handle_req(self: &Arc<Self>, data: &[u8], src: SocketAddr) {
        let SocketAddr::V4(src_v4) = src else { return };
        let peer_ip = *src_v4.ip();
        // The initiator's dedicated data-socket port, falling back to
        // its REQ source port for peers that never announce one.
        let peer_data_port = Self::trailing_port(data, REQ.len()).unwrap_or(src_v4.port());
        let peer_data_addr = SocketAddr::new(peer_ip.into(), peer_data_port);

        let key = (peer_ip, src_v4.port());
        if let Some(existing) = self.sessions.get(&key) {
            // Duplicate REQ (e.g. a retried handshake): resend ACK for
            // the session's existing data socket rather than opening a
            // second one.
            self.send_ack(existing.local_data_port(), src);
            return;
        }

        let data_socket = match UdpSocket::bind(("0.0.0.0", 0)) {
            Ok(sock) => sock,
            Err(e) => {
                tracing::warn!(peer = ?key, error = %e, "failed to bind a data socket for inbound session");
                return;
            }
        };
        if let Err(e) = data_socket.set_read_timeout(Some(DATA_SOCKET_POLL)) {
            tracing::warn!(peer = ?key, error = %e, "failed to configure inbound data socket");
            return;
        }
        let local_data_port = match data_socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                tracing::warn!(peer = ?key, error = %e, "failed to read inbound data socket's local address");
                return;
            }
        };

        self.send_ack(local_data_port, src);
        self.spawn_passive_session(peer_ip, src_v4.port(), Arc::new(data_socket), peer_data_addr);
        tracing::info!(peer = ?key, "accepted inbound session");
    }

    fn send_ack(&self, local_data_port: u16, dest: SocketAddr) {
        let mut reply = Vec::with_capacity(ACK.len() + 2);
        reply.extend_from_slice(ACK);
        reply.extend_from_slice(&local_data_port.to_be_bytes());
        if let Err(e) = self.p2p_socket.send_to(&reply, dest) {
            tracing::warn!(error = %e, "failed to ack incoming session request");
        }
    }

    fn spawn_passive_session(
        self: &Arc<Self>,
        ip: Ipv4Addr,
        port: u16,
        data_socket: Arc<UdpSocket>,
        peer_data_addr: SocketAddr,
    ) {
        let device = Device::new(ip, port, User::unknown());
        let hooks = self.default_auth_hooks.read().clone();
        let session = Session::new_with_hooks(data_socket, device, peer_data_addr, self.attempt_key_agreement, hooks);
        self.insert_session(ip, port, session.clone());

        // Key agreement and the auth challenge block on network I/O;
        // run them off the accept loop's thread so one slow handshake
        // can't stall every other inbound REQ (§9 "insert the session
        // before calling open()" also means it's discoverable mid-handshake).
        let attempt_key_agreement = self.attempt_key_agreement;
        thread::spawn(move || session.open(attempt_key_agreement));
    }

    fn insert_session(&self, ip: Ipv4Addr, port: u16, session: Arc<Session>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert((ip, port), session);
        self.ids.insert(id, (ip, port));
        self.endpoint_to_id.insert((ip, port), id);
        id
    }

    /// Look up the id of a session — passively accepted or outbound —
    /// by its peer endpoint.
    pub fn session_id_for(&self, ip: Ipv4Addr, port: u16) -> Option<SessionId> {
        self.endpoint_to_id.get(&(ip, port)).map(|e| *e)
    }

    /// Every session id currently tracked, passively accepted or not.
    pub fn active_ids(&self) -> Vec<SessionId> {
        self.ids.iter().map(|e| *e.key()).collect()
    }

    /// Bind this session's dedicated data socket, then send REQ
    /// (announcing its port) over the shared P2P socket up to `retry`
    /// times, waiting for the matching ACK — relayed by the accept loop
    /// through a one-shot channel, since the accept loop remains the
    /// only `recv_from` caller on the shared socket.
    fn handshake(&self, ip: Ipv4Addr, port: u16, retry: u32, timeout: Duration) -> Result<(Arc<UdpSocket>, SocketAddr)> {
        let dest = SocketAddr::new(ip.into(), port);
        let data_socket = UdpSocket::bind(("0.0.0.0", 0))?;
        data_socket.set_read_timeout(Some(DATA_SOCKET_POLL))?;
        let local_data_port = data_socket.local_addr()?.port();

        let mut req = Vec::with_capacity(REQ.len() + 2);
        req.extend_from_slice(REQ);
        req.extend_from_slice(&local_data_port.to_be_bytes());

        let key = (ip, port);
        let (tx, rx) = bounded::<SocketAddr>(1);
        self.pending_acks.insert(key, tx);

        let outcome = (|| {
            for _ in 0..retry {
                self.p2p_socket.send_to(&req, dest)?;
                if let Ok(peer_data_addr) = rx.recv_timeout(timeout) {
                    return Ok(peer_data_addr);
                }
            }
            Err(PortsError::HandshakeTimeout)
        })();

        self.pending_acks.remove(&key);
        outcome.map(|peer_data_addr| (Arc::new(data_socket), peer_data_addr))
    }

    /// Outbound open by connection code (§4.6).
    pub fn open_by_code(
        self: &Arc<Self>,
        code: &str,
        retry: u32,
        timeout: Duration,
    ) -> Result<SessionId> {
        let (ip, port) = connection_code::decode(code)?;
        self.open_outbound(ip, port, None, retry, timeout)
    }

    /// Outbound open by directory index (§4.6).
    pub fn open_by_index(
        self: &Arc<Self>,
        index: usize,
        retry: u32,
        timeout: Duration,
    ) -> Result<SessionId> {
        let entry = self.directory.get(index).ok_or(PortsError::UnknownSession)?;
        let (ip, port) = entry.parsed.announced;
        let public_key = if entry.parsed.public_key.is_empty() {
            None
        } else {
            Some(entry.parsed.public_key.clone())
        };
        self.open_outbound(ip, port, public_key, retry, timeout)
    }

    fn open_outbound(
        self: &Arc<Self>,
        ip: Ipv4Addr,
        port: u16,
        public_key: Option<Vec<u8>>,
        retry: u32,
        timeout: Duration,
    ) -> Result<SessionId> {
        if self.sessions.contains_key(&(ip, port)) {
            return Err(PortsError::AlreadyConnected);
        }
        if let Some(ref pk) = public_key {
            let duplicate = self
                .sessions
                .iter()
                .any(|entry| entry.value().device().user.public_key.as_deref() == Some(pk.as_slice()));
            if duplicate {
                return Err(PortsError::AlreadyConnected);
            }
        }

        let (data_socket, peer_data_addr) = self.handshake(ip, port, retry, timeout)?;

        let user = User::remote(Vec::new(), Vec::new(), public_key);
        let device = Device::new(ip, port, user);
        let hooks = self.default_auth_hooks.read().clone();
        let session = Session::new_with_hooks(data_socket, device, peer_data_addr, self.attempt_key_agreement, hooks);
        let id = self.insert_session(ip, port, session.clone());
        session.open(self.attempt_key_agreement);
        Ok(id)
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        let key = self.ids.get(&id).ok_or(PortsError::UnknownSession)?;
        self.sessions
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or(PortsError::UnknownSession)
    }

    pub fn send(&self, id: SessionId, bytes: Vec<u8>) -> Result<()> {
        self.session(id)?.send(bytes, 0, [0; 4])
    }

    pub fn recv_history(&self, id: SessionId) -> Result<Vec<Vec<u8>>> {
        Ok(self.session(id)?.received_history())
    }

    pub fn close_session(&self, id: SessionId) {
        if let Some((_, key)) = self.ids.remove(&id) {
            self.endpoint_to_id.remove(&key);
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.close();
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_manager() -> Arc<SessionManager> {
        let dir = Arc::new(Directory::new(8));
        SessionManager::new(dir, false).unwrap()
    }

    struct AlwaysAuthenticated;
    impl AuthHooks for AlwaysAuthenticated {
        fn challenge(&self, _session: &Session) -> Option<bool> {
            Some(true)
        }
    }

    #[test]
    fn default_auth_hooks_apply_to_sessions_created_afterward() {
        let initiator = fresh_manager();
        let responder = fresh_manager();
        responder.set_default_auth_hooks(Arc::new(AlwaysAuthenticated));
        let responder_port = responder.p2p_local_addr.port();
        let code = connection_code::encode(Ipv4Addr::new(127, 0, 0, 1), responder_port);

        initiator
            .open_by_code(&code, 5, Duration::from_millis(300))
            .expect("handshake succeeds against a live responder");

        let responder_id = (0..50)
            .find_map(|_| {
                let id = responder.active_ids().first().copied();
                if id.is_none() {
                    thread::sleep(Duration::from_millis(20));
                }
                id
            })
            .expect("responder observes the inbound session");
        let session = (0..50)
            .find_map(|_| {
                let s = responder.session(responder_id).unwrap();
                if s.is_authenticated() {
                    Some(s)
                } else {
                    thread::sleep(Duration::from_millis(20));
                    None
                }
            })
            .expect("responder's session authenticates");
        assert!(session.is_authenticated());
    }

    #[test]
    fn s4_duplicate_open_by_code_is_rejected() {
        let initiator = fresh_manager();
        let responder = fresh_manager();
        let responder_port = responder.p2p_local_addr.port();
        let code = connection_code::encode(Ipv4Addr::new(127, 0, 0, 1), responder_port);

        let first = initiator.open_by_code(&code, 3, Duration::from_millis(200));
        assert!(first.is_ok());

        let second = initiator.open_by_code(&code, 3, Duration::from_millis(200));
        assert!(matches!(second, Err(PortsError::AlreadyConnected)));
    }

    #[test]
    fn handshake_timeout_when_nobody_listens() {
        let initiator = fresh_manager();
        // A bound-but-silent UDP socket: nobody will answer the REQ.
        let silent = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = silent.local_addr().unwrap().port();
        let code = connection_code::encode(Ipv4Addr::new(127, 0, 0, 1), port);
        let result = initiator.open_by_code(&code, 2, Duration::from_millis(50));
        assert!(matches!(result, Err(PortsError::HandshakeTimeout)));
    }

    #[test]
    fn s3_loopback_session_and_blob_exchange() {
        let initiator = fresh_manager();
        let responder = fresh_manager();
        let responder_port = responder.p2p_local_addr.port();
        let code = connection_code::encode(Ipv4Addr::new(127, 0, 0, 1), responder_port);

        let initiator_id = initiator
            .open_by_code(&code, 5, Duration::from_millis(300))
            .expect("handshake succeeds against a live responder");

        let responder_id = (0..50)
            .find_map(|_| {
                let id = responder.active_ids().first().copied();
                if id.is_none() {
                    thread::sleep(Duration::from_millis(20));
                }
                id
            })
            .expect("responder observes the inbound session");

        let blob = vec![42u8; 5000];
        initiator.send(initiator_id, blob.clone()).unwrap();

        let received = (0..100)
            .find_map(|_| {
                let history = responder.recv_history(responder_id).unwrap();
                if history.is_empty() {
                    thread::sleep(Duration::from_millis(20));
                    None
                } else {
                    Some(history)
                }
            })
            .expect("responder receives the blob");
        assert_eq!(received, vec![blob]);
    }

    /// With key agreement enabled on both sides, the peer's X25519 reply
    /// arrives on the session's own dedicated socket and the session
    /// ends up encrypted rather than silently falling back.
    #[test]
    fn key_agreement_succeeds_over_dedicated_sockets() {
        let dir_a = Arc::new(Directory::new(8));
        let dir_b = Arc::new(Directory::new(8));
        let initiator = SessionManager::new(dir_a, true).unwrap();
        let responder = SessionManager::new(dir_b, true).unwrap();
        let responder_port = responder.p2p_local_addr.port();
        let code = connection_code::encode(Ipv4Addr::new(127, 0, 0, 1), responder_port);

        let initiator_id = initiator
            .open_by_code(&code, 5, Duration::from_millis(300))
            .expect("handshake succeeds against a live responder");
        let initiator_session = initiator.session(initiator_id).unwrap();

        let responder_id = (0..50)
            .find_map(|_| {
                let id = responder.active_ids().first().copied();
                if id.is_none() {
                    thread::sleep(Duration::from_millis(20));
                }
                id
            })
            .expect("responder observes the inbound session");
        let responder_session = responder.session(responder_id).unwrap();

        let blob = vec![17u8; 2000];
        initiator.send(initiator_id, blob.clone()).unwrap();

        let received = (0..150)
            .find_map(|_| {
                let history = responder.recv_history(responder_id).unwrap();
                if history.is_empty() {
                    thread::sleep(Duration::from_millis(20));
                    None
                } else {
                    Some(history)
                }
            })
            .expect("responder receives the blob even though it's sealed under the agreed key");
        assert_eq!(received, vec![blob]);
        assert_eq!(initiator_session.state(), crate::session::SessionState::Active);
        assert_eq!(responder_session.state(), crate::session::SessionState::Active);
    }
}
