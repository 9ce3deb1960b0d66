//! Per-peer session state machine (§4.7): handshake, optional key
//! agreement, optional authentication, send/receive queues, in-order
//! reassembly, history.
//!
//! Each session owns an exclusive, locally-bound data-plane socket,
//! separate from the manager's shared P2P control socket (§9 "Shared vs.
//! per-session sockets": "this spec mandates the single P2P control
//! socket and a separate data-plane socket per session, because data
//! framing (1440 B) collides with control framing (17 B) if
//! multiplexed"). A session writes key-agreement and data datagrams to
//! `peer_data_addr` over its own socket and is the sole reader of that
//! socket, once its background sender/receiver threads are running.

use crate::codec::{self, Transform};
use crate::config::MAX_PACKET_COUNT;
use crate::crypto::{ChaChaTransform, KeyAgreement};
use crate::error::{PortsError, Result};
use crate::user::Device;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Handshaking,
    KeyAgreeing,
    Authenticating,
    Active,
    Closed,
}

/// Authentication callback slots (§9 "Callbacks vs. inheritance"): a
/// session carries either a concrete implementation or [`NoAuth`]. Avoid
/// dynamic rebinding after `Active` — [`Session::set_auth_hooks`]
/// enforces this.
pub trait AuthHooks: Send + Sync {
    fn challenge(&self, _session: &Session) -> Option<bool> {
        None
    }
    fn respond(&self, _session: &Session, challenge_bytes: &[u8]) -> Vec<u8> {
        challenge_bytes.to_vec()
    }
    fn verify(&self, _proof_bytes: &[u8], _peer_public_key: &[u8]) -> bool {
        false
    }
}

pub struct NoAuth;
impl AuthHooks for NoAuth {}

struct SendJob {
    blob: Vec<u8>,
    content_type: u8,
    extra: [u8; 4],
}

pub struct Session {
    socket: Arc<UdpSocket>,
    peer_data_addr: SocketAddr,
    device: RwLock<Device>,
    state: RwLock<SessionState>,
    transform: RwLock<Option<Arc<dyn Transform + Send + Sync>>>,
    auth_hooks: RwLock<Arc<dyn AuthHooks>>,
    active: AtomicBool,
    authenticated: AtomicBool,
    sent_history: Mutex<Vec<Vec<u8>>>,
    received_history: Mutex<Vec<Vec<u8>>>,
    send_tx: Sender<SendJob>,
    send_rx: Receiver<SendJob>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl Session {
    pub fn new(socket: Arc<UdpSocket>, device: Device, peer_data_addr: SocketAddr, wants_encryption: bool) -> Arc<Self> {
        Self::new_with_hooks(socket, device, peer_data_addr, wants_encryption, Arc::new(NoAuth))
    }

    pub fn new_with_hooks(
        socket: Arc<UdpSocket>,
        device: Device,
        peer_data_addr: SocketAddr,
        _wants_encryption: bool,
        hooks: Arc<dyn AuthHooks>,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = bounded::<SendJob>(64);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        Arc::new(Self {
            socket,
            peer_data_addr,
            device: RwLock::new(device),
            state: RwLock::new(SessionState::New),
            transform: RwLock::new(None),
            auth_hooks: RwLock::new(hooks),
            active: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            sent_history: Mutex::new(Vec::new()),
            received_history: Mutex::new(Vec::new()),
            send_tx,
            send_rx,
            stop_tx,
            stop_rx,
        })
    }

    /// Snapshot of this session's peer device.
    pub fn device(&self) -> Device {
        self.device.read().clone()
    }

    /// This session's exclusive data-socket address on the peer's side.
    pub fn peer_data_addr(&self) -> SocketAddr {
        self.peer_data_addr
    }

    /// Local port of this session's dedicated data socket — what a
    /// resent handshake ACK advertises when a peer retries a REQ for a
    /// session that already exists, so the retry lands on the same
    /// socket every time.
    pub fn local_data_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, s: SessionState) {
        *self.state.write() = s;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_auth_hooks(&self, hooks: Arc<dyn AuthHooks>) -> Result<()> {
        if self.state() == SessionState::Active || self.state() == SessionState::Closed {
            return Err(PortsError::TransportClosed);
        }
        *self.auth_hooks.write() = hooks;
        Ok(())
    }

    /// Drive the session from `New` to `Active`: optional key agreement,
    /// then optional authentication, then start the background
    /// sender/receiver. Blocking; run on a thread that can afford to
    /// wait out the key-agreement/challenge timeouts.
    pub fn open(self: &Arc<Self>, attempt_key_agreement: bool) {
        self.set_state(SessionState::Handshaking);

        if attempt_key_agreement {
            self.set_state(SessionState::KeyAgreeing);
            match self.try_key_agreement() {
                Ok(key) => {
                    *self.transform.write() = Some(Arc::new(ChaChaTransform::new(key)));
                    tracing::info!(peer = ?self.peer_data_addr, "key agreement succeeded");
                }
                Err(e) => {
                    *self.transform.write() = None;
                    tracing::warn!(peer = ?self.peer_data_addr, error = %e, "key agreement failed, continuing unencrypted");
                }
            }
        }

        let hooks = self.auth_hooks.read().clone();
        self.set_state(SessionState::Authenticating);
        match hooks.challenge(self) {
            Some(true) => {
                self.authenticated.store(true, Ordering::Release);
                self.device.write().user.authenticated_by_me = true;
            }
            Some(false) => {
                self.authenticated.store(false, Ordering::Release);
                tracing::warn!(
                    peer = ?self.peer_data_addr,
                    error = %PortsError::AuthenticationFailed,
                    "challenge did not verify, continuing unauthenticated"
                );
            }
            None => self.authenticated.store(false, Ordering::Release),
        }

        self.set_state(SessionState::Active);
        self.active.store(true, Ordering::Release);
        self.spawn_sender();
        self.spawn_receiver();
    }

    /// Send an ephemeral X25519 public value to the peer's data socket
    /// and wait for its reply on this session's own socket — the same
    /// exclusive socket the receiver thread takes over once `open()`
    /// returns, so there is exactly one reader at any given time.
    fn try_key_agreement(self: &Arc<Self>) -> std::io::Result<[u8; 32]> {
        let agreement = KeyAgreement::start();
        self.socket.send_to(&agreement.public_bytes, self.peer_data_addr)?;

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut buf = [0u8; 64];
        while Instant::now() < deadline {
            match self.socket.recv_from(&mut buf) {
                Ok((32, _src)) => {
                    let mut arr = [0u8; 32];
                    arr.copy_from_slice(&buf[..32]);
                    return Ok(agreement.finish(&arr));
                }
                Ok(_) => continue,
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "key agreement timed out"))
    }

    fn spawn_sender(self: &Arc<Self>) {
        let session = self.clone();
        thread::spawn(move || loop {
            if session.stop_rx.try_recv().is_ok() {
                break;
            }
            match session.send_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(job) => session.transmit(job),
                Err(RecvTimeoutError::Timeout) => {
                    if !session.is_active() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });
    }

    /// Sole reader of this session's dedicated socket: reads one header,
    /// learns its packet count via [`codec::peek_packet_count`], then
    /// reads exactly that many more packets before reassembling.
    fn spawn_receiver(self: &Arc<Self>) {
        let session = self.clone();
        thread::spawn(move || {
            let mut buf = vec![0u8; 2048];
            loop {
                if session.stop_rx.try_recv().is_ok() {
                    break;
                }
                match session.socket.recv_from(&mut buf) {
                    Ok((n, _src)) => session.receive_blob(buf[..n].to_vec()),
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        if !session.is_active() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    /// Read one more datagram off this session's socket before
    /// `deadline`, used mid-reassembly once a header has already
    /// arrived. Only ever called from the receiver thread, so it never
    /// races `spawn_receiver`'s own loop.
    fn recv_until(&self, deadline: Instant) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        while Instant::now() < deadline {
            match self.socket.recv_from(&mut buf) {
                Ok((n, _src)) => return Some(buf[..n].to_vec()),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => return None,
            }
        }
        None
    }

    fn receive_blob(&self, header_raw: Vec<u8>) {
        let transform_guard = self.transform.read();
        let transform_ref = transform_guard.as_deref();

        let packet_count = match codec::peek_packet_count(&header_raw, transform_ref) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(peer = ?self.peer_data_addr, error = %e, "dropping malformed header");
                return;
            }
        };
        if packet_count > MAX_PACKET_COUNT {
            tracing::warn!(peer = ?self.peer_data_addr, packet_count, "header claims an unreasonable packet count, dropping");
            return;
        }

        let mut datagrams = Vec::with_capacity(packet_count + 1);
        datagrams.push(header_raw);
        let deadline = Instant::now() + Duration::from_secs(2);
        for _ in 0..packet_count {
            match self.recv_until(deadline) {
                Some(packet) => datagrams.push(packet),
                None => {
                    tracing::warn!(peer = ?self.peer_data_addr, "incomplete blob, dropping");
                    return;
                }
            }
        }

        match codec::decode(&datagrams, transform_ref) {
            Ok(blob) => self.received_history.lock().push(blob),
            Err(e) => tracing::warn!(peer = ?self.peer_data_addr, error = %e, "dropping malformed blob"),
        }
    }

    fn transmit(&self, job: SendJob) {
        let transform_guard = self.transform.read();
        let transform_ref = transform_guard.as_deref();
        let datagrams = codec::encode(&job.blob, transform_ref, job.content_type, job.extra);
        for dg in &datagrams {
            if let Err(e) = self.socket.send_to(dg, self.peer_data_addr) {
                tracing::warn!(peer = ?self.peer_data_addr, error = %e, "send failed");
            }
        }
        self.sent_history.lock().push(job.blob);
    }

    pub fn send(&self, blob: Vec<u8>, content_type: u8, extra: [u8; 4]) -> Result<()> {
        if !self.is_active() {
            return Err(PortsError::TransportClosed);
        }
        self.send_tx
            .send(SendJob { blob, content_type, extra })
            .map_err(|_| PortsError::TransportClosed)
    }

    /// Hand a complete, already-collected batch of datagrams straight to
    /// the decoder, bypassing the socket entirely. Used by callers (and
    /// tests) driving the wire format manually rather than through a
    /// live socket pair.
    pub fn recv_datagrams(&self, datagrams: Vec<Vec<u8>>) {
        let transform_guard = self.transform.read();
        let transform_ref = transform_guard.as_deref();
        match codec::decode(&datagrams, transform_ref) {
            Ok(blob) => self.received_history.lock().push(blob),
            Err(e) => tracing::warn!(peer = ?self.peer_data_addr, error = %e, "dropping malformed blob"),
        }
    }

    pub fn sent_history(&self) -> Vec<Vec<u8>> {
        self.sent_history.lock().clone()
    }

    pub fn received_history(&self) -> Vec<Vec<u8>> {
        self.received_history.lock().clone()
    }

    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.stop_tx.send(());
        self.set_state(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::User;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn make_pair() -> (Arc<Session>, Arc<Session>) {
        let sock_a = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).unwrap());
        let sock_b = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).unwrap());
        sock_a.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        sock_b.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let addr_a = sock_a.local_addr().unwrap();
        let addr_b = sock_b.local_addr().unwrap();

        let dev_a = Device::new(Ipv4Addr::LOCALHOST, addr_b.port(), User::unknown());
        let dev_b = Device::new(Ipv4Addr::LOCALHOST, addr_a.port(), User::unknown());

        let sess_a = Session::new(sock_a, dev_a, addr_b, false);
        let sess_b = Session::new(sock_b, dev_b, addr_a, false);
        (sess_a, sess_b)
    }

    #[test]
    fn unencrypted_session_sends_and_receives_via_manual_batch() {
        let (sess_a, sess_b) = make_pair();
        sess_a.open(false);
        sess_b.open(false);

        let blob = vec![5u8; 4000];
        let datagrams = codec::encode(&blob, None, 0, [0; 4]);
        sess_b.recv_datagrams(datagrams);

        assert_eq!(sess_b.received_history(), vec![blob]);
        sess_a.close();
        sess_b.close();
    }

    #[test]
    fn streaming_receiver_reassembles_datagrams_over_its_own_socket() {
        let (sess_a, sess_b) = make_pair();
        sess_a.open(false);
        sess_b.open(false);

        let blob = vec![9u8; 3000];
        sess_a.send(blob.clone(), 0, [0; 4]).unwrap();

        let received = (0..100)
            .find_map(|_| {
                let history = sess_b.received_history();
                if history.is_empty() {
                    thread::sleep(Duration::from_millis(20));
                    None
                } else {
                    Some(history)
                }
            })
            .expect("sess_b receives the blob");
        assert_eq!(received, vec![blob]);

        sess_a.close();
        sess_b.close();
    }

    #[test]
    fn send_after_close_is_transport_closed() {
        let (sess_a, sess_b) = make_pair();
        sess_a.open(false);
        sess_b.open(false);
        sess_a.close();
        assert!(matches!(sess_a.send(vec![1], 0, [0; 4]), Err(PortsError::TransportClosed)));
        sess_b.close();
    }
}
