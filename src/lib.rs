//! Public engine surface: wires together multicast presence, channel
//! arbitration, the peer directory, and session management (§6).

mod arbiter;
mod codec;
mod config;
mod connection_code;
mod crypto;
mod directory;
mod error;
mod multicast;
mod net;
mod presence;
mod session;
mod session_manager;
mod user;

pub use config::EngineConfig;
pub use connection_code::parse_host_alias;
pub use directory::DirectoryEntrySnapshot;
pub use error::{PortsError, Result};
pub use session::{AuthHooks, NoAuth, SessionState};
pub use session_manager::SessionId;

use crypto::Identity;
use directory::Directory;
use multicast::MulticastEngine;
use session::Session;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// Top-level handle to a running discovery/session engine. Dropping it
/// (or calling [`Engine::close`]) stops the background listener threads.
pub struct Engine {
    config: EngineConfig,
    local_ip: Ipv4Addr,
    directory: Arc<Directory>,
    multicast: Arc<MulticastEngine>,
    arbiter: Option<arbiter::ChannelArbiter>,
    sessions: Arc<session_manager::SessionManager>,
    identity: Identity,
}

impl Engine {
    /// Select a local IPv4 address, join the candidate multicast groups,
    /// adopt a free channel for self-announcement, and start the P2P
    /// session-accept loop. Fails if no multicast group could be joined
    /// or every channel candidate is already occupied.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let local_ip = net::select_local_ipv4();
        let directory = Arc::new(Directory::new(config.candidate_groups.len()));
        let identity = Identity::generate();

        let multicast = MulticastEngine::start(&config, local_ip, directory.clone())?;
        let sessions = session_manager::SessionManager::new(directory.clone(), config.attempt_key_agreement)?;

        let names = config.local_names.join(" ");
        let surnames = config.local_surnames.join(" ");
        let public_key = identity.public_bytes;
        let announced = (local_ip, sessions.p2p_local_addr.port());
        let arbiter = arbiter::ChannelArbiter::adopt(&config, local_ip, config::PRESENCE_PORT, move || {
            arbiter::build_announce_payload(&names, &surnames, Some(&public_key), announced)
        });
        let arbiter = match arbiter {
            Ok(a) => Some(a),
            Err(e) => {
                tracing::warn!(error = %e, "continuing without a self-announced channel");
                None
            }
        };

        Ok(Self {
            config,
            local_ip,
            directory,
            multicast,
            arbiter,
            sessions,
            identity,
        })
    }

    /// Stop all background threads. Further calls on this engine return
    /// `TransportClosed`-flavored errors from the underlying sessions.
    pub fn close(&self) {
        self.multicast.stop();
        self.sessions.stop();
    }

    /// The multicast group this process is announcing on, if adoption
    /// succeeded (§4.5).
    pub fn owned_channel(&self) -> Option<Ipv4Addr> {
        self.arbiter.as_ref().and_then(|a| a.owned_group())
    }

    /// Snapshot of every peer observed via presence announcements.
    pub fn list_directory(&self) -> Vec<DirectoryEntrySnapshot> {
        self.directory.snapshot()
    }

    /// This process's long-term identity public key, as advertised in
    /// presence announcements.
    pub fn local_public_key(&self) -> [u8; 32] {
        self.identity.public_bytes
    }

    /// The connection code for reaching this engine's P2P listener
    /// directly, bypassing discovery (§4.6).
    pub fn generate_code(&self) -> String {
        self.sessions.generate_code(self.local_ip)
    }

    /// Open an outbound session by connection code, using the engine's
    /// configured handshake retry/timeout.
    pub fn open_session_by_code(&self, code: &str) -> Result<SessionId> {
        self.sessions
            .open_by_code(code, self.config.handshake_retry, self.config.handshake_timeout)
    }

    /// Open an outbound session to the directory entry at `index`.
    pub fn open_session_by_index(&self, index: usize) -> Result<SessionId> {
        self.sessions
            .open_by_index(index, self.config.handshake_retry, self.config.handshake_timeout)
    }

    /// Find the id of a session — passively accepted or outbound — to
    /// a given peer. Useful on the accepting side, which never calls
    /// `open_session_*` itself.
    pub fn find_session(&self, ip: Ipv4Addr, port: u16) -> Option<SessionId> {
        self.sessions.session_id_for(ip, port)
    }

    /// Every session id currently tracked by this engine, passively
    /// accepted or opened outbound.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.active_ids()
    }

    pub fn send(&self, id: SessionId, bytes: Vec<u8>) -> Result<()> {
        self.sessions.send(id, bytes)
    }

    pub fn recv_history(&self, id: SessionId) -> Result<Vec<Vec<u8>>> {
        self.sessions.recv_history(id)
    }

    pub fn close_session(&self, id: SessionId) {
        self.sessions.close_session(id)
    }

    /// Install authentication callbacks on a still-handshaking session
    /// (must run before the session reaches `Active`, §9). In this
    /// engine a session transitions to `Active` synchronously as part of
    /// its handshake, before its id is ever returned to the caller, so
    /// this setter can never actually win that race — use
    /// [`Self::set_default_auth_hooks`] before opening or accepting any
    /// session instead. Kept for API symmetry with §6 and for sessions
    /// an embedder chooses to drive through `Session::open` manually.
    pub fn set_auth_hooks(&self, id: SessionId, hooks: Arc<dyn AuthHooks>) -> Result<()> {
        let session: Arc<Session> = self.sessions.session(id)?;
        session.set_auth_hooks(hooks)
    }

    /// Install the authentication hooks every session opened or accepted
    /// from now on will start with. Call this right after [`Engine::open`]
    /// and before any peer connects.
    pub fn set_default_auth_hooks(&self, hooks: Arc<dyn AuthHooks>) {
        self.sessions.set_default_auth_hooks(hooks);
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}
