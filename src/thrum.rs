// Thrum - Peer-to-peer rendezvous chat over persistent line-delimited JSON sessions
// Copyright (C) 2021  Thrum Developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, timeout, Duration};

use crate::config::{Config, Overlay};
use crate::directory::{Directory, PeerRecord};
use crate::error::{ThrumError, ThrumResult};
use crate::peers::{PeerStatus, PeerTable};
use crate::protocol::{Frame, Identity};
use crate::router::Router;
use crate::session::{CloseReason, Session, SessionHandle, SessionSet};
use crate::shell::{self, Command, EventSink, PeerScope};

/// Reconciler cadence; `/reconnect` runs the same sweep on demand.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of the deadline sweeper (ACK waits, parked sends, caches).
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Every 4th discovery tick queries all namespaces.
const WILDCARD_EVERY: u64 = 4;

/// Concurrent outbound dial attempts.
const MAX_CONCURRENT_DIALS: usize = 8;

/// Retry spacing for REGISTER after a transient failure.
const REGISTER_RETRY: Duration = Duration::from_secs(30);

/// Full stop on directory traffic after `rate_limited`.
const RATE_LIMIT_HOLD: Duration = Duration::from_secs(60);

/// Budget for BYEs plus the final UNREGISTER on the way out.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Internal events funneled into the orchestrator loop.
pub enum Message {
    DiscoveryTick,
    ReconcileTick,
    SweepTick,

    /// One DISCOVER snapshot, fetched off-loop.
    DirectoryBatch {
        scope: Option<String>,
        records: Vec<PeerRecord>,
    },

    /// The directory asked us to back off.
    DirectoryHold,

    /// A handshake finished; the session is running.
    Opened(SessionHandle),

    DialFailed {
        identity: Identity,
    },

    /// A routed frame delivered by a session.
    Inbound {
        from: Identity,
        frame: Frame,
    },

    Closed {
        id: u64,
        identity: Identity,
        reason: CloseReason,
    },

    /// One raw prompt line.
    Command(String),
}

/// State shared between the orchestrator, sessions, and workers.
pub struct Shared {
    /// The peer table; sessions feed RTT samples straight into it.
    pub peers: RwLock<PeerTable>,

    /// Every task reports back through this.
    pub tx: mpsc::UnboundedSender<Message>,
}

/// The orchestrator: owns the peer table and the session set, runs the
/// discovery worker, the reconciler, and the deadline sweeper.
pub struct Thrum {
    /// TCP listener for inbound peer sessions.
    listener: TcpListener,

    shared: Arc<Shared>,

    /// Open sessions, exactly one per connected identity.
    sessions: SessionSet,

    /// Main event loop receiver.
    rx: mpsc::UnboundedReceiver<Message>,

    router: Router,

    directory: Directory,

    sink: Arc<dyn EventSink>,

    local: Identity,
    listen_port: u16,
    ttl_seconds: u64,
    overlay: Overlay,

    /// Identities with a dial in flight.
    dialing: HashSet<Identity>,

    discovery_ticks: u64,

    /// Directory calls are paused until this instant after `rate_limited`.
    hold_until: Option<Instant>,

    next_session_id: u64,
}

impl Thrum {
    pub async fn new(config: Config, sink: Arc<dyn EventSink>) -> ThrumResult<Self> {
        let local = Identity::new(&config.general.name, &config.general.namespace)?;

        let (tx, rx) = mpsc::unbounded_channel();

        let listener = TcpListener::bind(("0.0.0.0", config.general.listen_port)).await?;

        info!(
            "Listening for peer sessions (identity = {}) (port = {})",
            local, config.general.listen_port
        );

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                peers: RwLock::new(PeerTable::new()),
                tx,
            }),
            sessions: SessionSet::new(),
            rx,
            router: Router::new(local.clone(), config.overlay.relay_ttl, sink.clone()),
            directory: Directory::new(
                config.rendezvous.rendezvous_host.clone(),
                config.rendezvous.rendezvous_port,
            ),
            sink,
            local,
            listen_port: config.general.listen_port,
            ttl_seconds: config.rendezvous.ttl_seconds,
            overlay: config.overlay,
            dialing: HashSet::new(),
            discovery_ticks: 0,
            hold_until: None,
            next_session_id: 0,
        })
    }

    /// Register, then run the main event loop until `/quit` or ctrl-c.
    pub async fn up(&mut self) -> ThrumResult<()> {
        self.register().await?;
        self.start_timers();
        self.start_console();

        // Prime the peer table without waiting a full interval.
        self.spawn_discover(Some(self.local.namespace().to_string()));

        info!("Started processing sessions");

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => break,
                Ok((stream, addr)) = self.listener.accept() => {
                    self.accept_peer(stream, addr);
                }
                Some(message) = self.rx.recv() => {
                    if self.handle_message(message).await {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;

        Ok(())
    }

    /// REGISTER must succeed before any other directory traffic.
    ///
    /// Validation refusals are fatal; everything else retries.
    async fn register(&mut self) -> ThrumResult<()> {
        loop {
            let attempt = self
                .directory
                .register(
                    self.local.namespace(),
                    self.local.name(),
                    self.listen_port,
                    Some(self.ttl_seconds),
                )
                .await;

            match attempt {
                Ok(registration) => {
                    info!(
                        "Registered with directory (ttl = {}) (observed = {}:{})",
                        registration.ttl, registration.observed_ip, registration.observed_port
                    );

                    return Ok(());
                }
                Err(e) if e.is_validation() => {
                    error!("Directory rejected our registration (code = {})", e.code());

                    return Err(e);
                }
                Err(ThrumError::Ratelimited) => {
                    warn!(
                        "Directory rate limit hit, holding off (hold = {:?})",
                        RATE_LIMIT_HOLD
                    );

                    sleep(RATE_LIMIT_HOLD).await;
                }
                Err(e) => {
                    warn!(
                        "Registration failed, retrying (retry = {:?}) (error = {})",
                        REGISTER_RETRY, e
                    );

                    sleep(REGISTER_RETRY).await;
                }
            }
        }
    }

    /// Returns true when the loop should wind down.
    async fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::DiscoveryTick => self.discovery_tick(),
            Message::ReconcileTick => self.reconcile().await,
            Message::SweepTick => self.router.sweep(&self.sessions).await,
            Message::DirectoryBatch { scope, records } => {
                self.apply_directory_batch(scope, records).await;
            }
            Message::DirectoryHold => {
                self.hold_until = Some(Instant::now() + RATE_LIMIT_HOLD);
            }
            Message::Opened(handle) => self.session_opened(handle).await,
            Message::DialFailed { identity } => {
                self.dialing.remove(&identity);

                // The inbound leg of a dual-connect race may have won
                // while our dial was in flight; leave that peer alone.
                if self.sessions.get(&identity).is_none() {
                    self.schedule_reconnect(&identity).await;
                }
            }
            Message::Inbound { from, frame } => {
                self.router.handle_frame(&from, frame, &self.sessions).await;
            }
            Message::Closed {
                id,
                identity,
                reason,
            } => self.session_closed(id, identity, reason).await,
            Message::Command(line) => return self.handle_command(line).await,
        }

        false
    }

    fn discovery_tick(&mut self) {
        if let Some(until) = self.hold_until {
            if Instant::now() < until {
                debug!("Directory on hold, skipping discovery tick");

                return;
            }

            self.hold_until = None;
        }

        self.discovery_ticks += 1;

        let scope = if self.discovery_ticks % WILDCARD_EVERY == 0 {
            None
        } else {
            Some(self.local.namespace().to_string())
        };

        self.spawn_discover(scope);
    }

    fn spawn_discover(&self, scope: Option<String>) {
        let shared = self.shared.clone();
        let directory = self.directory.clone();

        tokio::spawn(async move {
            match directory.discover(scope.as_deref()).await {
                Ok(records) => {
                    let _ = shared.tx.send(Message::DirectoryBatch { scope, records });
                }
                Err(ThrumError::Ratelimited) => {
                    warn!("Directory rate limit hit, backing off");

                    let _ = shared.tx.send(Message::DirectoryHold);
                }
                Err(e) => warn!("Discovery failed (error = {})", e),
            }
        });
    }

    async fn apply_directory_batch(&mut self, scope: Option<String>, records: Vec<PeerRecord>) {
        let total = records.len();
        let mut present = HashSet::new();

        let demoted = {
            let mut peers = self.shared.peers.write().await;

            for record in &records {
                if record.name == self.local.name()
                    && record.namespace == self.local.namespace()
                {
                    continue;
                }

                match peers.upsert_from_directory(record) {
                    Ok(identity) => {
                        present.insert(identity);
                    }
                    Err(e) => debug!("Skipping malformed directory record (error = {})", e),
                }
            }

            peers.mark_missing_as_stale(&present, scope.as_deref())
        };

        for identity in demoted {
            info!("Peer dropped out of the directory (identity = {})", identity);

            if let Some(handle) = self.sessions.remove(&identity) {
                handle.close("stale");
            }
        }

        debug!(
            "Directory snapshot applied (scope = {}) (records = {})",
            scope.as_deref().unwrap_or("*"),
            total
        );
    }

    /// Walk the table and dial whatever is due, within the caps.
    async fn reconcile(&mut self) {
        let candidates = { self.shared.peers.read().await.candidates(Instant::now()) };

        for (identity, addr) in candidates {
            if self.dialing.len() >= MAX_CONCURRENT_DIALS {
                break;
            }

            if self.sessions.len() + self.dialing.len() >= self.overlay.max_sessions {
                break;
            }

            if identity == self.local
                || self.dialing.contains(&identity)
                || self.sessions.get(&identity).is_some()
            {
                continue;
            }

            self.dial(identity, addr).await;
        }
    }

    async fn dial(&mut self, identity: Identity, addr: SocketAddr) {
        self.dialing.insert(identity.clone());

        {
            self.shared
                .peers
                .write()
                .await
                .set_status(&identity, PeerStatus::Connecting);
        }

        let id = self.next_id();
        let local = self.local.clone();
        let shared = self.shared.clone();
        let tx = self.shared.tx.clone();
        let ping = Duration::from_secs(self.overlay.ping_interval);

        debug!("Dialing peer (identity = {}) (addr = {})", identity, addr);

        tokio::spawn(async move {
            match Session::connect(id, local, addr, identity.clone(), ping, tx.clone(), shared)
                .await
            {
                Ok((handle, session)) => {
                    if tx.send(Message::Opened(handle)).is_err() {
                        return;
                    }

                    session.run().await;
                }
                Err(e) => {
                    debug!("Dial failed (identity = {}) (error = {})", identity, e);

                    let _ = tx.send(Message::DialFailed { identity });
                }
            }
        });
    }

    fn accept_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.sessions.len() >= self.overlay.max_sessions {
            warn!("Session cap reached, refusing connection (addr = {})", addr);

            return;
        }

        debug!("Peer has connected (addr = {})", addr);

        let id = self.next_id();
        let local = self.local.clone();
        let shared = self.shared.clone();
        let tx = self.shared.tx.clone();
        let ping = Duration::from_secs(self.overlay.ping_interval);

        tokio::spawn(async move {
            match Session::accept(id, local, stream, ping, tx.clone(), shared).await {
                Ok((handle, session)) => {
                    if tx.send(Message::Opened(handle)).is_err() {
                        return;
                    }

                    session.run().await;
                }
                Err(e) => debug!("Inbound handshake failed (addr = {}) (error = {})", addr, e),
            }
        });
    }

    async fn session_opened(&mut self, handle: SessionHandle) {
        let identity = handle.identity.clone();

        self.dialing.remove(&identity);

        if self.sessions.get(&identity).is_some() {
            if keep_new_session(&self.local, &identity, handle.outbound) {
                if let Some(old) = self.sessions.remove(&identity) {
                    debug!("Replacing duplicate session (identity = {})", identity);

                    old.close("duplicate");
                }
            } else {
                debug!("Refusing duplicate session (identity = {})", identity);

                handle.close("duplicate");

                return;
            }
        }

        {
            let mut peers = self.shared.peers.write().await;

            peers.ensure(&identity, handle.addr);
            peers.set_status(&identity, PeerStatus::Connected);
        }

        info!(
            "Session open (identity = {}) (direction = {})",
            identity,
            if handle.outbound { "outbound" } else { "inbound" }
        );

        self.sessions.insert(handle);
    }

    async fn session_closed(&mut self, id: u64, identity: Identity, reason: CloseReason) {
        let current = matches!(self.sessions.get(&identity), Some(handle) if handle.id == id);

        if !current {
            debug!(
                "Ignoring close of a superseded session (identity = {})",
                identity
            );

            return;
        }

        self.sessions.remove(&identity);

        info!(
            "Session closed (identity = {}) (reason = {:?})",
            identity, reason
        );

        if reason.is_graceful() {
            self.shared
                .peers
                .write()
                .await
                .set_status(&identity, PeerStatus::Stale);
        } else {
            self.schedule_reconnect(&identity).await;
        }
    }

    async fn schedule_reconnect(&mut self, identity: &Identity) {
        let delay = {
            self.shared.peers.write().await.schedule_retry(
                identity,
                self.overlay.reconnect_backoff_base,
                self.overlay.max_reconnect_attempts,
            )
        };

        match delay {
            Some(delay) => debug!(
                "Reconnect scheduled (identity = {}) (delay = {:?})",
                identity, delay
            ),
            None => warn!(
                "Peer exhausted reconnect attempts (identity = {})",
                identity
            ),
        }
    }

    /// Returns true on `/quit`.
    async fn handle_command(&mut self, line: String) -> bool {
        let line = line.trim();

        if line.is_empty() {
            return false;
        }

        let command = match shell::parse_command(line) {
            Some(command) => command,
            None => {
                self.sink
                    .notice("unrecognized command, see /help".to_string())
                    .await;

                return false;
            }
        };

        match command {
            Command::Help => self.sink.notice(shell::help_text().to_string()).await,
            Command::Quit => return true,
            Command::Peers(scope) => self.render_peers(scope).await,
            Command::Conn => self.render_sessions().await,
            Command::Rtt => self.render_rtt().await,
            Command::Reconnect => {
                info!("Reconnect sweep requested");

                self.reconcile().await;
            }
            Command::Log(level) => {
                log::set_max_level(level);

                self.sink.notice(format!("log level set to {}", level)).await;
            }
            Command::Msg(dst, text) => {
                self.router.originate_send(dst, text, &self.sessions).await;
            }
            Command::Publish(dst, text) => {
                self.router.originate_pub(dst, text, &self.sessions).await;
            }
        }

        false
    }

    async fn render_peers(&self, scope: Option<PeerScope>) {
        let snapshot = { self.shared.peers.read().await.snapshot() };

        let mut lines = Vec::new();

        for peer in snapshot {
            let keep = match &scope {
                None => peer.identity.namespace() == self.local.namespace(),
                Some(PeerScope::All) => true,
                Some(PeerScope::Namespace(ns)) => peer.identity.namespace() == ns,
            };

            if !keep {
                continue;
            }

            lines.push(format!(
                "{} {} {} rtt={}",
                peer.identity,
                peer.addr,
                peer.status,
                fmt_rtt(peer.rtt)
            ));
        }

        if lines.is_empty() {
            self.sink.notice("no peers known".to_string()).await;
        } else {
            self.sink.notice(lines.join("\n")).await;
        }
    }

    async fn render_sessions(&self) {
        let mut lines: Vec<String> = self
            .sessions
            .iter()
            .map(|handle| {
                format!(
                    "{} {} features={}",
                    handle.identity,
                    if handle.outbound { "outbound" } else { "inbound" },
                    if handle.features.is_empty() {
                        "-".to_string()
                    } else {
                        handle.features.join(",")
                    }
                )
            })
            .collect();

        lines.sort();

        if lines.is_empty() {
            self.sink.notice("no open sessions".to_string()).await;
        } else {
            self.sink.notice(lines.join("\n")).await;
        }
    }

    async fn render_rtt(&self) {
        let snapshot = { self.shared.peers.read().await.snapshot() };

        let lines: Vec<String> = snapshot
            .iter()
            .filter(|peer| peer.status == PeerStatus::Connected)
            .map(|peer| format!("{} {}", peer.identity, fmt_rtt(peer.rtt)))
            .collect();

        if lines.is_empty() {
            self.sink.notice("no connected peers".to_string()).await;
        } else {
            self.sink.notice(lines.join("\n")).await;
        }
    }

    /// BYE every session and UNREGISTER once, inside the budget.
    async fn shutdown(&mut self) {
        info!("Shutting down (sessions = {})", self.sessions.len());

        let graceful = timeout(SHUTDOWN_BUDGET, async {
            for handle in self.sessions.drain() {
                handle.close("quit");
            }

            // Leave the writers a moment to flush their BYEs.
            sleep(Duration::from_millis(250)).await;

            let unregistered = self
                .directory
                .unregister(self.local.namespace(), self.local.name(), self.listen_port)
                .await;

            match unregistered {
                Ok(()) => info!("Unregistered from directory"),
                Err(e) => warn!("Directory unregister failed (error = {})", e),
            }
        })
        .await;

        if graceful.is_err() {
            warn!("Shutdown budget exceeded, closing anyway");
        }
    }

    /// Background timers feeding ticks into the main loop.
    fn start_timers(&self) {
        let shared = self.shared.clone();
        let discovery_interval = Duration::from_secs(self.overlay.discovery_interval);

        tokio::spawn(async move {
            loop {
                sleep(discovery_interval).await;

                if shared.tx.send(Message::DiscoveryTick).is_err() {
                    break;
                }
            }
        });

        let shared = self.shared.clone();

        tokio::spawn(async move {
            loop {
                sleep(RECONCILE_INTERVAL).await;

                if shared.tx.send(Message::ReconcileTick).is_err() {
                    break;
                }
            }
        });

        let shared = self.shared.clone();

        tokio::spawn(async move {
            loop {
                sleep(SWEEP_INTERVAL).await;

                if shared.tx.send(Message::SweepTick).is_err() {
                    break;
                }
            }
        });
    }

    /// Forward prompt lines into the main loop.
    fn start_console(&self) {
        let tx = self.shared.tx.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin()).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(Message::Command(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Unable to read the prompt: {}", e);

                        break;
                    }
                }
            }
        });
    }

    fn next_id(&mut self) -> u64 {
        self.next_session_id += 1;

        self.next_session_id
    }
}

/// Dual-connect tie-break: the dial originating from the lexicographically
/// smaller identity survives, on both ends.
fn keep_new_session(local: &Identity, remote: &Identity, new_outbound: bool) -> bool {
    if new_outbound {
        local < remote
    } else {
        remote < local
    }
}

fn fmt_rtt(rtt: Option<std::time::Duration>) -> String {
    match rtt {
        Some(rtt) => format!("{}ms", rtt.as_millis()),
        None => "-".to_string(),
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn duplicate_sessions_resolve_the_same_way_on_both_ends() {
        let alice: Identity = "alice@CIC".parse().unwrap();
        let bob: Identity = "bob@CIC".parse().unwrap();

        // Alice is smaller: her dial wins everywhere.
        assert!(keep_new_session(&alice, &bob, true));
        assert!(!keep_new_session(&alice, &bob, false));
        assert!(keep_new_session(&bob, &alice, false));
        assert!(!keep_new_session(&bob, &alice, true));
    }

    #[test]
    fn rtt_formatting() {
        assert_eq!(fmt_rtt(None), "-");
        assert_eq!(
            fmt_rtt(Some(std::time::Duration::from_millis(12))),
            "12ms"
        );
    }
}
