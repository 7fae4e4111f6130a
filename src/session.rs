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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream};

use ratelimit_meter::{DirectRateLimiter, GCRA};

use crate::error::{ThrumError, ThrumResult};
use crate::protocol::{fresh_nonce, Frame, Identity, LINE_LIMIT, LOCAL_FEATURES};
use crate::thrum::{Message, Shared};

/// Both HELLO legs must complete within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound frames queued per session before senders see `busy`.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Unanswered pings tolerated before the session closes.
pub const MAX_OUTSTANDING_PINGS: u32 = 3;

/// A single frame write stalling longer than this kills the session,
/// keeping the writer responsive to shutdown.
const WRITE_STALL: Duration = Duration::from_secs(1);

/// Malformed frames tolerated inside [`BAD_FRAME_WINDOW`]; the next one
/// closes the session.
const BAD_FRAME_LIMIT: NonZeroU32 = match NonZeroU32::new(2) {
    Some(n) => n,
    None => unreachable!(),
};

const BAD_FRAME_WINDOW: Duration = Duration::from_secs(10);

type PeerFramed = Framed<TcpStream, LinesCodec>;
type PeerSink = SplitSink<PeerFramed, String>;
type PeerStream = SplitStream<PeerFramed>;

/// Why a session left its OPEN state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// This side raised the shutdown flag.
    Requested,

    /// The remote sent BYE.
    Remote(String),

    /// Three keep-alive intervals passed without a matching PONG.
    KeepaliveTimeout,

    /// The remote broke the wire protocol.
    Protocol(String),

    /// The socket died or reached EOF.
    ConnectionLost,
}

impl CloseReason {
    /// Graceful closes skip the reconnect backoff penalty.
    pub fn is_graceful(&self) -> bool {
        matches!(self, CloseReason::Requested | CloseReason::Remote(_))
    }
}

/// Orchestrator-side grip on one open session.
///
/// Dropping the handle (after [`SessionHandle::close`]) lets the
/// session tasks wind down on their own.
pub struct SessionHandle {
    pub id: u64,
    pub identity: Identity,
    pub addr: SocketAddr,
    pub features: Vec<String>,
    pub outbound: bool,

    tx_frames: mpsc::Sender<Frame>,
    tx_shutdown: watch::Sender<bool>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: u64,
        identity: Identity,
        addr: SocketAddr,
        features: Vec<String>,
        outbound: bool,
        tx_frames: mpsc::Sender<Frame>,
        tx_shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            identity,
            addr,
            features,
            outbound,
            tx_frames,
            tx_shutdown,
        }
    }

    /// Queue a frame for transmission.
    ///
    /// Frames queued by one caller are transmitted in order. A full
    /// queue surfaces `busy` without closing the session.
    pub fn send(&self, frame: Frame) -> ThrumResult<()> {
        self.tx_frames.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ThrumError::Busy,
            TrySendError::Closed(_) => ThrumError::SessionClosed,
        })
    }

    /// Queue a best-effort BYE and raise the shutdown flag.
    pub fn close(&self, reason: &str) {
        let _ = self.tx_frames.try_send(Frame::Bye {
            reason: reason.to_string(),
        });
        let _ = self.tx_shutdown.send(true);
    }
}

/// The set of open sessions, keyed by remote identity.
pub struct SessionSet {
    sessions: HashMap<Identity, SessionHandle>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<&SessionHandle> {
        self.sessions.get(identity)
    }

    pub fn insert(&mut self, handle: SessionHandle) {
        self.sessions.insert(handle.identity.clone(), handle);
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<SessionHandle> {
        self.sessions.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionHandle> {
        self.sessions.values()
    }

    pub fn drain(&mut self) -> Vec<SessionHandle> {
        self.sessions.drain().map(|(_, handle)| handle).collect()
    }

    /// Fan one frame out to every open session except `except`.
    ///
    /// Copies that hit a full queue are dropped; returns the number of
    /// sessions the frame was queued on.
    pub fn broadcast_except(&self, frame: &Frame, except: Option<&Identity>) -> usize {
        let mut queued = 0;

        for (identity, handle) in &self.sessions {
            if Some(identity) == except {
                continue;
            }

            match handle.send(frame.clone()) {
                Ok(()) => queued += 1,
                Err(e) => debug!(
                    "Dropped {} fan-out copy (peer = {}): {}",
                    frame.kind(),
                    identity,
                    e
                ),
            }
        }

        queued
    }
}

/// One persistent peer session.
///
/// Construction performs the handshake; [`Session::run`] then drives
/// the reader and keep-alive while an inner task drains the outbound
/// queue, so a stalled write never blocks inbound delivery.
pub struct Session {
    id: u64,
    remote: Identity,

    stream: PeerStream,
    sink: Option<PeerSink>,

    rx_frames: Option<mpsc::Receiver<Frame>>,
    rx_shutdown: watch::Receiver<bool>,

    /// Clone of the outbound queue for PONG replies and keep-alive.
    tx_frames: mpsc::Sender<Frame>,

    /// Event channel back to the orchestrator.
    tx: mpsc::UnboundedSender<Message>,

    shared: Arc<Shared>,

    ping_interval: Duration,
    outstanding_pings: u32,
    sent_pings: HashMap<u64, Instant>,

    /// Malformed-frame meter; overflowing it closes the session.
    strikes: DirectRateLimiter<GCRA>,
}

impl Session {
    /// Dial `addr` and run the initiating side of the handshake.
    ///
    /// The remote must present the identity the directory advertised.
    pub async fn connect(
        id: u64,
        local: Identity,
        addr: SocketAddr,
        expected: Identity,
        ping_interval: Duration,
        tx: mpsc::UnboundedSender<Message>,
        shared: Arc<Shared>,
    ) -> ThrumResult<(SessionHandle, Session)> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr)).await??;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(LINE_LIMIT));

        let hello = Frame::Hello {
            identity: local,
            features: local_features(),
        };

        framed.send(serde_json::to_string(&hello)?).await?;

        match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut framed)).await?? {
            Frame::HelloOk { identity, features } => {
                if identity != expected {
                    return Err(ThrumError::HandshakeRefused(format!(
                        "identity mismatch: expected {}, got {}",
                        expected, identity
                    )));
                }

                Ok(Self::build(
                    id,
                    identity,
                    addr,
                    negotiate(features),
                    true,
                    framed,
                    ping_interval,
                    tx,
                    shared,
                ))
            }
            Frame::Error { code, .. } => Err(ThrumError::HandshakeRefused(code)),
            other => Err(ThrumError::HandshakeRefused(other.kind().to_string())),
        }
    }

    /// Run the accepting side of the handshake on an inbound stream.
    pub async fn accept(
        id: u64,
        local: Identity,
        stream: TcpStream,
        ping_interval: Duration,
        tx: mpsc::UnboundedSender<Message>,
        shared: Arc<Shared>,
    ) -> ThrumResult<(SessionHandle, Session)> {
        let addr = stream.peer_addr()?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(LINE_LIMIT));

        match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut framed)).await?? {
            Frame::Hello { identity, features } => {
                let reply = Frame::HelloOk {
                    identity: local,
                    features: local_features(),
                };

                framed.send(serde_json::to_string(&reply)?).await?;

                Ok(Self::build(
                    id,
                    identity,
                    addr,
                    negotiate(features),
                    false,
                    framed,
                    ping_interval,
                    tx,
                    shared,
                ))
            }
            other => {
                let refusal = Frame::error("bad_format");
                let _ = framed.send(serde_json::to_string(&refusal)?).await;

                Err(ThrumError::HandshakeRefused(other.kind().to_string()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: u64,
        remote: Identity,
        addr: SocketAddr,
        features: Vec<String>,
        outbound: bool,
        framed: PeerFramed,
        ping_interval: Duration,
        tx: mpsc::UnboundedSender<Message>,
        shared: Arc<Shared>,
    ) -> (SessionHandle, Session) {
        let (tx_frames, rx_frames) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (tx_shutdown, rx_shutdown) = watch::channel(false);
        let (sink, stream) = futures::stream::StreamExt::split(framed);

        let handle = SessionHandle::new(
            id,
            remote.clone(),
            addr,
            features,
            outbound,
            tx_frames.clone(),
            tx_shutdown,
        );

        let session = Session {
            id,
            remote,
            stream,
            sink: Some(sink),
            rx_frames: Some(rx_frames),
            rx_shutdown,
            tx_frames,
            tx,
            shared,
            ping_interval,
            outstanding_pings: 0,
            sent_pings: HashMap::new(),
            strikes: DirectRateLimiter::new(BAD_FRAME_LIMIT, BAD_FRAME_WINDOW),
        };

        (handle, session)
    }

    /// Drive the open session until it closes, then report back.
    pub async fn run(mut self) {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => return,
        };
        let rx_frames = match self.rx_frames.take() {
            Some(rx) => rx,
            None => return,
        };

        tokio::spawn(drain_outbound(
            sink,
            rx_frames,
            self.rx_shutdown.clone(),
            self.remote.clone(),
        ));

        let mut keepalive = interval(self.ping_interval);

        // The immediate first tick doubles as the opening RTT probe.
        let reason = loop {
            select! {
                _ = self.rx_shutdown.changed() => break CloseReason::Requested,
                _ = keepalive.tick() => {
                    if let Some(reason) = self.keepalive_tick() {
                        break reason;
                    }
                }
                frame = self.stream.next() => match frame {
                    None => break CloseReason::ConnectionLost,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let _ = self.tx_frames.try_send(Frame::Error {
                            code: "line_too_long".to_string(),
                            ref_id: None,
                            detail: None,
                            limit: Some(LINE_LIMIT as u32),
                        });

                        break CloseReason::Protocol("line_too_long".to_string());
                    }
                    Some(Err(_)) => break CloseReason::ConnectionLost,
                    Some(Ok(line)) => match serde_json::from_str::<Frame>(&line) {
                        Ok(frame) => {
                            if let Some(reason) = self.dispatch(frame).await {
                                break reason;
                            }
                        }
                        Err(e) => {
                            if let Some(reason) = self.strike(e) {
                                break reason;
                            }
                        }
                    }
                }
            }
        };

        debug!(
            "Session winding down (peer = {}) (reason = {:?})",
            self.remote, reason
        );

        let _ = self.tx.send(Message::Closed {
            id: self.id,
            identity: self.remote.clone(),
            reason,
        });
    }

    fn keepalive_tick(&mut self) -> Option<CloseReason> {
        if self.outstanding_pings >= MAX_OUTSTANDING_PINGS {
            let _ = self.tx_frames.try_send(Frame::Bye {
                reason: "keepalive".to_string(),
            });

            return Some(CloseReason::KeepaliveTimeout);
        }

        let expiry = self.ping_interval * MAX_OUTSTANDING_PINGS;
        self.sent_pings.retain(|_, at| at.elapsed() < expiry);

        let nonce = fresh_nonce();
        let ping = Frame::Ping {
            nonce,
            t_send: epoch_millis(),
        };

        if self.tx_frames.try_send(ping).is_ok() {
            self.sent_pings.insert(nonce, Instant::now());
            self.outstanding_pings += 1;
        }

        None
    }

    async fn dispatch(&mut self, frame: Frame) -> Option<CloseReason> {
        match frame {
            Frame::Ping { nonce, .. } => {
                if self.tx_frames.try_send(Frame::Pong { nonce }).is_err() {
                    debug!("Dropped PONG, outbound queue full (peer = {})", self.remote);
                }

                None
            }
            Frame::Pong { nonce } => {
                if let Some(sent) = self.sent_pings.remove(&nonce) {
                    self.outstanding_pings = 0;

                    let sample = sent.elapsed();

                    self.shared
                        .peers
                        .write()
                        .await
                        .record_rtt(&self.remote, sample);
                }

                None
            }
            Frame::Bye { reason } => Some(CloseReason::Remote(reason)),
            Frame::Hello { .. } | Frame::HelloOk { .. } => {
                // Handshake frames after OPEN are a protocol slip, not fatal.
                let _ = self.tx_frames.try_send(Frame::error("bad_format"));

                self.strike_silent()
            }
            other => {
                let _ = self.tx.send(Message::Inbound {
                    from: self.remote.clone(),
                    frame: other,
                });

                None
            }
        }
    }

    fn strike(&mut self, error: serde_json::Error) -> Option<CloseReason> {
        debug!(
            "Discarding malformed frame (peer = {}): {}",
            self.remote, error
        );

        let _ = self.tx_frames.try_send(Frame::error("invalid_json"));

        self.strike_silent()
    }

    fn strike_silent(&mut self) -> Option<CloseReason> {
        if self.strikes.check().is_err() {
            let _ = self.tx_frames.try_send(Frame::Bye {
                reason: "invalid_json".to_string(),
            });

            return Some(CloseReason::Protocol("invalid_json".to_string()));
        }

        None
    }
}

/// Writer half: drains the outbound queue onto the socket.
///
/// On shutdown the remaining queue, BYE included, is flushed
/// best-effort before the socket drops.
async fn drain_outbound(
    mut sink: PeerSink,
    mut rx_frames: mpsc::Receiver<Frame>,
    mut rx_shutdown: watch::Receiver<bool>,
    remote: Identity,
) {
    loop {
        select! {
            _ = rx_shutdown.changed() => break,
            frame = rx_frames.recv() => match frame {
                Some(frame) => {
                    if write_frame(&mut sink, &frame, &remote).await.is_err() {
                        return;
                    }
                }
                None => break,
            }
        }
    }

    while let Ok(frame) = rx_frames.try_recv() {
        if write_frame(&mut sink, &frame, &remote).await.is_err() {
            return;
        }
    }

    let _ = sink.close().await;
}

async fn write_frame(sink: &mut PeerSink, frame: &Frame, remote: &Identity) -> Result<(), ()> {
    let line = match serde_json::to_string(frame) {
        Ok(line) => line,
        Err(e) => {
            error!("Unable to encode {} frame: {}", frame.kind(), e);

            return Ok(());
        }
    };

    match timeout(WRITE_STALL, sink.send(line)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("Write failed (peer = {}): {}", remote, e);

            Err(())
        }
        Err(_) => {
            warn!("Write stalled (peer = {})", remote);

            Err(())
        }
    }
}

async fn read_frame(framed: &mut PeerFramed) -> ThrumResult<Frame> {
    match framed.next().await {
        Some(line) => Ok(serde_json::from_str(&line?)?),
        None => Err(ThrumError::SessionClosed),
    }
}

pub fn local_features() -> Vec<String> {
    LOCAL_FEATURES.iter().map(|f| f.to_string()).collect()
}

/// Feature negotiation keeps the intersection of both advertisements.
fn negotiate(remote: Vec<String>) -> Vec<String> {
    remote
        .into_iter()
        .filter(|f| LOCAL_FEATURES.contains(&f.as_str()))
        .collect()
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod tests {
    #[allow(unused_imports)]
    use super::*;
    #[allow(unused_imports)]
    use crate::peers::PeerTable;
    #[allow(unused_imports)]
    use tokio::net::TcpListener;
    #[allow(unused_imports)]
    use tokio::sync::RwLock;

    #[allow(dead_code)]
    fn shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Arc::new(Shared {
                peers: RwLock::new(PeerTable::new()),
                tx,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn handshake_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shared_a, _rx_a) = shared();
        let (shared_b, _rx_b) = shared();

        let bob: Identity = "bob@CIC".parse().unwrap();
        let tx_b = shared_b.tx.clone();

        let accept_side = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();

            Session::accept(1, bob, stream, Duration::from_secs(30), tx_b, shared_b).await
        });

        let alice: Identity = "alice@CIC".parse().unwrap();
        let tx_a = shared_a.tx.clone();

        let (handle, _session) = Session::connect(
            2,
            alice,
            addr,
            "bob@CIC".parse().unwrap(),
            Duration::from_secs(30),
            tx_a,
            shared_a,
        )
        .await
        .unwrap();

        assert_eq!(handle.identity.to_string(), "bob@CIC");
        assert!(handle.outbound);
        assert_eq!(handle.features, vec!["relay".to_string()]);

        let (in_handle, _in_session) = accept_side.await.unwrap().unwrap();

        assert_eq!(in_handle.identity.to_string(), "alice@CIC");
        assert!(!in_handle.outbound);
        assert_eq!(in_handle.features, vec!["relay".to_string()]);
    }

    #[tokio::test]
    async fn connect_rejects_identity_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shared_a, _rx_a) = shared();
        let (shared_b, _rx_b) = shared();

        let mallory: Identity = "mallory@CIC".parse().unwrap();
        let tx_b = shared_b.tx.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();

            let _ = Session::accept(1, mallory, stream, Duration::from_secs(30), tx_b, shared_b)
                .await;
        });

        let alice: Identity = "alice@CIC".parse().unwrap();
        let tx_a = shared_a.tx.clone();

        let result = Session::connect(
            2,
            alice,
            addr,
            "bob@CIC".parse().unwrap(),
            Duration::from_secs(30),
            tx_a,
            shared_a,
        )
        .await;

        assert!(matches!(result, Err(ThrumError::HandshakeRefused(_))));
    }

    #[tokio::test]
    async fn full_queue_reports_busy() {
        let (tx_frames, _rx_frames) = mpsc::channel(1);
        let (tx_shutdown, _rx_shutdown) = watch::channel(false);

        let handle = SessionHandle::new(
            7,
            "bob@CIC".parse().unwrap(),
            "127.0.0.1:6002".parse().unwrap(),
            vec![],
            true,
            tx_frames,
            tx_shutdown,
        );

        assert!(handle.send(Frame::Pong { nonce: 1 }).is_ok());

        match handle.send(Frame::Pong { nonce: 2 }) {
            Err(ThrumError::Busy) => {}
            other => panic!("expected busy, got {:?}", other),
        }
    }
}
