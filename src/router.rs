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

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::time::{Duration, Instant};

use crate::error::ThrumError;
use crate::protocol::{fresh_msg_id, Destination, Frame, Identity};
use crate::session::SessionSet;
use crate::shell::EventSink;

/// Seen-set bounds: enough to ride out a full flood of a classroom-scale
/// overlay twice over.
pub const SEEN_CAPACITY: usize = 4096;
pub const SEEN_RETENTION: Duration = Duration::from_secs(30);

/// Route-cache entries go stale after this.
const ROUTE_FRESHNESS: Duration = Duration::from_secs(60);

/// How long an originated SEND may wait for its ACK.
const ACK_DEADLINE: Duration = Duration::from_secs(5);

/// How long a parked send waits for a WHO_HAS_HIT.
const DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

/// Deduplication memory of recently handled message ids.
///
/// Each entry remembers the originator and the session the first copy
/// arrived on; the latter doubles as the reverse path for WHO_HAS_HIT
/// and multi-hop ACK delivery.
pub struct SeenSet {
    capacity: usize,
    retention: Duration,
    entries: HashMap<String, SeenEntry>,
    order: VecDeque<String>,
}

struct SeenEntry {
    origin: String,
    from: Option<Identity>,
    at: Instant,
}

/// Short-lived next-hop hints learned from WHO_HAS_HIT replies.
pub struct RouteCache {
    freshness: Duration,
    entries: HashMap<Identity, Route>,
}

struct Route {
    next_hop: Identity,
    at: Instant,
}

/// Where a unicast in flight came from, deciding who hears about its fate.
#[derive(Debug, Clone, PartialEq)]
enum SendOrigin {
    Local,
    Relay(Identity),
}

struct PendingAck {
    dst: Identity,
    deadline: Instant,
}

struct ParkedSend {
    frame: Frame,
    deadline: Instant,
    origin: SendOrigin,
}

/// The message engine: classifies, deduplicates, forwards, acknowledges,
/// and times out every non-control frame.
pub struct Router {
    local: Identity,
    relay_ttl: u32,
    seen: SeenSet,
    routes: RouteCache,

    /// Originated unicasts awaiting their end-to-end ACK.
    pending_acks: HashMap<String, PendingAck>,

    /// Unicasts parked while a WHO_HAS probe is out, keyed by probe id.
    parked: HashMap<String, ParkedSend>,

    sink: Arc<dyn EventSink>,
}

impl SeenSet {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity,
            retention,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a message id. Returns false when it was already seen.
    pub fn observe(&mut self, msg_id: &str, origin: &str, from: Option<&Identity>) -> bool {
        if let Some(entry) = self.entries.get(msg_id) {
            if entry.origin != origin {
                debug!("Message id reused across origins (msg_id = {})", msg_id);
            }

            return false;
        }

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(
            msg_id.to_string(),
            SeenEntry {
                origin: origin.to_string(),
                from: from.cloned(),
                at: Instant::now(),
            },
        );
        self.order.push_back(msg_id.to_string());

        true
    }

    /// Session the first copy arrived on, if any.
    pub fn reverse(&self, msg_id: &str) -> Option<&Identity> {
        self.entries.get(msg_id).and_then(|e| e.from.as_ref())
    }

    /// Age out entries past the retention window.
    pub fn purge(&mut self) {
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map(|e| e.at.elapsed() >= self.retention)
                .unwrap_or(true);

            if !expired {
                break;
            }

            if let Some(msg_id) = self.order.pop_front() {
                self.entries.remove(&msg_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl RouteCache {
    pub fn new(freshness: Duration) -> Self {
        Self {
            freshness,
            entries: HashMap::new(),
        }
    }

    pub fn learn(&mut self, dst: Identity, next_hop: Identity) {
        self.entries.insert(
            dst,
            Route {
                next_hop,
                at: Instant::now(),
            },
        );
    }

    pub fn next_hop(&self, dst: &Identity) -> Option<&Identity> {
        self.entries
            .get(dst)
            .filter(|r| r.at.elapsed() < self.freshness)
            .map(|r| &r.next_hop)
    }

    pub fn invalidate(&mut self, dst: &Identity) {
        self.entries.remove(dst);
    }

    pub fn purge(&mut self) {
        let freshness = self.freshness;

        self.entries.retain(|_, r| r.at.elapsed() < freshness);
    }
}

impl Router {
    pub fn new(local: Identity, relay_ttl: u32, sink: Arc<dyn EventSink>) -> Self {
        Self {
            local,
            relay_ttl,
            seen: SeenSet::new(SEEN_CAPACITY, SEEN_RETENTION),
            routes: RouteCache::new(ROUTE_FRESHNESS),
            pending_acks: HashMap::new(),
            parked: HashMap::new(),
            sink,
        }
    }

    /// Start a unicast from the local shell.
    pub async fn originate_send(&mut self, dst: Identity, payload: String, sessions: &SessionSet) {
        if dst == self.local {
            let src = self.local.clone();
            self.sink.message(&src, &payload).await;

            return;
        }

        let frame = Frame::Send {
            msg_id: fresh_msg_id(),
            src: self.local.clone(),
            dst: Destination::Peer(dst),
            payload,
            ttl: self.relay_ttl,
        };

        self.dispatch_unicast(frame, SendOrigin::Local, sessions).await;
    }

    /// Start a namespace or global publish from the local shell.
    pub async fn originate_pub(&mut self, dst: Destination, payload: String, sessions: &SessionSet) {
        if matches!(dst, Destination::Peer(_)) {
            self.sink
                .notice("publish needs a namespace or * destination".to_string())
                .await;

            return;
        }

        let msg_id = fresh_msg_id();

        self.seen.observe(&msg_id, &self.local.to_string(), None);

        let frame = Frame::Pub {
            msg_id,
            src: self.local.clone(),
            dst,
            payload,
            ttl: self.relay_ttl,
        };

        if sessions.broadcast_except(&frame, None) == 0 {
            self.sink
                .notice("no open sessions to publish to".to_string())
                .await;
        }
    }

    /// Process one routed frame delivered by a session.
    pub async fn handle_frame(&mut self, from: &Identity, frame: Frame, sessions: &SessionSet) {
        match frame {
            Frame::Send {
                msg_id,
                src,
                dst,
                payload,
                ttl,
            } => {
                self.handle_send(from, msg_id, src, dst, payload, ttl, sessions)
                    .await
            }
            Frame::Ack { ref_id } => self.handle_ack(from, ref_id, sessions),
            Frame::Pub {
                msg_id,
                src,
                dst,
                payload,
                ttl,
            } => {
                self.handle_pub(from, msg_id, src, dst, payload, ttl, sessions)
                    .await
            }
            Frame::WhoHas { msg_id, dst, ttl } => {
                self.handle_who_has(from, msg_id, dst, ttl, sessions)
            }
            Frame::WhoHasHit {
                msg_id,
                dst,
                via,
                ttl,
            } => self.handle_hit(from, msg_id, dst, via, ttl, sessions).await,
            Frame::Error { code, ref_id, .. } => self.handle_error(from, code, ref_id).await,
            other => debug!(
                "Ignoring unexpected {} frame (peer = {})",
                other.kind(),
                from
            ),
        }
    }

    /// Expire overdue ACK waits and parked sends; age out the caches.
    pub async fn sweep(&mut self, sessions: &SessionSet) {
        let now = Instant::now();

        let overdue: Vec<String> = self
            .pending_acks
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(msg_id, _)| msg_id.clone())
            .collect();

        for msg_id in overdue {
            if let Some(pending) = self.pending_acks.remove(&msg_id) {
                self.routes.invalidate(&pending.dst);
                self.sink
                    .notice(format!(
                        "ack_timeout (dst = {}) (msg_id = {})",
                        pending.dst, msg_id
                    ))
                    .await;
            }
        }

        let routeless: Vec<String> = self
            .parked
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(probe_id, _)| probe_id.clone())
            .collect();

        for probe_id in routeless {
            if let Some(parked) = self.parked.remove(&probe_id) {
                if let Frame::Send {
                    msg_id,
                    dst: Destination::Peer(dst),
                    ..
                } = &parked.frame
                {
                    self.fail_send(&parked.origin, "no_route", msg_id, dst, sessions)
                        .await;
                }
            }
        }

        self.seen.purge();
        self.routes.purge();
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_send(
        &mut self,
        from: &Identity,
        msg_id: String,
        src: Identity,
        dst: Destination,
        payload: String,
        ttl: u32,
        sessions: &SessionSet,
    ) {
        let dst = match dst {
            Destination::Peer(dst) => dst,
            _ => {
                debug!("Dropping SEND with fan-out destination (peer = {})", from);

                return;
            }
        };

        if dst == self.local {
            if self.seen.observe(&msg_id, &src.to_string(), Some(from)) {
                self.sink.message(&src, &payload).await;

                if let Some(handle) = sessions.get(from) {
                    if let Err(e) = handle.send(Frame::Ack {
                        ref_id: msg_id.clone(),
                    }) {
                        debug!("Unable to queue ACK (peer = {}): {}", from, e);
                    }
                }
            }

            return;
        }

        // Relay path: dedup, then spend a hop.
        if !self.seen.observe(&msg_id, &src.to_string(), Some(from)) {
            return;
        }

        let ttl = ttl.saturating_sub(1);

        if ttl == 0 {
            if let Some(handle) = sessions.get(from) {
                let _ = handle.send(Frame::error_ref("ttl_expired", &msg_id));
            }

            return;
        }

        let frame = Frame::Send {
            msg_id,
            src,
            dst: Destination::Peer(dst),
            payload,
            ttl,
        };

        self.dispatch_unicast(frame, SendOrigin::Relay(from.clone()), sessions)
            .await;
    }

    fn handle_ack(&mut self, from: &Identity, ref_id: String, sessions: &SessionSet) {
        if let Some(pending) = self.pending_acks.remove(&ref_id) {
            debug!(
                "Delivery acknowledged (dst = {}) (msg_id = {})",
                pending.dst, ref_id
            );

            return;
        }

        // Not ours; walk it back toward the origin.
        if let Some(hop) = self.seen.reverse(&ref_id).cloned() {
            if let Some(handle) = sessions.get(&hop) {
                let _ = handle.send(Frame::Ack { ref_id });
            }
        } else {
            debug!("Dropping untracked ACK (peer = {})", from);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_pub(
        &mut self,
        from: &Identity,
        msg_id: String,
        src: Identity,
        dst: Destination,
        payload: String,
        ttl: u32,
        sessions: &SessionSet,
    ) {
        if matches!(dst, Destination::Peer(_)) {
            debug!("Dropping PUB with unicast destination (peer = {})", from);

            return;
        }

        if !self.seen.observe(&msg_id, &src.to_string(), Some(from)) {
            return;
        }

        let deliver = match &dst {
            Destination::All => true,
            Destination::Namespace(ns) => ns == self.local.namespace(),
            Destination::Peer(_) => false,
        };

        if deliver {
            self.sink.message(&src, &payload).await;
        }

        let ttl = ttl.saturating_sub(1);

        if ttl > 0 {
            let frame = Frame::Pub {
                msg_id,
                src,
                dst,
                payload,
                ttl,
            };

            sessions.broadcast_except(&frame, Some(from));
        }
    }

    fn handle_who_has(
        &mut self,
        from: &Identity,
        msg_id: String,
        dst: Identity,
        ttl: u32,
        sessions: &SessionSet,
    ) {
        if dst == self.local {
            // Answer the first copy only; later ones fall to the seen-set.
            if self.seen.observe(&msg_id, &dst.to_string(), Some(from)) {
                if let Some(handle) = sessions.get(from) {
                    let _ = handle.send(Frame::WhoHasHit {
                        msg_id,
                        dst,
                        via: self.local.clone(),
                        ttl: self.relay_ttl,
                    });
                }
            }

            return;
        }

        if !self.seen.observe(&msg_id, &dst.to_string(), Some(from)) {
            return;
        }

        let ttl = ttl.saturating_sub(1);

        if ttl > 0 {
            let frame = Frame::WhoHas { msg_id, dst, ttl };

            sessions.broadcast_except(&frame, Some(from));
        }
    }

    async fn handle_hit(
        &mut self,
        from: &Identity,
        msg_id: String,
        dst: Identity,
        via: Identity,
        ttl: u32,
        sessions: &SessionSet,
    ) {
        // Whatever else happens, we now know a next hop for dst.
        self.routes.learn(dst.clone(), from.clone());

        if let Some(parked) = self.parked.remove(&msg_id) {
            debug!(
                "Route discovered (dst = {}) (via = {}) (next_hop = {})",
                dst, via, from
            );

            self.dispatch_unicast(parked.frame, parked.origin, sessions)
                .await;

            return;
        }

        // A relayed probe; pass the hit back toward the requester.
        if let Some(hop) = self.seen.reverse(&msg_id).cloned() {
            let ttl = ttl.saturating_sub(1);

            if ttl > 0 {
                if let Some(handle) = sessions.get(&hop) {
                    let _ = handle.send(Frame::WhoHasHit {
                        msg_id,
                        dst,
                        via,
                        ttl,
                    });
                }
            }
        }
    }

    async fn handle_error(&mut self, from: &Identity, code: String, ref_id: Option<String>) {
        if let Some(ref_id) = ref_id {
            if let Some(pending) = self.pending_acks.remove(&ref_id) {
                self.routes.invalidate(&pending.dst);
                self.sink
                    .notice(format!("{} (dst = {})", code, pending.dst))
                    .await;

                return;
            }
        }

        debug!("Peer reported error (peer = {}) (code = {})", from, code);
    }

    /// Push a unicast toward its destination: direct session first, then
    /// the route cache, then a WHO_HAS flood with the send parked.
    async fn dispatch_unicast(&mut self, frame: Frame, origin: SendOrigin, sessions: &SessionSet) {
        let (msg_id, dst) = match &frame {
            Frame::Send {
                msg_id,
                dst: Destination::Peer(dst),
                ..
            } => (msg_id.clone(), dst.clone()),
            _ => return,
        };

        let previous_hop = match &origin {
            SendOrigin::Relay(prev) => Some(prev.clone()),
            SendOrigin::Local => None,
        };

        if let Some(handle) = sessions.get(&dst) {
            if previous_hop.as_ref() != Some(&dst) {
                match handle.send(frame.clone()) {
                    Ok(()) => {
                        self.note_pending(&msg_id, &dst, &origin);

                        return;
                    }
                    Err(ThrumError::Busy) => {
                        self.report_busy(&origin, &dst).await;

                        return;
                    }
                    Err(_) => {}
                }
            }
        }

        if let Some(hop) = self.routes.next_hop(&dst).cloned() {
            if previous_hop.as_ref() != Some(&hop) {
                if let Some(handle) = sessions.get(&hop) {
                    match handle.send(frame.clone()) {
                        Ok(()) => {
                            self.note_pending(&msg_id, &dst, &origin);

                            return;
                        }
                        Err(ThrumError::Busy) => {
                            self.report_busy(&origin, &dst).await;

                            return;
                        }
                        Err(_) => self.routes.invalidate(&dst),
                    }
                } else {
                    self.routes.invalidate(&dst);
                }
            } else {
                // Cache points straight back where the frame came from.
                self.routes.invalidate(&dst);
            }
        }

        self.park_and_probe(frame, origin, sessions).await;
    }

    async fn park_and_probe(&mut self, frame: Frame, origin: SendOrigin, sessions: &SessionSet) {
        let (msg_id, dst, ttl) = match &frame {
            Frame::Send {
                msg_id,
                dst: Destination::Peer(dst),
                ttl,
                ..
            } => (msg_id.clone(), dst.clone(), *ttl),
            _ => return,
        };

        let previous_hop = match &origin {
            SendOrigin::Relay(prev) => Some(prev.clone()),
            SendOrigin::Local => None,
        };

        let probe_id = fresh_msg_id();
        let probe = Frame::WhoHas {
            msg_id: probe_id.clone(),
            dst: dst.clone(),
            ttl,
        };

        // Our own probe carries no reverse hop, so its answers stop here.
        self.seen.observe(&probe_id, &dst.to_string(), None);

        if sessions.broadcast_except(&probe, previous_hop.as_ref()) == 0 {
            self.fail_send(&origin, "no_route", &msg_id, &dst, sessions)
                .await;

            return;
        }

        debug!(
            "Parked send awaiting route (dst = {}) (msg_id = {})",
            dst, msg_id
        );

        self.parked.insert(
            probe_id,
            ParkedSend {
                frame,
                deadline: Instant::now() + DISCOVERY_WINDOW,
                origin,
            },
        );
    }

    fn note_pending(&mut self, msg_id: &str, dst: &Identity, origin: &SendOrigin) {
        if matches!(origin, SendOrigin::Local) {
            self.pending_acks.insert(
                msg_id.to_string(),
                PendingAck {
                    dst: dst.clone(),
                    deadline: Instant::now() + ACK_DEADLINE,
                },
            );
        }
    }

    /// `busy` never crosses the wire: the local originator hears it on the
    /// shell, a relayed frame is dropped and the origin's own ACK timeout
    /// notices.
    async fn report_busy(&mut self, origin: &SendOrigin, dst: &Identity) {
        match origin {
            SendOrigin::Local => {
                self.sink.notice(format!("busy (dst = {})", dst)).await;
            }
            SendOrigin::Relay(_) => {
                debug!("Dropped relayed send, next hop busy (dst = {})", dst);
            }
        }
    }

    /// Report an unroutable unicast: a notice locally, an ERROR frame one
    /// hop back for relays. Relays never fabricate ACKs.
    async fn fail_send(
        &mut self,
        origin: &SendOrigin,
        code: &str,
        msg_id: &str,
        dst: &Identity,
        sessions: &SessionSet,
    ) {
        match origin {
            SendOrigin::Local => {
                self.sink.notice(format!("{} (dst = {})", code, dst)).await;
            }
            SendOrigin::Relay(prev) => {
                if let Some(handle) = sessions.get(prev) {
                    let _ = handle.send(Frame::error_ref(code, msg_id));
                }
            }
        }
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;
    #[allow(unused_imports)]
    use crate::session::{SessionHandle, OUTBOUND_QUEUE_CAPACITY};
    #[allow(unused_imports)]
    use async_trait::async_trait;
    #[allow(unused_imports)]
    use std::sync::Mutex;
    #[allow(unused_imports)]
    use tokio::sync::{mpsc, watch};
    #[allow(unused_imports)]
    use tokio::time::advance;

    #[allow(dead_code)]
    struct TestSink(Mutex<Vec<String>>);

    #[async_trait]
    impl EventSink for TestSink {
        async fn message(&self, src: &Identity, text: &str) {
            self.0.lock().unwrap().push(format!("[{}] {}", src, text));
        }

        async fn notice(&self, text: String) {
            self.0.lock().unwrap().push(text);
        }
    }

    #[allow(dead_code)]
    impl TestSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[allow(dead_code)]
    fn identity(s: &str) -> Identity {
        s.parse().unwrap()
    }

    #[allow(dead_code)]
    fn test_handle(name: &str, capacity: usize) -> (SessionHandle, mpsc::Receiver<Frame>) {
        let (tx_frames, rx_frames) = mpsc::channel(capacity);
        let (tx_shutdown, _rx_shutdown) = watch::channel(false);

        let handle = SessionHandle::new(
            0,
            identity(name),
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            true,
            tx_frames,
            tx_shutdown,
        );

        (handle, rx_frames)
    }

    #[allow(dead_code)]
    fn send_frame(msg_id: &str, src: &str, dst: &str, ttl: u32) -> Frame {
        Frame::Send {
            msg_id: msg_id.to_string(),
            src: identity(src),
            dst: Destination::Peer(identity(dst)),
            payload: "hi".to_string(),
            ttl,
        }
    }

    #[test]
    fn seen_set_dedups_and_evicts_by_size() {
        let mut seen = SeenSet::new(2, Duration::from_secs(60));

        assert!(seen.observe("a", "alice@CIC", None));
        assert!(!seen.observe("a", "alice@CIC", None));
        assert!(seen.observe("b", "alice@CIC", None));
        assert!(seen.observe("c", "alice@CIC", None));

        // "a" was the oldest and fell out.
        assert_eq!(seen.len(), 2);
        assert!(seen.observe("a", "alice@CIC", None));
    }

    #[tokio::test(start_paused = true)]
    async fn seen_set_ages_out() {
        let mut seen = SeenSet::new(16, Duration::from_secs(30));

        assert!(seen.observe("a", "alice@CIC", Some(&identity("bob@CIC"))));
        assert_eq!(seen.reverse("a"), Some(&identity("bob@CIC")));

        advance(Duration::from_secs(31)).await;
        seen.purge();

        assert_eq!(seen.len(), 0);
        assert!(seen.observe("a", "alice@CIC", None));
    }

    #[tokio::test(start_paused = true)]
    async fn route_cache_goes_stale() {
        let mut routes = RouteCache::new(Duration::from_secs(60));

        routes.learn(identity("carol@UnB"), identity("bob@CIC"));
        assert_eq!(
            routes.next_hop(&identity("carol@UnB")),
            Some(&identity("bob@CIC"))
        );

        advance(Duration::from_secs(61)).await;

        assert_eq!(routes.next_hop(&identity("carol@UnB")), None);
    }

    #[tokio::test]
    async fn deliver_local_send_and_ack_once() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("bob@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (alice, mut rx_alice) = test_handle("alice@CIC", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(alice);

        let frame = send_frame("m1", "alice@CIC", "bob@CIC", 8);

        router
            .handle_frame(&identity("alice@CIC"), frame.clone(), &sessions)
            .await;
        router
            .handle_frame(&identity("alice@CIC"), frame, &sessions)
            .await;

        assert_eq!(sink.lines(), vec!["[alice@CIC] hi".to_string()]);

        match rx_alice.try_recv().unwrap() {
            Frame::Ack { ref_id } => assert_eq!(ref_id, "m1"),
            other => panic!("expected ACK, got {:?}", other),
        }

        // The duplicate earned no second ACK.
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_decrements_ttl_and_skips_inbound() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("bob@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (alice, mut rx_alice) = test_handle("alice@CIC", OUTBOUND_QUEUE_CAPACITY);
        let (carol, mut rx_carol) = test_handle("carol@UnB", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(alice);
        sessions.insert(carol);

        router
            .handle_frame(
                &identity("alice@CIC"),
                send_frame("m2", "alice@CIC", "carol@UnB", 8),
                &sessions,
            )
            .await;

        match rx_carol.try_recv().unwrap() {
            Frame::Send { ttl, msg_id, .. } => {
                assert_eq!(ttl, 7);
                assert_eq!(msg_id, "m2");
            }
            other => panic!("expected SEND, got {:?}", other),
        }

        assert!(rx_alice.try_recv().is_err());
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn expired_ttl_bounces_back_one_hop() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("carol@UnB"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (bob, mut rx_bob) = test_handle("bob@CIC", OUTBOUND_QUEUE_CAPACITY);
        let (dave, mut rx_dave) = test_handle("dave@UnB", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(bob);
        sessions.insert(dave);

        router
            .handle_frame(
                &identity("bob@CIC"),
                send_frame("m3", "alice@CIC", "dave@UnB", 1),
                &sessions,
            )
            .await;

        match rx_bob.try_recv().unwrap() {
            Frame::Error { code, ref_id, .. } => {
                assert_eq!(code, "ttl_expired");
                assert_eq!(ref_id.as_deref(), Some("m3"));
            }
            other => panic!("expected ERROR, got {:?}", other),
        }

        assert!(rx_dave.try_recv().is_err());
    }

    #[tokio::test]
    async fn pub_floods_with_split_horizon() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("bob@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (alice, mut rx_alice) = test_handle("alice@CIC", OUTBOUND_QUEUE_CAPACITY);
        let (carol, mut rx_carol) = test_handle("carol@UnB", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(alice);
        sessions.insert(carol);

        let frame = Frame::Pub {
            msg_id: "p1".to_string(),
            src: identity("alice@CIC"),
            dst: Destination::All,
            payload: "hello".to_string(),
            ttl: 8,
        };

        router
            .handle_frame(&identity("alice@CIC"), frame.clone(), &sessions)
            .await;

        assert_eq!(sink.lines(), vec!["[alice@CIC] hello".to_string()]);

        match rx_carol.try_recv().unwrap() {
            Frame::Pub { ttl, .. } => assert_eq!(ttl, 7),
            other => panic!("expected PUB, got {:?}", other),
        }

        assert!(rx_alice.try_recv().is_err());

        // The replayed copy is swallowed whole.
        router
            .handle_frame(&identity("carol@UnB"), frame, &sessions)
            .await;
        assert_eq!(sink.lines().len(), 1);
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn namespace_pub_delivers_only_inside_realm() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("carol@UnB"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (alice, _rx_alice) = test_handle("alice@CIC", OUTBOUND_QUEUE_CAPACITY);
        let (dave, mut rx_dave) = test_handle("dave@UnB", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(alice);
        sessions.insert(dave);

        let frame = Frame::Pub {
            msg_id: "p2".to_string(),
            src: identity("alice@CIC"),
            dst: Destination::Namespace("CIC".to_string()),
            payload: "hello".to_string(),
            ttl: 8,
        };

        router
            .handle_frame(&identity("alice@CIC"), frame, &sessions)
            .await;

        // Not our namespace: no delivery, but it still forwards.
        assert!(sink.lines().is_empty());
        assert!(rx_dave.try_recv().is_ok());
    }

    #[tokio::test]
    async fn who_has_answered_once_for_self() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("carol@UnB"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (bob, mut rx_bob) = test_handle("bob@CIC", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(bob);

        let probe = Frame::WhoHas {
            msg_id: "q1".to_string(),
            dst: identity("carol@UnB"),
            ttl: 8,
        };

        router
            .handle_frame(&identity("bob@CIC"), probe.clone(), &sessions)
            .await;

        match rx_bob.try_recv().unwrap() {
            Frame::WhoHasHit { via, dst, .. } => {
                assert_eq!(via, identity("carol@UnB"));
                assert_eq!(dst, identity("carol@UnB"));
            }
            other => panic!("expected WHO_HAS_HIT, got {:?}", other),
        }

        router
            .handle_frame(&identity("bob@CIC"), probe, &sessions)
            .await;
        assert!(rx_bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn who_has_refloods_away_from_inbound() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("bob@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (alice, mut rx_alice) = test_handle("alice@CIC", OUTBOUND_QUEUE_CAPACITY);
        let (carol, mut rx_carol) = test_handle("carol@UnB", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(alice);
        sessions.insert(carol);

        let probe = Frame::WhoHas {
            msg_id: "q2".to_string(),
            dst: identity("carol@UnB"),
            ttl: 8,
        };

        router
            .handle_frame(&identity("alice@CIC"), probe, &sessions)
            .await;

        match rx_carol.try_recv().unwrap() {
            Frame::WhoHas { ttl, .. } => assert_eq!(ttl, 7),
            other => panic!("expected WHO_HAS, got {:?}", other),
        }

        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn parked_send_completes_on_hit() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("alice@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (bob, mut rx_bob) = test_handle("bob@CIC", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(bob);

        router
            .originate_send(identity("carol@UnB"), "relayed".to_string(), &sessions)
            .await;

        // No direct session: a probe went out and the send is parked.
        let probe_id = match rx_bob.try_recv().unwrap() {
            Frame::WhoHas { msg_id, dst, ttl } => {
                assert_eq!(dst, identity("carol@UnB"));
                assert_eq!(ttl, 8);

                msg_id
            }
            other => panic!("expected WHO_HAS, got {:?}", other),
        };

        let hit = Frame::WhoHasHit {
            msg_id: probe_id,
            dst: identity("carol@UnB"),
            via: identity("carol@UnB"),
            ttl: 8,
        };

        router
            .handle_frame(&identity("bob@CIC"), hit, &sessions)
            .await;

        let sent_id = match rx_bob.try_recv().unwrap() {
            Frame::Send {
                msg_id, dst, ttl, ..
            } => {
                assert_eq!(dst, Destination::Peer(identity("carol@UnB")));
                assert_eq!(ttl, 8);

                msg_id
            }
            other => panic!("expected SEND, got {:?}", other),
        };

        // The end-to-end ACK clears the pending entry.
        router
            .handle_frame(&identity("bob@CIC"), Frame::Ack { ref_id: sent_id }, &sessions)
            .await;

        router.sweep(&sessions).await;
        assert!(sink.lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_window_expiry_reports_no_route() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("alice@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (bob, mut rx_bob) = test_handle("bob@CIC", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(bob);

        router
            .originate_send(identity("carol@UnB"), "lost".to_string(), &sessions)
            .await;

        assert!(matches!(rx_bob.try_recv(), Ok(Frame::WhoHas { .. })));

        advance(Duration::from_secs(3)).await;
        router.sweep(&sessions).await;

        assert_eq!(sink.lines(), vec!["no_route (dst = carol@UnB)".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_with_no_sessions_fails_immediately() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("alice@CIC"), 8, sink.clone());

        let sessions = SessionSet::new();

        router
            .originate_send(identity("carol@UnB"), "void".to_string(), &sessions)
            .await;

        assert_eq!(sink.lines(), vec!["no_route (dst = carol@UnB)".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("alice@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (bob, mut rx_bob) = test_handle("bob@CIC", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(bob);

        router
            .originate_send(identity("bob@CIC"), "hi".to_string(), &sessions)
            .await;

        assert!(matches!(rx_bob.try_recv(), Ok(Frame::Send { .. })));

        advance(Duration::from_secs(6)).await;
        router.sweep(&sessions).await;

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ack_timeout (dst = bob@CIC)"));
    }

    #[tokio::test]
    async fn full_queue_surfaces_busy_for_directed_send() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("alice@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (bob, _rx_bob) = test_handle("bob@CIC", 1);
        bob.send(Frame::Pong { nonce: 0 }).unwrap();
        sessions.insert(bob);

        router
            .originate_send(identity("bob@CIC"), "hi".to_string(), &sessions)
            .await;

        assert_eq!(sink.lines(), vec!["busy (dst = bob@CIC)".to_string()]);
    }

    #[tokio::test]
    async fn relayed_send_to_busy_hop_stays_off_the_wire() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("bob@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (alice, mut rx_alice) = test_handle("alice@CIC", OUTBOUND_QUEUE_CAPACITY);
        let (carol, _rx_carol) = test_handle("carol@UnB", 1);
        carol.send(Frame::Pong { nonce: 0 }).unwrap();
        sessions.insert(alice);
        sessions.insert(carol);

        router
            .handle_frame(
                &identity("alice@CIC"),
                send_frame("mb", "alice@CIC", "carol@UnB", 8),
                &sessions,
            )
            .await;

        // The relayed copy is dropped: no ERROR back to alice, nothing
        // on the shell.
        assert!(rx_alice.try_recv().is_err());
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn relayed_ack_walks_the_reverse_path() {
        let sink = TestSink::new();
        let mut router = Router::new(identity("bob@CIC"), 8, sink.clone());

        let mut sessions = SessionSet::new();
        let (alice, mut rx_alice) = test_handle("alice@CIC", OUTBOUND_QUEUE_CAPACITY);
        let (carol, mut rx_carol) = test_handle("carol@UnB", OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(alice);
        sessions.insert(carol);

        router
            .handle_frame(
                &identity("alice@CIC"),
                send_frame("m9", "alice@CIC", "carol@UnB", 8),
                &sessions,
            )
            .await;

        assert!(matches!(rx_carol.try_recv(), Ok(Frame::Send { .. })));

        router
            .handle_frame(
                &identity("carol@UnB"),
                Frame::Ack {
                    ref_id: "m9".to_string(),
                },
                &sessions,
            )
            .await;

        match rx_alice.try_recv().unwrap() {
            Frame::Ack { ref_id } => assert_eq!(ref_id, "m9"),
            other => panic!("expected ACK, got {:?}", other),
        }
    }
}
