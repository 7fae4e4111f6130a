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

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::time::Duration;

use crate::directory::PeerRecord;
use crate::error::ThrumResult;
use crate::protocol::Identity;

/// Ceiling on the exponential reconnect backoff.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(300);

/// Directory snapshots a CONNECTED peer must be absent from before it is
/// demoted to STALE.
const MISSING_CYCLES_STALE: u8 = 2;

/// Weight of a new sample in the smoothed RTT.
const RTT_ALPHA: f64 = 0.125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    Connecting,
    Connected,
    Stale,
    Failed,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Unknown => "UNKNOWN",
            PeerStatus::Connecting => "CONNECTING",
            PeerStatus::Connected => "CONNECTED",
            PeerStatus::Stale => "STALE",
            PeerStatus::Failed => "FAILED",
        };

        write!(f, "{}", s)
    }
}

/// One known participant of the overlay.
#[derive(Debug, Clone)]
pub struct Peer {
    pub identity: Identity,

    /// Coordinates the reconciler dials, from the latest directory record.
    pub addr: SocketAddr,

    /// Coordinates as last observed by the directory.
    pub observed: SocketAddr,

    pub status: PeerStatus,

    pub last_seen: Instant,

    /// Smoothed keep-alive round trip. Defined only while CONNECTED.
    pub rtt: Option<Duration>,

    /// Consecutive failed dials since the last successful handshake.
    pub attempts: u32,

    /// The reconciler skips this peer until this instant.
    pub retry_not_before: Instant,

    pub ttl: Option<u64>,

    pub expires_in: Option<u64>,

    /// Consecutive directory snapshots this peer has been absent from.
    missing_cycles: u8,
}

/// Registry of known peers, keyed by identity.
pub struct PeerTable {
    peers: HashMap<Identity, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Fold one DISCOVER record in.
    ///
    /// Fresh coordinates and TTL replace the stored ones; the status of a
    /// CONNECTED peer is never downgraded by a directory record. A FAILED
    /// peer whose coordinates changed becomes eligible to dial again.
    pub fn upsert_from_directory(&mut self, record: &PeerRecord) -> ThrumResult<Identity> {
        let identity = record.identity()?;
        let addr = record.addr()?;
        let now = Instant::now();

        match self.peers.get_mut(&identity) {
            Some(peer) => {
                peer.observed = addr;
                peer.ttl = record.ttl;
                peer.expires_in = record.expires_in;
                peer.last_seen = now;
                peer.missing_cycles = 0;

                if peer.addr != addr {
                    peer.addr = addr;

                    if peer.status == PeerStatus::Failed {
                        peer.status = PeerStatus::Unknown;
                        peer.attempts = 0;
                        peer.retry_not_before = now;
                    }
                }
            }
            None => {
                self.peers.insert(
                    identity.clone(),
                    Peer {
                        identity: identity.clone(),
                        addr,
                        observed: addr,
                        status: PeerStatus::Unknown,
                        last_seen: now,
                        rtt: None,
                        attempts: 0,
                        retry_not_before: now,
                        ttl: record.ttl,
                        expires_in: record.expires_in,
                        missing_cycles: 0,
                    },
                );
            }
        }

        Ok(identity)
    }

    /// Tally a directory snapshot against the table.
    ///
    /// A CONNECTED peer missing from two consecutive snapshots of its scope
    /// is promoted to STALE. Returns the promoted identities so their
    /// sessions can be closed.
    pub fn mark_missing_as_stale(
        &mut self,
        present: &HashSet<Identity>,
        scope: Option<&str>,
    ) -> Vec<Identity> {
        let mut demoted = Vec::new();

        for peer in self.peers.values_mut() {
            if let Some(ns) = scope {
                if peer.identity.namespace() != ns {
                    continue;
                }
            }

            if present.contains(&peer.identity) {
                continue;
            }

            if peer.status != PeerStatus::Connected {
                continue;
            }

            peer.missing_cycles += 1;

            if peer.missing_cycles >= MISSING_CYCLES_STALE {
                peer.status = PeerStatus::Stale;
                peer.rtt = None;
                peer.missing_cycles = 0;

                demoted.push(peer.identity.clone());
            }
        }

        demoted
    }

    /// Guarantee a table entry for an identity that connected to us
    /// before the directory ever reported it.
    pub fn ensure(&mut self, identity: &Identity, addr: SocketAddr) {
        let now = Instant::now();

        self.peers.entry(identity.clone()).or_insert_with(|| Peer {
            identity: identity.clone(),
            addr,
            observed: addr,
            status: PeerStatus::Unknown,
            last_seen: now,
            rtt: None,
            attempts: 0,
            retry_not_before: now,
            ttl: None,
            expires_in: None,
            missing_cycles: 0,
        });
    }

    pub fn set_status(&mut self, identity: &Identity, status: PeerStatus) {
        if let Some(peer) = self.peers.get_mut(identity) {
            if status == PeerStatus::Connected {
                // Successful handshake resets the reconnect bookkeeping.
                peer.attempts = 0;
                peer.missing_cycles = 0;
                peer.last_seen = Instant::now();
                peer.retry_not_before = Instant::now();
            } else {
                peer.rtt = None;
            }

            peer.status = status;
        }
    }

    /// Fold one keep-alive sample into the smoothed RTT.
    ///
    /// Samples for peers that are not CONNECTED are discarded.
    pub fn record_rtt(&mut self, identity: &Identity, sample: Duration) {
        if let Some(peer) = self.peers.get_mut(identity) {
            if peer.status != PeerStatus::Connected {
                return;
            }

            peer.rtt = Some(match peer.rtt {
                Some(rtt) => rtt.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA),
                None => sample,
            });

            peer.last_seen = Instant::now();
        }
    }

    /// Record a failed dial and compute the next backoff window.
    ///
    /// Returns the delay until the next attempt, or `None` once the peer
    /// has exhausted its attempts and is marked FAILED.
    pub fn schedule_retry(
        &mut self,
        identity: &Identity,
        base: u64,
        max_attempts: u32,
    ) -> Option<Duration> {
        let peer = self.peers.get_mut(identity)?;

        peer.attempts += 1;
        peer.rtt = None;

        if peer.attempts > max_attempts {
            peer.status = PeerStatus::Failed;

            return None;
        }

        let exp = peer.attempts.min(31);
        let delay = Duration::from_secs(base.saturating_mul(1 << exp)).min(BACKOFF_CEILING);

        peer.status = PeerStatus::Stale;
        peer.retry_not_before = Instant::now() + delay;

        Some(delay)
    }

    /// Peers the reconciler may dial right now.
    pub fn candidates(&self, now: Instant) -> Vec<(Identity, SocketAddr)> {
        self.peers
            .values()
            .filter(|p| {
                matches!(p.status, PeerStatus::Unknown | PeerStatus::Stale)
                    && p.retry_not_before <= now
            })
            .map(|p| (p.identity.clone(), p.addr))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();

        peers.sort_by(|a, b| a.identity.cmp(&b.identity));

        peers
    }

    pub fn lookup(&self, identity: &Identity) -> Option<&Peer> {
        self.peers.get(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[allow(dead_code)]
    fn record(name: &str, namespace: &str, ip: &str, port: u16) -> PeerRecord {
        PeerRecord {
            ip: ip.to_string(),
            port,
            name: name.to_string(),
            namespace: namespace.to_string(),
            ttl: Some(7200),
            expires_in: Some(7100),
        }
    }

    #[test]
    fn upsert_inserts_and_refreshes() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        let peer = table.lookup(&id).unwrap();
        assert_eq!(peer.status, PeerStatus::Unknown);
        assert_eq!(peer.addr.to_string(), "10.0.0.5:6002");

        table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.9", 6002))
            .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(&id).unwrap().addr.to_string(), "10.0.0.9:6002");
    }

    #[test]
    fn upsert_never_downgrades_connected() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        table.set_status(&id, PeerStatus::Connected);
        table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        assert_eq!(table.lookup(&id).unwrap().status, PeerStatus::Connected);
    }

    #[test]
    fn changed_coordinates_revive_failed_peer() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        while table.lookup(&id).unwrap().status != PeerStatus::Failed {
            table.schedule_retry(&id, 1, 2);
        }

        // Same coordinates keep it failed.
        table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();
        assert_eq!(table.lookup(&id).unwrap().status, PeerStatus::Failed);

        table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 7002))
            .unwrap();

        let peer = table.lookup(&id).unwrap();
        assert_eq!(peer.status, PeerStatus::Unknown);
        assert_eq!(peer.attempts, 0);
    }

    #[test]
    fn missing_peers_demote_after_two_cycles() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        table.set_status(&id, PeerStatus::Connected);

        let present = HashSet::new();

        assert!(table.mark_missing_as_stale(&present, Some("CIC")).is_empty());
        assert_eq!(table.lookup(&id).unwrap().status, PeerStatus::Connected);

        let demoted = table.mark_missing_as_stale(&present, Some("CIC"));

        assert_eq!(demoted, vec![id.clone()]);
        assert_eq!(table.lookup(&id).unwrap().status, PeerStatus::Stale);
    }

    #[test]
    fn missing_count_resets_when_seen_again() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        table.set_status(&id, PeerStatus::Connected);
        table.mark_missing_as_stale(&HashSet::new(), Some("CIC"));

        // Seen again; hysteresis starts over.
        table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        assert!(table
            .mark_missing_as_stale(&HashSet::new(), Some("CIC"))
            .is_empty());
    }

    #[test]
    fn scope_limits_demotion() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("carol", "UnB", "10.0.0.7", 6003))
            .unwrap();

        table.set_status(&id, PeerStatus::Connected);

        let present = HashSet::new();

        table.mark_missing_as_stale(&present, Some("CIC"));
        table.mark_missing_as_stale(&present, Some("CIC"));

        assert_eq!(table.lookup(&id).unwrap().status, PeerStatus::Connected);
    }

    #[test]
    fn rtt_smoothing() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        // Samples before CONNECTED are discarded.
        table.record_rtt(&id, Duration::from_millis(50));
        assert!(table.lookup(&id).unwrap().rtt.is_none());

        table.set_status(&id, PeerStatus::Connected);

        table.record_rtt(&id, Duration::from_millis(100));
        assert_eq!(table.lookup(&id).unwrap().rtt.unwrap().as_millis(), 100);

        table.record_rtt(&id, Duration::from_millis(200));
        assert_eq!(table.lookup(&id).unwrap().rtt.unwrap().as_millis(), 112);

        // Leaving CONNECTED clears the estimate.
        table.set_status(&id, PeerStatus::Stale);
        assert!(table.lookup(&id).unwrap().rtt.is_none());
    }

    #[test]
    fn backoff_doubles_then_fails() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        assert_eq!(
            table.schedule_retry(&id, 1, 5),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            table.schedule_retry(&id, 1, 5),
            Some(Duration::from_secs(4))
        );
        assert_eq!(
            table.schedule_retry(&id, 1, 5),
            Some(Duration::from_secs(8))
        );
        assert_eq!(
            table.schedule_retry(&id, 1, 5),
            Some(Duration::from_secs(16))
        );
        assert_eq!(
            table.schedule_retry(&id, 1, 5),
            Some(Duration::from_secs(32))
        );

        assert_eq!(table.schedule_retry(&id, 1, 5), None);
        assert_eq!(table.lookup(&id).unwrap().status, PeerStatus::Failed);
    }

    #[test]
    fn backoff_clamps_to_ceiling() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        assert_eq!(table.schedule_retry(&id, 240, 10), Some(BACKOFF_CEILING));
    }

    #[test]
    fn connect_resets_attempts() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        table.schedule_retry(&id, 1, 5);
        table.schedule_retry(&id, 1, 5);
        assert_eq!(table.lookup(&id).unwrap().attempts, 2);

        table.set_status(&id, PeerStatus::Connected);
        assert_eq!(table.lookup(&id).unwrap().attempts, 0);
    }

    #[test]
    fn ensure_inserts_without_clobbering() {
        let mut table = PeerTable::new();
        let id: Identity = "eve@CIC".parse().unwrap();

        table.ensure(&id, "10.0.0.9:9999".parse().unwrap());
        assert_eq!(table.lookup(&id).unwrap().status, PeerStatus::Unknown);

        table.set_status(&id, PeerStatus::Connected);
        table.ensure(&id, "10.0.0.9:1111".parse().unwrap());

        let peer = table.lookup(&id).unwrap();
        assert_eq!(peer.status, PeerStatus::Connected);
        assert_eq!(peer.addr.to_string(), "10.0.0.9:9999");
    }

    #[test]
    fn candidates_respect_backoff_window() {
        let mut table = PeerTable::new();

        let id = table
            .upsert_from_directory(&record("bob", "CIC", "10.0.0.5", 6002))
            .unwrap();

        assert_eq!(table.candidates(Instant::now()).len(), 1);

        table.schedule_retry(&id, 60, 5);

        assert!(table.candidates(Instant::now()).is_empty());
        assert_eq!(table.candidates(Instant::now() + BACKOFF_CEILING).len(), 1);
    }
}
