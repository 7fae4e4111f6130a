// Thrum - Peer-to-peer rendezvous chat over persistent line-delimited JSON sessions
// Copyright (C) 2021  Thrum Developers

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(rename(deserialize = "General"))]
    pub general: General,

    #[serde(rename(deserialize = "Rendezvous"))]
    pub rendezvous: Rendezvous,

    #[serde(rename(deserialize = "Overlay"), default)]
    pub overlay: Overlay,
}

#[derive(Deserialize, Debug)]
pub struct General {
    /// Local part of the overlay identity.
    pub name: String,

    /// Identity realm. Peers sharing it receive `#<namespace>` publishes.
    pub namespace: String,

    /// Port inbound peer sessions are accepted on.
    pub listen_port: u16,
}

#[derive(Deserialize, Debug)]
pub struct Rendezvous {
    pub rendezvous_host: String,

    pub rendezvous_port: u16,

    /// Registration time-to-live requested from the directory.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

#[derive(Deserialize, Debug)]
pub struct Overlay {
    /// Interval in seconds between directory DISCOVER calls.
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval: u64,

    /// Interval in seconds between keep-alive pings on each session.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// Failed dials beyond this mark the peer FAILED until its
    /// directory coordinates change.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base in seconds of the exponential reconnect backoff.
    #[serde(default = "default_reconnect_backoff_base")]
    pub reconnect_backoff_base: u64,

    /// Cap on concurrently open peer sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Initial hop limit stamped on originated messages.
    #[serde(default = "default_relay_ttl")]
    pub relay_ttl: u32,
}

impl Default for Overlay {
    fn default() -> Self {
        Self {
            discovery_interval: default_discovery_interval(),
            ping_interval: default_ping_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_base: default_reconnect_backoff_base(),
            max_sessions: default_max_sessions(),
            relay_ttl: default_relay_ttl(),
        }
    }
}

fn default_ttl_seconds() -> u64 {
    7200
}

fn default_discovery_interval() -> u64 {
    15
}

fn default_ping_interval() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_backoff_base() -> u64 {
    1
}

fn default_max_sessions() -> usize {
    64
}

fn default_relay_ttl() -> u32 {
    8
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let raw = r#"
            [General]
            name = "alice"
            namespace = "CIC"
            listen_port = 6001

            [Rendezvous]
            rendezvous_host = "127.0.0.1"
            rendezvous_port = 5999
        "#;

        let c: Config = toml::from_str(raw).unwrap();

        assert_eq!(c.general.name, "alice");
        assert_eq!(c.general.namespace, "CIC");
        assert_eq!(c.general.listen_port, 6001);
        assert_eq!(c.rendezvous.ttl_seconds, 7200);
        assert_eq!(c.overlay.discovery_interval, 15);
        assert_eq!(c.overlay.ping_interval, 30);
        assert_eq!(c.overlay.max_reconnect_attempts, 5);
        assert_eq!(c.overlay.reconnect_backoff_base, 1);
        assert_eq!(c.overlay.max_sessions, 64);
        assert_eq!(c.overlay.relay_ttl, 8);
    }

    #[test]
    fn parse_overlay_overrides() {
        let raw = r#"
            [General]
            name = "bob"
            namespace = "CIC"
            listen_port = 6002

            [Rendezvous]
            rendezvous_host = "rdv.example.net"
            rendezvous_port = 5999
            ttl_seconds = 600

            [Overlay]
            ping_interval = 5
            relay_ttl = 2
        "#;

        let c: Config = toml::from_str(raw).unwrap();

        assert_eq!(c.rendezvous.ttl_seconds, 600);
        assert_eq!(c.overlay.ping_interval, 5);
        assert_eq!(c.overlay.relay_ttl, 2);
        // Untouched keys keep their defaults.
        assert_eq!(c.overlay.max_sessions, 64);
    }
}
