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

use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ThrumError, ThrumResult};

/// Hard cap on one wire line, shared by peer sessions and directory calls.
pub const LINE_LIMIT: usize = 32768;

/// Cap on each half of a `name@namespace` identity.
pub const IDENTITY_PART_LIMIT: usize = 64;

/// Features advertised in our HELLO.
pub const LOCAL_FEATURES: &[&str] = &["relay"];

/// Overlay identity of one participant, `name@namespace`.
///
/// Both halves are non-empty, at most 64 characters, and free of `@`
/// and whitespace. The derived ordering is the session tie-break order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    name: String,
    namespace: String,
}

/// Where a frame is headed: one peer, one namespace, or everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Peer(Identity),
    Namespace(String),
    All,
}

/// One wire frame.
///
/// Every frame is a single JSON object on one LF-terminated line,
/// discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "HELLO")]
    Hello {
        identity: Identity,
        features: Vec<String>,
    },

    #[serde(rename = "HELLO_OK")]
    HelloOk {
        identity: Identity,
        features: Vec<String>,
    },

    #[serde(rename = "PING")]
    Ping { nonce: u64, t_send: u64 },

    #[serde(rename = "PONG")]
    Pong { nonce: u64 },

    #[serde(rename = "SEND")]
    Send {
        msg_id: String,
        src: Identity,
        dst: Destination,
        payload: String,
        ttl: u32,
    },

    #[serde(rename = "ACK")]
    Ack {
        #[serde(rename = "ref")]
        ref_id: String,
    },

    #[serde(rename = "PUB")]
    Pub {
        msg_id: String,
        src: Identity,
        dst: Destination,
        payload: String,
        ttl: u32,
    },

    #[serde(rename = "WHO_HAS")]
    WhoHas {
        msg_id: String,
        dst: Identity,
        ttl: u32,
    },

    #[serde(rename = "WHO_HAS_HIT")]
    WhoHasHit {
        msg_id: String,
        dst: Identity,
        via: Identity,
        ttl: u32,
    },

    #[serde(rename = "BYE")]
    Bye { reason: String },

    #[serde(rename = "ERROR")]
    Error {
        code: String,

        #[serde(rename = "ref", skip_serializing_if = "Option::is_none", default)]
        ref_id: Option<String>,

        #[serde(skip_serializing_if = "Option::is_none", default)]
        detail: Option<String>,

        #[serde(skip_serializing_if = "Option::is_none", default)]
        limit: Option<u32>,
    },
}

impl Identity {
    pub fn new(name: &str, namespace: &str) -> ThrumResult<Self> {
        if !part_ok(name) || !part_ok(namespace) {
            return Err(ThrumError::InvalidIdentity(format!(
                "{}@{}",
                name, namespace
            )));
        }

        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn part_ok(part: &str) -> bool {
    !part.is_empty()
        && part.len() <= IDENTITY_PART_LIMIT
        && !part.contains('@')
        && !part.contains(char::is_whitespace)
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

impl FromStr for Identity {
    type Err = ThrumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((name, namespace)) => Identity::new(name, namespace),
            None => Err(ThrumError::InvalidIdentity(s.to_string())),
        }
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        s.parse().map_err(DeError::custom)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Peer(identity) => write!(f, "{}", identity),
            Destination::Namespace(ns) => write!(f, "#{}", ns),
            Destination::All => write!(f, "*"),
        }
    }
}

impl FromStr for Destination {
    type Err = ThrumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Destination::All);
        }

        if let Some(ns) = s.strip_prefix('#') {
            if !part_ok(ns) {
                return Err(ThrumError::InvalidDestination(s.to_string()));
            }

            return Ok(Destination::Namespace(ns.to_string()));
        }

        s.parse()
            .map(Destination::Peer)
            .map_err(|_| ThrumError::InvalidDestination(s.to_string()))
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        s.parse().map_err(DeError::custom)
    }
}

impl Frame {
    /// Wire name of the frame, for log context.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "HELLO",
            Frame::HelloOk { .. } => "HELLO_OK",
            Frame::Ping { .. } => "PING",
            Frame::Pong { .. } => "PONG",
            Frame::Send { .. } => "SEND",
            Frame::Ack { .. } => "ACK",
            Frame::Pub { .. } => "PUB",
            Frame::WhoHas { .. } => "WHO_HAS",
            Frame::WhoHasHit { .. } => "WHO_HAS_HIT",
            Frame::Bye { .. } => "BYE",
            Frame::Error { .. } => "ERROR",
        }
    }

    pub fn error(code: &str) -> Frame {
        Frame::Error {
            code: code.to_string(),
            ref_id: None,
            detail: None,
            limit: None,
        }
    }

    pub fn error_ref(code: &str, ref_id: &str) -> Frame {
        Frame::Error {
            code: code.to_string(),
            ref_id: Some(ref_id.to_string()),
            detail: None,
            limit: None,
        }
    }
}

/// Fresh opaque message identifier.
pub fn fresh_msg_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Fresh keep-alive nonce.
pub fn fresh_nonce() -> u64 {
    rand::random::<u64>()
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn parse_valid_identity() {
        let i: Identity = "alice@CIC".parse().unwrap();

        assert_eq!(i.name(), "alice");
        assert_eq!(i.namespace(), "CIC");
        assert_eq!(i.to_string(), "alice@CIC");
    }

    #[test]
    fn reject_malformed_identities() {
        assert!("alice".parse::<Identity>().is_err());
        assert!("@CIC".parse::<Identity>().is_err());
        assert!("alice@".parse::<Identity>().is_err());
        assert!("al ice@CIC".parse::<Identity>().is_err());
        assert!("a@b@c".parse::<Identity>().is_err());

        let long = "x".repeat(IDENTITY_PART_LIMIT + 1);
        assert!(format!("{}@CIC", long).parse::<Identity>().is_err());
    }

    #[test]
    fn identity_ordering_is_total() {
        let a: Identity = "alice@CIC".parse().unwrap();
        let b: Identity = "bob@CIC".parse().unwrap();

        assert!(a < b);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn parse_destinations() {
        assert_eq!("*".parse::<Destination>().unwrap(), Destination::All);
        assert_eq!(
            "#CIC".parse::<Destination>().unwrap(),
            Destination::Namespace("CIC".to_string())
        );

        match "carol@UnB".parse::<Destination>().unwrap() {
            Destination::Peer(i) => assert_eq!(i.to_string(), "carol@UnB"),
            other => panic!("unexpected destination {:?}", other),
        }

        assert!("#".parse::<Destination>().is_err());
        assert!("# ns".parse::<Destination>().is_err());
    }

    #[test]
    fn frame_type_tags() {
        let frame = Frame::Send {
            msg_id: "deadbeef".to_string(),
            src: "alice@CIC".parse().unwrap(),
            dst: "bob@CIC".parse().unwrap(),
            payload: "hi".to_string(),
            ttl: 8,
        };

        let line = serde_json::to_string(&frame).unwrap();

        assert!(line.contains(r#""type":"SEND""#));
        assert!(line.contains(r#""src":"alice@CIC""#));
        assert!(line.contains(r#""dst":"bob@CIC""#));
        assert!(line.contains(r#""ttl":8"#));
    }

    #[test]
    fn parse_hello_frame() {
        let line = r#"{"type":"HELLO","identity":"bob@CIC","features":["relay"]}"#;

        match serde_json::from_str::<Frame>(line).unwrap() {
            Frame::Hello { identity, features } => {
                assert_eq!(identity.to_string(), "bob@CIC");
                assert_eq!(features, vec!["relay".to_string()]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn ack_uses_ref_field() {
        let frame = Frame::Ack {
            ref_id: "deadbeef".to_string(),
        };

        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"ACK","ref":"deadbeef"}"#
        );
    }

    #[test]
    fn error_frame_omits_empty_fields() {
        let plain = serde_json::to_string(&Frame::error("invalid_json")).unwrap();

        assert_eq!(plain, r#"{"type":"ERROR","code":"invalid_json"}"#);

        let full = Frame::Error {
            code: "line_too_long".to_string(),
            ref_id: None,
            detail: None,
            limit: Some(LINE_LIMIT as u32),
        };

        assert_eq!(
            serde_json::to_string(&full).unwrap(),
            r#"{"type":"ERROR","code":"line_too_long","limit":32768}"#
        );
    }

    #[test]
    fn who_has_round_trip() {
        let frame = Frame::WhoHasHit {
            msg_id: "feed".to_string(),
            dst: "carol@UnB".parse().unwrap(),
            via: "carol@UnB".parse().unwrap(),
            ttl: 7,
        };

        let line = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed, frame);
    }

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(fresh_msg_id(), fresh_msg_id());
        assert_eq!(fresh_msg_id().len(), 32);
    }
}
