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

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec};

use futures::sink::SinkExt;

use serde::{Deserialize, Serialize};

use crate::error::{ThrumError, ThrumResult};
use crate::protocol::{Identity, LINE_LIMIT};

/// Budget for one complete request/reply exchange, connect included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client side of the rendezvous directory.
///
/// Every operation opens a fresh connection, writes one JSON line,
/// reads one JSON line back, and hangs up.
#[derive(Clone)]
pub struct Directory {
    host: String,
    port: u16,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type")]
enum Request<'a> {
    #[serde(rename = "REGISTER")]
    Register {
        namespace: &'a str,
        name: &'a str,
        port: u16,

        #[serde(skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
    },

    #[serde(rename = "DISCOVER")]
    Discover {
        #[serde(skip_serializing_if = "Option::is_none")]
        namespace: Option<&'a str>,
    },

    #[serde(rename = "UNREGISTER")]
    Unregister {
        namespace: &'a str,

        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<&'a str>,

        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
}

/// Union of every directory reply shape.
///
/// The directory is free to add fields; unknown keys are ignored.
#[derive(Deserialize, Debug)]
struct Reply {
    status: String,

    #[serde(default)]
    message: Option<String>,

    #[serde(default)]
    error: Option<String>,

    #[serde(default)]
    ttl: Option<u64>,

    #[serde(default)]
    observed_ip: Option<String>,

    #[serde(default)]
    observed_port: Option<u16>,

    #[serde(default)]
    peers: Option<Vec<PeerRecord>>,
}

/// One peer as reported by DISCOVER.
#[derive(Deserialize, Debug, Clone)]
pub struct PeerRecord {
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub ttl: Option<u64>,

    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Outcome of a successful REGISTER.
#[derive(Debug)]
pub struct Registration {
    pub ttl: u64,
    pub observed_ip: String,
    pub observed_port: u16,
}

impl PeerRecord {
    pub fn identity(&self) -> ThrumResult<Identity> {
        Identity::new(&self.name, &self.namespace)
    }

    pub fn addr(&self) -> ThrumResult<SocketAddr> {
        let ip: IpAddr = self.ip.parse()?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Directory {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    pub async fn register(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
        ttl: Option<u64>,
    ) -> ThrumResult<Registration> {
        let reply = self
            .exchange(&Request::Register {
                namespace,
                name,
                port,
                ttl,
            })
            .await?;

        match (reply.ttl, reply.observed_ip, reply.observed_port) {
            (Some(ttl), Some(observed_ip), Some(observed_port)) => Ok(Registration {
                ttl,
                observed_ip,
                observed_port,
            }),
            _ => Err(ThrumError::MalformedReply),
        }
    }

    pub async fn discover(&self, namespace: Option<&str>) -> ThrumResult<Vec<PeerRecord>> {
        let reply = self.exchange(&Request::Discover { namespace }).await?;

        Ok(reply.peers.unwrap_or_default())
    }

    pub async fn unregister(&self, namespace: &str, name: &str, port: u16) -> ThrumResult<()> {
        self.exchange(&Request::Unregister {
            namespace,
            name: Some(name),
            port: Some(port),
        })
        .await?;

        Ok(())
    }

    async fn exchange(&self, request: &Request<'_>) -> ThrumResult<Reply> {
        let line = serde_json::to_string(request)?;

        debug!("Directory request (line = {})", line);

        let reply: Reply = timeout(REQUEST_TIMEOUT, async {
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;

            let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(LINE_LIMIT));

            framed.send(line).await?;

            match framed.next().await {
                Some(reply) => Ok(serde_json::from_str(&reply?)?),
                None => Err(ThrumError::MalformedReply),
            }
        })
        .await??;

        if reply.status == "OK" {
            Ok(reply)
        } else {
            Err(reply_error(reply))
        }
    }
}

fn reply_error(reply: Reply) -> ThrumError {
    let code = reply
        .error
        .or(reply.message)
        .unwrap_or_else(|| "network".to_string());

    if code == "rate_limited" {
        ThrumError::Ratelimited
    } else {
        ThrumError::Directory(code)
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn register_request_shape() {
        let r = Request::Register {
            namespace: "CIC",
            name: "alice",
            port: 6001,
            ttl: Some(7200),
        };

        assert_eq!(
            serde_json::to_string(&r).unwrap(),
            r#"{"type":"REGISTER","namespace":"CIC","name":"alice","port":6001,"ttl":7200}"#
        );
    }

    #[test]
    fn wildcard_discover_omits_namespace() {
        let r = Request::Discover { namespace: None };

        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"type":"DISCOVER"}"#);
    }

    #[test]
    fn parse_discover_reply_with_extra_fields() {
        let raw = r#"{
            "status": "OK",
            "peers": [
                {"ip":"10.0.0.5","port":6001,"name":"bob","namespace":"CIC",
                 "ttl":7200,"expires_in":7100,"flags":3}
            ]
        }"#;

        let reply: Reply = serde_json::from_str(raw).unwrap();
        let peers = reply.peers.unwrap();

        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].identity().unwrap().to_string(), "bob@CIC");
        assert_eq!(peers[0].addr().unwrap().to_string(), "10.0.0.5:6001");
        assert_eq!(peers[0].expires_in, Some(7100));
    }

    #[test]
    fn classify_error_replies() {
        let rate: Reply =
            serde_json::from_str(r#"{"status":"ERROR","message":"rate_limited"}"#).unwrap();

        assert!(matches!(reply_error(rate), ThrumError::Ratelimited));

        let bad: Reply =
            serde_json::from_str(r#"{"status":"ERROR","message":"bad_name"}"#).unwrap();
        let e = reply_error(bad);

        assert_eq!(e.code(), "bad_name");
        assert!(e.is_validation());

        let cap: Reply =
            serde_json::from_str(r#"{"status":"ERROR","error":"line_too_long","limit":32768}"#)
                .unwrap();

        assert_eq!(reply_error(cap).code(), "line_too_long");
    }
}
