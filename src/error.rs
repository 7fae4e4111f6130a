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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrumError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error {0}")]
    CodecError(#[from] tokio_util::codec::LinesCodecError),

    #[error("JSON error {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid identity {0:?}")]
    InvalidIdentity(String),

    #[error("Invalid destination {0:?}")]
    InvalidDestination(String),

    #[error("Handshake refused: {0}")]
    HandshakeRefused(String),

    #[error("Outbound queue full")]
    Busy,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Directory refused request ({0})")]
    Directory(String),

    #[error("Directory rate limit exceeded")]
    Ratelimited,

    #[error("Malformed directory reply")]
    MalformedReply,

    #[error("Operation timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Invalid net address {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),
}

impl ThrumError {
    /// Wire code surfaced on the shell and in directory handling.
    pub fn code(&self) -> &str {
        match self {
            ThrumError::JsonError(_) => "invalid_json",
            ThrumError::InvalidIdentity(_) | ThrumError::InvalidDestination(_) => "bad_format",
            ThrumError::Busy => "busy",
            ThrumError::Ratelimited => "rate_limited",
            ThrumError::Directory(code) => code,
            _ => "network",
        }
    }

    /// Directory validation failures are never retried; everything else is
    /// treated as transient.
    pub fn is_validation(&self) -> bool {
        match self {
            ThrumError::Directory(code) => matches!(
                code.as_str(),
                "bad_name" | "bad_namespace" | "bad_port" | "bad_ttl" | "invalid_json"
                    | "line_too_long"
            ),
            _ => false,
        }
    }
}

pub type ThrumResult<T> = std::result::Result<T, ThrumError>;
