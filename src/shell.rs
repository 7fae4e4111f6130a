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

use std::str::FromStr;

use async_trait::async_trait;

use log::LevelFilter;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{space0, space1};
use nom::combinator::{all_consuming, map, map_res, opt, rest, verify};
use nom::sequence::{pair, preceded, terminated};
use nom::IResult;

use crate::error::ThrumError;
use crate::protocol::{Destination, Identity};

/// Everything the user can type at the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Peers(Option<PeerScope>),
    Msg(Identity, String),
    Publish(Destination, String),
    Conn,
    Rtt,
    Reconnect,
    Log(LevelFilter),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerScope {
    All,
    Namespace(String),
}

/// Consumer of asynchronous overlay events.
///
/// The router talks to this instead of the terminal so the rendering
/// side stays swappable.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Render one inbound chat message.
    async fn message(&self, src: &Identity, text: &str);

    /// Render a notice: command output, delivery failures, status lines.
    async fn notice(&self, text: String);
}

/// Terminal sink.
pub struct Console;

#[async_trait]
impl EventSink for Console {
    async fn message(&self, src: &Identity, text: &str) {
        println!("[{}] {}", src, text);
    }

    async fn notice(&self, text: String) {
        println!("{}", text);
    }
}

/// Parse one prompt line. `None` means the line matched no command.
pub fn parse_command(line: &str) -> Option<Command> {
    all_consuming(terminated(command, space0))(line.trim())
        .ok()
        .map(|(_, command)| command)
}

pub fn help_text() -> &'static str {
    "/peers [*|#ns]          list known peers\n\
     /msg <identity> <text>  send a direct message\n\
     /pub * <text>           broadcast to every reachable peer\n\
     /pub #<ns> <text>       broadcast to one namespace\n\
     /conn                   list open sessions\n\
     /rtt                    list round-trip estimates\n\
     /reconnect              dial unreachable peers now\n\
     /log <level>            set the log level\n\
     /help                   this text\n\
     /quit                   unregister and exit"
}

fn command(input: &str) -> IResult<&str, Command> {
    alt((msg, publish, peers, log_level, simple))(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn identity(input: &str) -> IResult<&str, Identity> {
    map_res(word, str::parse)(input)
}

fn destination(input: &str) -> IResult<&str, Destination> {
    map_res(word, str::parse)(input)
}

/// Message body: everything after the next run of spaces.
fn body(input: &str) -> IResult<&str, String> {
    verify(
        map(preceded(space1, rest), |s: &str| s.trim_end().to_string()),
        |s: &String| !s.is_empty(),
    )(input)
}

fn msg(input: &str) -> IResult<&str, Command> {
    map(
        preceded(tag("/msg"), pair(preceded(space1, identity), body)),
        |(dst, text)| Command::Msg(dst, text),
    )(input)
}

fn publish(input: &str) -> IResult<&str, Command> {
    let fan_out = verify(destination, |d| !matches!(d, Destination::Peer(_)));

    map(
        preceded(tag("/pub"), pair(preceded(space1, fan_out), body)),
        |(dst, text)| Command::Publish(dst, text),
    )(input)
}

fn peers(input: &str) -> IResult<&str, Command> {
    map(
        preceded(tag("/peers"), opt(preceded(space1, scope))),
        Command::Peers,
    )(input)
}

fn scope(input: &str) -> IResult<&str, PeerScope> {
    alt((
        map(tag("*"), |_| PeerScope::All),
        map_res(word, |s: &str| match s.strip_prefix('#') {
            Some(ns) if !ns.is_empty() => Ok(PeerScope::Namespace(ns.to_string())),
            _ => Err(ThrumError::InvalidDestination(s.to_string())),
        }),
    ))(input)
}

fn log_level(input: &str) -> IResult<&str, Command> {
    map(
        preceded(
            tag("/log"),
            preceded(space1, map_res(word, LevelFilter::from_str)),
        ),
        Command::Log,
    )(input)
}

fn simple(input: &str) -> IResult<&str, Command> {
    alt((
        map(tag("/conn"), |_| Command::Conn),
        map(tag("/rtt"), |_| Command::Rtt),
        map(tag("/reconnect"), |_| Command::Reconnect),
        map(tag("/help"), |_| Command::Help),
        map(tag("/quit"), |_| Command::Quit),
    ))(input)
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn parse_msg() {
        match parse_command("/msg bob@CIC hello there").unwrap() {
            Command::Msg(dst, text) => {
                assert_eq!(dst.to_string(), "bob@CIC");
                assert_eq!(text, "hello there");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parse_publish() {
        assert_eq!(
            parse_command("/pub * hi all").unwrap(),
            Command::Publish(Destination::All, "hi all".to_string())
        );

        assert_eq!(
            parse_command("/pub #CIC hi group").unwrap(),
            Command::Publish(
                Destination::Namespace("CIC".to_string()),
                "hi group".to_string()
            )
        );
    }

    #[test]
    fn publish_rejects_unicast_destination() {
        assert_eq!(parse_command("/pub bob@CIC hi"), None);
    }

    #[test]
    fn parse_peers_scopes() {
        assert_eq!(parse_command("/peers"), Some(Command::Peers(None)));
        assert_eq!(
            parse_command("/peers *"),
            Some(Command::Peers(Some(PeerScope::All)))
        );
        assert_eq!(
            parse_command("/peers #UnB"),
            Some(Command::Peers(Some(PeerScope::Namespace("UnB".to_string()))))
        );
        assert_eq!(parse_command("/peers #"), None);
    }

    #[test]
    fn parse_simple_commands() {
        assert_eq!(parse_command("/conn"), Some(Command::Conn));
        assert_eq!(parse_command("/rtt"), Some(Command::Rtt));
        assert_eq!(parse_command("/reconnect"), Some(Command::Reconnect));
        assert_eq!(parse_command("/help"), Some(Command::Help));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(parse_command("  /quit  "), Some(Command::Quit));
    }

    #[test]
    fn parse_log_levels() {
        assert_eq!(
            parse_command("/log debug"),
            Some(Command::Log(LevelFilter::Debug))
        );
        assert_eq!(parse_command("/log loud"), None);
    }

    #[test]
    fn reject_garbage() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/msg bob@CIC"), None);
        assert_eq!(parse_command("/msg bob hi"), None);
        assert_eq!(parse_command("/conn now"), None);
        assert_eq!(parse_command("/nope"), None);
    }
}
