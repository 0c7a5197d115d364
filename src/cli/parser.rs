use anyhow::{Context, bail};
use clap::builder::{StringValueParser, TypedValueParser};
use clap::error::ErrorKind::Format;
use clap::{Arg, Command, Error};
use parse_duration::parse;
use std::ffi::OsStr;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct DurationValueParser;

impl TypedValueParser for DurationValueParser {
    type Value = Duration;

    fn parse_ref(
        &self,
        cmd: &Command,
        arg: Option<&Arg>,
        value: &OsStr,
    ) -> Result<Self::Value, Error> {
        StringValueParser::new()
            .parse_ref(cmd, arg, value)
            .and_then(|value| parse(&value).map_err(|message| Error::raw(Format, message)))
    }
}

/// `username,local-port,peer-address`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSpec {
    pub username: String,
    pub local_port: u16,
    pub peer_addr: IpAddr,
}

impl FromStr for UserSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<UserSpec> {
        let parts: Vec<_> = s.splitn(3, ',').collect();
        if parts.len() != 3 {
            bail!("Expected username,local-port,peer-address. Found {} fields.", parts.len());
        }
        Ok(UserSpec {
            username: parts[0].to_string(),
            local_port: parts[1]
                .parse()
                .with_context(|| format!("Invalid local port {}", parts[1]))?,
            peer_addr: parts[2]
                .parse()
                .with_context(|| format!("Invalid peer address {}", parts[2]))?,
        })
    }
}
