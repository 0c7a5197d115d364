//! RFC 1413 query parsing, response formatting and the one-shot exchange run on every
//! accepted ident connection.

use crate::error::IdentdError;
use crate::registry::UserRegistry;
use log::{info, warn};
use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

/// Longest query line accepted, not counting the CRLF.
pub const MAX_QUERY_LEN: usize = 1000;

/// A query as received: `<remote-port>, <local-port>`.
///
/// Values are kept unclamped so that out of range ports can be answered with `INVALID-PORT`
/// rather than being mistaken for real ones.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IdentQuery {
    pub remote_port: u64,
    pub local_port: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentResponse {
    UserId {
        local_port: u16,
        remote_port: u16,
        username: String,
    },
    InvalidPort {
        local_port: u16,
        remote_port: u16,
    },
}

impl IdentQuery {
    pub fn local_port(&self) -> Option<u16> {
        valid_port(self.local_port)
    }

    pub fn remote_port(&self) -> Option<u16> {
        valid_port(self.remote_port)
    }
}

fn valid_port(value: u64) -> Option<u16> {
    u16::try_from(value).ok().filter(|port| *port != 0)
}

fn clamp_port(value: u64) -> u16 {
    value.min(u16::MAX as u64) as u16
}

pub fn parse_query(line: &str) -> Result<IdentQuery, IdentdError> {
    let (remote, local) = line
        .split_once(',')
        .ok_or_else(|| IdentdError::MalformedQuery(format!("no comma in {line:?}")))?;
    Ok(IdentQuery {
        remote_port: parse_port_field(remote)?,
        local_port: parse_port_field(local)?,
    })
}

fn parse_port_field(field: &str) -> Result<u64, IdentdError> {
    let field = field.trim_matches([' ', '\t']);
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdentdError::MalformedQuery(format!("{field:?} is not a port")));
    }
    // All digits, so the only way this fails is overflow. Anything that large is out of range.
    Ok(field.parse().unwrap_or(u64::MAX))
}

/// Answers `query` from `registry`, consuming the entry it finds.
pub fn answer(query: &IdentQuery, registry: &UserRegistry) -> IdentResponse {
    let (Some(local_port), Some(remote_port)) = (query.local_port(), query.remote_port()) else {
        return IdentResponse::InvalidPort {
            local_port: clamp_port(query.local_port),
            remote_port: clamp_port(query.remote_port),
        };
    };
    match registry.take(local_port) {
        Some(entry) => IdentResponse::UserId {
            local_port,
            remote_port,
            username: entry.username,
        },
        None => IdentResponse::InvalidPort {
            local_port,
            remote_port,
        },
    }
}

impl Display for IdentResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentResponse::UserId {
                local_port,
                remote_port,
                username,
            } => write!(f, "{local_port}, {remote_port} : USERID : UNIX : {username}\r\n"),
            IdentResponse::InvalidPort {
                local_port,
                remote_port,
            } => write!(f, "{local_port}, {remote_port} : ERROR : INVALID-PORT\r\n"),
        }
    }
}

/// Reads one CRLF terminated line. Anything else (EOF first, oversized line, bad UTF-8) is malformed.
pub async fn read_query_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, IdentdError> {
    let mut buf = Vec::new();
    reader
        .take(MAX_QUERY_LEN as u64 + 2)
        .read_until(b'\n', &mut buf)
        .await?;
    let Some(line) = buf.strip_suffix(b"\r\n") else {
        return Err(IdentdError::MalformedQuery(format!(
            "no CRLF within {} bytes",
            buf.len()
        )));
    };
    String::from_utf8(line.to_vec())
        .map_err(|_| IdentdError::MalformedQuery("query is not valid UTF-8".to_string()))
}

/// Runs a single query/response exchange. Write failures are logged here and not retried;
/// read and parse failures are returned without sending anything.
pub async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    peer: SocketAddr,
    registry: &UserRegistry,
    read_timeout: Duration,
) -> Result<(), IdentdError> {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);
    let line = timeout(read_timeout, read_query_line(&mut reader))
        .await
        .map_err(|_| {
            IdentdError::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no query within {read_timeout:?}"),
            ))
        })??;
    let query = parse_query(&line)?;

    let response = answer(&query, registry);
    match &response {
        IdentResponse::UserId { username, .. } => {
            info!("Servicing ident request from {} as {username}", peer.ip())
        }
        IdentResponse::InvalidPort { local_port, .. } => {
            info!("Received ident request from {peer} for unknown local port {local_port}")
        }
    }

    let response = response.to_string();
    let sent: io::Result<()> = async {
        write.write_all(response.as_bytes()).await?;
        write.flush().await?;
        write.shutdown().await
    }
    .await;
    if let Err(error) = sent {
        warn!("Failed to send ident response to {peer}: {error}");
    }
    Ok(())
}
