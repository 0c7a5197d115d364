use std::fmt::{Display, Formatter};
use std::io;

#[derive(Debug)]
pub enum IdentdError {
    Bind(io::Error),
    AlreadyStarted,
    NotRunning,
    InvalidPort(u16),
    InvalidUsername(String),
    MalformedQuery(String),
    Transport(io::Error),
}

impl Display for IdentdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use IdentdError::*;
        match self {
            Bind(error) => write!(f, "Failed to bind identd listener: {error}"),
            AlreadyStarted => f.write_str("Identd server was already started"),
            NotRunning => f.write_str("Identd server is not running"),
            InvalidPort(port) => write!(f, "Invalid local port {port}"),
            InvalidUsername(username) => write!(f, "Invalid username {username:?}"),
            MalformedQuery(reason) => write!(f, "Malformed ident query: {reason}"),
            Transport(error) => write!(f, "Ident connection failed: {error}"),
        }
    }
}

impl std::error::Error for IdentdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IdentdError::Bind(error) | IdentdError::Transport(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for IdentdError {
    fn from(error: io::Error) -> Self {
        IdentdError::Transport(error)
    }
}
