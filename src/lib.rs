pub mod config;
pub mod error;
pub mod logging;
pub mod port_mapper;
pub mod protocol;
pub mod registry;
pub mod server;

pub use config::IdentdConfig;
pub use error::IdentdError;
pub use port_mapper::PortMapper;
pub use server::IdentdServer;
