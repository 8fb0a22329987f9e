//! Configuration for sessions, clients and servers.
//!
//! All structs implement `Default` and are serde-(de)serializable with
//! missing fields falling back to their defaults, so applications can load
//! them from whatever config format they already use:
//!
//! ```
//! use framelink::config::ServerConfig;
//!
//! let config: ServerConfig = serde_json::from_str(r#"{ "max_connections": 64 }"#).unwrap();
//! assert_eq!(config.max_connections, 64);
//! assert_eq!(config.acceptors, framelink::config::DEFAULT_ACCEPTORS);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{FramelinkError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Default admission ceiling for a server.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default number of acceptor tasks started by a server.
pub const DEFAULT_ACCEPTORS: usize = 16;

/// Per-session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum payload size accepted and produced by the session.
    /// A value of 0 selects the default.
    pub max_frame_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum payload size for every session the client opens.
    pub max_frame_size: u32,
}

impl ClientConfig {
    /// Session configuration derived from this client configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            max_frame_size: self.max_frame_size,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum payload size for every accepted session.
    pub max_frame_size: u32,
    /// Admission ceiling: maximum concurrently served sessions.
    pub max_connections: usize,
    /// Acceptor tasks used by [`Server::start_default`](crate::Server::start_default).
    pub acceptors: usize,
}

impl ServerConfig {
    /// Session configuration derived from this server configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            max_frame_size: self.max_frame_size,
        }
    }

    /// Reject configurations that could never serve a connection.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(FramelinkError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.acceptors == 0 {
            return Err(FramelinkError::Config(
                "acceptors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acceptors: DEFAULT_ACCEPTORS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(server.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(server.acceptors, DEFAULT_ACCEPTORS);
        assert!(server.validate().is_ok());

        assert_eq!(
            ClientConfig::default().session(),
            SessionConfig::default()
        );
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let client: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(client, ClientConfig::default());

        let server: ServerConfig =
            serde_json::from_str(r#"{ "max_frame_size": 1048576, "acceptors": 2 }"#).unwrap();
        assert_eq!(server.max_frame_size, 1_048_576);
        assert_eq!(server.acceptors, 2);
        assert_eq!(server.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(server.session().max_frame_size, 1_048_576);
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(FramelinkError::Config(_))));

        let config = ServerConfig {
            acceptors: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
