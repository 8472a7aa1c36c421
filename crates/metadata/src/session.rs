//! Per-connection session settings for the downstream fabric.

use serde::{Deserialize, Serialize};

/// One downstream session: a named connection to an ordered list of
/// servers, plus the identifiers carried in its login request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session name, used as the log prefix.
    pub session_name: String,
    /// Connection name, used for logging only.
    pub connection_name: String,
    /// Publisher name handed to the wire library.
    pub publisher_name: String,
    /// Ordered server hostnames or IPs; failover is round-robin.
    pub servers: Vec<String>,
    /// Default port when a server entry carries none.
    pub default_port: String,
    /// Application identifier carried in the login request.
    pub application_id: String,
    /// Differentiates provider instances on the same host.
    pub instance_id: String,
    /// Login user name.
    pub user_name: String,
    /// Login position, "<IPv4 address>/hostname" or empty.
    #[serde(default)]
    pub position: String,
}
