// ABOUTME: SSH options used when running commands on provisioned nodes.
// ABOUTME: Parsed from the `ssh` section of shipyard.yml.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_user")]
    pub user: String,

    /// Private key; the SSH agent and default keys are tried when unset.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Record host keys of new nodes on first contact. Fresh droplets have
    /// keys nobody has seen yet, so this defaults to on.
    #[serde(default = "default_trust_first_connection")]
    pub trust_first_connection: bool,

    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Run docker through sudo on the node.
    #[serde(default)]
    pub sudo: bool,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_trust_first_connection() -> bool {
    true
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            key_path: None,
            trust_first_connection: default_trust_first_connection(),
            known_hosts_path: None,
            command_timeout: default_command_timeout(),
            sudo: false,
        }
    }
}
