use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level config file structure (config.toml)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub shell: ShellSettings,
    /// Static node name -> address table for ssh targets
    #[serde(default)]
    pub nodes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Access token for the web endpoints. Generated at startup when unset.
    pub token: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellSettings {
    /// Shell started inside each multiplexer session
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Multiplexer session names are `<prefix>-<suffix>`
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_options")]
    pub ssh_options: Vec<String>,
    #[serde(default = "default_multiplexer")]
    pub multiplexer: String,
    /// Node-local container exec helper
    #[serde(default = "default_container_exec")]
    pub container_exec: String,
    /// Node-local VM console helper
    #[serde(default = "default_vm_console")]
    pub vm_console: String,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_session_prefix() -> String {
    "tb".to_string()
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_options() -> Vec<String> {
    vec!["-o".to_string(), "StrictHostKeyChecking=no".to_string()]
}

fn default_multiplexer() -> String {
    "tmux".to_string()
}

fn default_container_exec() -> String {
    "pct".to_string()
}

fn default_vm_console() -> String {
    "qm".to_string()
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            session_prefix: default_session_prefix(),
            term: default_term(),
            ssh_user: default_ssh_user(),
            ssh_options: default_ssh_options(),
            multiplexer: default_multiplexer(),
            container_exec: default_container_exec(),
            vm_console: default_vm_console(),
        }
    }
}

/// Values given on the command line. `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,
}

impl Config {
    /// Parse a config from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        Ok(config)
    }

    /// Load a config from a file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    /// Apply command-line overrides on top of this config
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(host) = &overrides.host {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if overrides.token.is_some() {
            self.server.token = overrides.token.clone();
        }
    }

    /// Resolve the full config by layering: defaults -> file -> CLI.
    /// An explicitly given path must exist; the default path may be absent.
    pub fn resolve(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Config::load(path)?,
            None => {
                let default_path = super::default_config_path()?;
                if default_path.exists() {
                    Config::load(&default_path)?
                } else {
                    Config::default()
                }
            }
        };
        config.apply(overrides);
        Ok(config)
    }
}
