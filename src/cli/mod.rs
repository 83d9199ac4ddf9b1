use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{Config, Overrides};
use crate::terminal::{CommandRouter, CommandSource, SessionManager, StaticResolver, Target};

#[derive(Parser, Debug)]
#[command(
    name = "termbridge",
    version,
    about = "Persistent browser shells for hosts, cluster nodes, containers and VMs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path (default: ~/.config/termbridge/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the terminal web server (default)
    Serve {
        /// Port number
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Use a specific auth token
        #[arg(long)]
        token: Option<String>,
    },

    /// Print the command a terminal id would run, without running it
    Route {
        /// Terminal id: host, node:<name>, lxc/<node>/<vmid>, qemu/<node>/<vmid> or <vmid>
        id: String,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        host: None,
        token: None,
    }) {
        Commands::Serve { port, host, token } => {
            let overrides = Overrides { host, port, token };
            let config = Config::resolve(cli.config.as_deref(), &overrides)?;
            serve(config).await?;
        }
        Commands::Route { id } => {
            let config = Config::resolve(cli.config.as_deref(), &Overrides::default())?;
            let target: Target = id.parse()?;
            println!("{}", router(&config).command_for(&target));
        }
    }

    Ok(())
}

fn router(config: &Config) -> CommandRouter {
    CommandRouter::new(config.shell.clone())
        .with_resolver(StaticResolver::new(config.nodes.clone()))
}

async fn serve(config: Config) -> Result<()> {
    let token = match config.server.token.clone() {
        Some(token) => token,
        None => {
            let token = generate_token();
            tracing::info!(token = %token, "Generated access token");
            token
        }
    };

    let session_manager = Arc::new(SessionManager::new(router(&config)));
    crate::web::start_web_server(&config.server.host, config.server.port, session_manager, token)
        .await
        .context("Web server error")
}

fn generate_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::try_parse_from(["termbridge"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_serve_flags() {
        let cli = Cli::try_parse_from(["termbridge", "serve", "-p", "9000", "-H", "127.0.0.1"])
            .unwrap();
        match cli.command {
            Some(Commands::Serve { port, host, token }) => {
                assert_eq!(port, Some(9000));
                assert_eq!(host.as_deref(), Some("127.0.0.1"));
                assert!(token.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_route_uses_node_table() {
        let config = Config::parse("[nodes]\npve2 = \"10.0.0.12\"\n").unwrap();
        let cmd = router(&config).command_for(&"qemu/pve2/200".parse().unwrap());
        assert!(cmd.args.contains(&"root@10.0.0.12".to_string()));
    }

    #[test]
    fn test_generated_tokens_differ() {
        let a = generate_token();
        assert_eq!(a.len(), 22);
        assert_ne!(a, generate_token());
    }
}
