use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;

use crate::config::ShellSettings;

use super::Target;

/// A fully resolved external-process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(OsString, OsString)>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    /// Replace the environment with the ambient one, forcing `TERM` to `term`.
    pub fn with_term_env(mut self, term: &str) -> Self {
        self.env = build_env(std::env::vars_os(), term);
        self
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Produces the process invocation that backs a target's session.
pub trait CommandSource: Send + Sync {
    fn command_for(&self, target: &Target) -> ShellCommand;
}

/// Maps a cluster node name to a routable address.
/// `None` or an empty string means "unresolved, use the raw name".
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

impl<F> NodeResolver for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Resolver backed by a fixed name -> address table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }
}

impl NodeResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        self.table.get(name).cloned()
    }
}

/// Builds tmux / ssh / pct / qm invocations for each kind of target.
pub struct CommandRouter {
    settings: ShellSettings,
    resolver: Option<Box<dyn NodeResolver>>,
}

impl CommandRouter {
    pub fn new(settings: ShellSettings) -> Self {
        Self {
            settings,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: impl NodeResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    fn node_addr(&self, name: &str) -> String {
        self.resolver
            .as_ref()
            .and_then(|r| r.resolve(name))
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| name.to_string())
    }

    fn mux_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.settings.session_prefix, suffix)
    }

    /// `tmux new-session -A -s <name> -- <shell>`
    fn mux_args(&self, session: String) -> Vec<String> {
        vec![
            self.settings.multiplexer.clone(),
            "new-session".into(),
            "-A".into(),
            "-s".into(),
            session,
            "--".into(),
            self.settings.shell.clone(),
        ]
    }

    /// `env TERM=<term> tmux new-session ...`, for commands run on the far side
    /// of ssh or pct where our environment does not follow.
    fn remote_mux_args(&self, session: String) -> Vec<String> {
        let mut args = vec!["env".to_string(), format!("TERM={}", self.settings.term)];
        args.extend(self.mux_args(session));
        args
    }

    fn ssh_args(&self, node: &str) -> Vec<String> {
        let mut args = vec!["-tt".to_string()];
        args.extend(self.settings.ssh_options.iter().cloned());
        args.push(format!("{}@{}", self.settings.ssh_user, self.node_addr(node)));
        args
    }

    fn container_exec_args(&self, vmid: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), vmid.to_string(), "--".to_string()];
        args.extend(self.remote_mux_args(self.mux_name(vmid)));
        args
    }
}

impl CommandSource for CommandRouter {
    fn command_for(&self, target: &Target) -> ShellCommand {
        let (program, args) = match target {
            Target::Host => {
                let mut args = self.mux_args(self.mux_name("host"));
                let program = args.remove(0);
                (program, args)
            }
            Target::Node { name } => {
                let mut args = self.ssh_args(name);
                args.extend(self.remote_mux_args(self.mux_name(&name.replace('.', "-"))));
                ("ssh".to_string(), args)
            }
            Target::Container { node, vmid } => {
                let mut args = self.ssh_args(node);
                args.push(self.settings.container_exec.clone());
                args.extend(self.container_exec_args(vmid));
                ("ssh".to_string(), args)
            }
            Target::Vm { node, vmid } => {
                // The serial console keeps its own state; no multiplexer.
                let mut args = self.ssh_args(node);
                args.extend([
                    self.settings.vm_console.clone(),
                    "terminal".into(),
                    vmid.clone(),
                    "-iface".into(),
                    "serial0".into(),
                ]);
                ("ssh".to_string(), args)
            }
            Target::LocalContainer { vmid } => (
                self.settings.container_exec.clone(),
                self.container_exec_args(vmid),
            ),
        };

        ShellCommand::new(program, args).with_term_env(&self.settings.term)
    }
}

/// Ambient environment with every `TERM` entry dropped and exactly one
/// `TERM=<term>` appended. getenv() returns the first match, so a leftover
/// entry would shadow ours.
pub fn build_env<I>(ambient: I, term: &str) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<_> = ambient.into_iter().filter(|(k, _)| k != "TERM").collect();
    env.push(("TERM".into(), term.into()));
    env
}
