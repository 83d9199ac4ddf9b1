use std::fmt;
use std::str::FromStr;

use crate::error::TargetError;

/// A validated terminal identifier.
///
/// Accepted forms:
///
/// - `host`: the local host
/// - `node:{name}`: a cluster node reached over ssh
/// - `lxc/{node}/{vmid}`: a container on a node
/// - `qemu/{node}/{vmid}`: a VM serial console on a node
/// - `{digits}`: legacy bare container id on the local host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Host,
    Node { name: String },
    Container { node: String, vmid: String },
    Vm { node: String, vmid: String },
    LocalContainer { vmid: String },
}

impl Target {
    /// Registry key for this target. Identical to the identifier it was parsed from.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        if id == "host" {
            return Ok(Target::Host);
        }

        if let Some(name) = id.strip_prefix("node:") {
            check_node(id, name)?;
            return Ok(Target::Node {
                name: name.to_string(),
            });
        }

        if let Some(rest) = id.strip_prefix("lxc/") {
            let (node, vmid) = split_node_vmid(id, rest)?;
            return Ok(Target::Container { node, vmid });
        }

        if let Some(rest) = id.strip_prefix("qemu/") {
            let (node, vmid) = split_node_vmid(id, rest)?;
            return Ok(Target::Vm { node, vmid });
        }

        if is_vmid(id) {
            return Ok(Target::LocalContainer {
                vmid: id.to_string(),
            });
        }

        Err(TargetError::new(id, "unrecognized format"))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host => f.write_str("host"),
            Target::Node { name } => write!(f, "node:{}", name),
            Target::Container { node, vmid } => write!(f, "lxc/{}/{}", node, vmid),
            Target::Vm { node, vmid } => write!(f, "qemu/{}/{}", node, vmid),
            Target::LocalContainer { vmid } => f.write_str(vmid),
        }
    }
}

fn split_node_vmid(id: &str, rest: &str) -> Result<(String, String), TargetError> {
    let (node, vmid) = rest
        .split_once('/')
        .ok_or_else(|| TargetError::new(id, "expected {node}/{vmid}"))?;
    check_node(id, node)?;
    if !is_vmid(vmid) {
        return Err(TargetError::new(id, "vmid must be numeric"));
    }
    Ok((node.to_string(), vmid.to_string()))
}

// Node names are interpolated into a remote command line.
fn check_node(id: &str, name: &str) -> Result<(), TargetError> {
    if name.is_empty() {
        return Err(TargetError::new(id, "node name is empty"));
    }
    let ok = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
    if !ok {
        return Err(TargetError::new(id, "node name has invalid characters"));
    }
    Ok(())
}

fn is_vmid(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
