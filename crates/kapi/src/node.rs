//! Collaborator seams for per-node side effects.
//!
//! The control plane's business logic decides *what* has to happen on a
//! node — create an RBD image, rewrite iptables for a public IP, cap a
//! container's filesystem usage — while the actual transport (the SSH
//! installer plumbing) lives outside this crate. These traits are that
//! boundary; the binary wires real implementations, tests wire recorders.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::Result;

/// Runs a command on a cluster node and returns its decoded JSON output.
#[async_trait]
pub trait NodeCommandRunner: Send + Sync {
    /// Run `command` on `host`.
    async fn run(&self, host: &str, command: &str) -> Result<Value>;

    /// Run `command` on any storage-capable node (Ceph operations do not
    /// care which node executes them).
    async fn run_on_first_node(&self, command: &str) -> Result<Value>;
}

/// Direction of a public-IP iptables change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpRuleOp {
    /// Install the DNAT rules for the IP on the host.
    Add,
    /// Remove them.
    Del,
}

/// Applies public-IP routing rules on nodes.
///
/// Called by the endpoints watcher when a service's backing pod appears
/// on, leaves, or migrates between nodes.
#[async_trait]
pub trait NodeIpRouter: Send + Sync {
    /// Add or remove the routing rules binding `public_ip` to `pod_ip` on
    /// `host` for the given service ports.
    async fn modify_node_ips(
        &self,
        service: &str,
        host: &str,
        op: IpRuleOp,
        pod_ip: &str,
        public_ip: &str,
        ports: &[Value],
    ) -> Result<()>;
}

/// Applies per-container filesystem limits on a node.
#[async_trait]
pub trait FsLimitSetter: Send + Sync {
    /// Cap filesystem usage for the given containers (name → docker id)
    /// of one pod on one host.
    async fn set_limit(
        &self,
        host: &str,
        pod_id: &str,
        containers: &std::collections::HashMap<String, String>,
    ) -> Result<()>;
}

/// A no-op implementation for deployments where node plumbing is managed
/// out of band. Logs what it would have done.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnmanagedNodes;

#[async_trait]
impl NodeCommandRunner for UnmanagedNodes {
    async fn run(&self, host: &str, command: &str) -> Result<Value> {
        info!(%host, %command, "node command skipped (unmanaged nodes)");
        Ok(Value::Null)
    }

    async fn run_on_first_node(&self, command: &str) -> Result<Value> {
        info!(%command, "node command skipped (unmanaged nodes)");
        Ok(Value::Null)
    }
}

#[async_trait]
impl NodeIpRouter for UnmanagedNodes {
    async fn modify_node_ips(
        &self,
        service: &str,
        host: &str,
        op: IpRuleOp,
        pod_ip: &str,
        public_ip: &str,
        _ports: &[Value],
    ) -> Result<()> {
        info!(%service, %host, ?op, %pod_ip, %public_ip,
            "node IP rule change skipped (unmanaged nodes)");
        Ok(())
    }
}

#[async_trait]
impl FsLimitSetter for UnmanagedNodes {
    async fn set_limit(
        &self,
        host: &str,
        pod_id: &str,
        containers: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        info!(%host, %pod_id, count = containers.len(),
            "fs limit skipped (unmanaged nodes)");
        Ok(())
    }
}
