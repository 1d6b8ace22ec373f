//! Control-plane configuration.
//!
//! All knobs come from the environment (or CLI flags with the `cli`
//! feature), are parsed once at startup and shared immutably afterwards.

use std::time::Duration;

/// Separator between drive name and user id in physical drive names.
pub const PD_SEPARATOR_USERID: &str = "__SEPID__";

/// Legacy separator between drive name and username.
pub const PD_SEPARATOR_USERNAME: &str = "__SEP__";

/// The reserved principal running infrastructure pods.
pub const KUBERDOCK_INTERNAL_USER: &str = "kuberdock-internal";

/// Kubernetes API version we speak.
pub const KUBE_API_VERSION: &str = "v1";

/// Which storage backend owns persistent disks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Ceph RBD images in a configured pool.
    Ceph,
    /// AWS Elastic Block Store volumes.
    Aws,
    /// Node-local directories under the storage prefix.
    Local,
}

/// How public IPs are assigned to pods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpMode {
    /// Any free IP from any pool may bind to any pod.
    Floating,
    /// Pools are node-bound; pods taking their IPs are pinned.
    Fixed,
    /// No local IPs; the ELB hostname is the pod's public identity.
    Aws,
}

/// Immutable process-wide configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address of the Kubernetes master, e.g. `10.0.0.1`.
    pub master_ip: String,
    /// Postgres connection string.
    pub database_url: String,
    /// Redis connection string.
    pub redis_url: String,
    /// Storage backend for persistent disks.
    pub storage: StorageKind,
    /// Public-IP assignment mode.
    pub ip_mode: IpMode,
    /// Ceph pool holding RBD images.
    pub ceph_pool: String,
    /// Ceph monitor addresses.
    pub ceph_monitors: Vec<String>,
    /// Ceph client keyring path.
    pub ceph_keyring: String,
    /// Ceph client user.
    pub ceph_user: String,
    /// Host prefix for node-local persistent storage.
    pub node_local_storage_prefix: String,
    /// The default public registry.
    pub default_registry: String,
    /// Interval between SSE keep-alive comments.
    pub sse_keepalive_interval: Duration,
    /// Address the SSE endpoint listens on.
    pub sse_listen_addr: std::net::SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            master_ip: "127.0.0.1".to_owned(),
            database_url: "postgres://kuberdock@127.0.0.1/kuberdock".to_owned(),
            redis_url: "redis://127.0.0.1:6379/0".to_owned(),
            storage: StorageKind::Local,
            ip_mode: IpMode::Floating,
            ceph_pool: "rbd".to_owned(),
            ceph_monitors: vec![],
            ceph_keyring: "/etc/ceph/ceph.client.admin.keyring".to_owned(),
            ceph_user: "admin".to_owned(),
            node_local_storage_prefix: "/var/lib/kuberdock/storage".to_owned(),
            default_registry: "https://registry-1.docker.io".to_owned(),
            sse_keepalive_interval: Duration::from_secs(15),
            sse_listen_addr: ([0, 0, 0, 0], 8085).into(),
        }
    }
}

impl Config {
    /// Build a config from the process environment.
    ///
    /// `AWS=1` selects the EBS backend and ELB IP mode together, matching
    /// how the installer provisions Amazon clusters. `CEPH=1` selects RBD.
    /// `FIXED_IP_POOLS=1` switches floating pools to node-bound ones.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        let flag = |name: &str| {
            matches!(
                std::env::var(name).unwrap_or_default().as_str(),
                "1" | "true" | "yes"
            )
        };

        if let Ok(master_ip) = std::env::var("MASTER_IP") {
            config.master_ip = master_ip;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if flag("AWS") {
            config.storage = StorageKind::Aws;
            config.ip_mode = IpMode::Aws;
        } else if flag("CEPH") {
            config.storage = StorageKind::Ceph;
        }
        if flag("FIXED_IP_POOLS") {
            if config.ip_mode == IpMode::Aws {
                anyhow::bail!("FIXED_IP_POOLS cannot be combined with AWS mode");
            }
            config.ip_mode = IpMode::Fixed;
        }
        if let Ok(pool) = std::env::var("CEPH_POOL") {
            config.ceph_pool = pool;
        }
        if let Ok(monitors) = std::env::var("CEPH_MONITORS") {
            config.ceph_monitors = monitors.split(',').map(str::to_owned).collect();
        }
        if let Ok(keyring) = std::env::var("CEPH_KEYRING") {
            config.ceph_keyring = keyring;
        }
        if let Ok(user) = std::env::var("CEPH_USER") {
            config.ceph_user = user;
        }
        if let Ok(prefix) = std::env::var("NODE_LOCAL_STORAGE_PREFIX") {
            config.node_local_storage_prefix = prefix;
        }
        if let Ok(registry) = std::env::var("DEFAULT_REGISTRY") {
            config.default_registry = registry;
        }
        if let Ok(interval) = std::env::var("SSE_KEEPALIVE_INTERVAL") {
            config.sse_keepalive_interval = Duration::from_secs(interval.parse()?);
        }
        if let Ok(addr) = std::env::var("SSE_LISTEN_ADDR") {
            config.sse_listen_addr = addr.parse()?;
        }
        Ok(config)
    }

    /// Base URL of the Kubernetes API, e.g. `http://10.0.0.1:8080/api/v1`.
    pub fn kube_api_base(&self) -> String {
        format!("http://{}:8080/api/{}", self.master_ip, KUBE_API_VERSION)
    }

    /// Parse command-line flags on top of the environment.
    ///
    /// Flags win over env vars, env vars over defaults.
    #[cfg(feature = "cli")]
    pub fn from_flags() -> anyhow::Result<Self> {
        use structopt::StructOpt;

        let opts = Opts::from_args();
        let mut config = Config::from_env()?;
        if let Some(master_ip) = opts.master_ip {
            config.master_ip = master_ip;
        }
        if let Some(database_url) = opts.database_url {
            config.database_url = database_url;
        }
        if let Some(redis_url) = opts.redis_url {
            config.redis_url = redis_url;
        }
        if let Some(addr) = opts.sse_listen_addr {
            config.sse_listen_addr = addr;
        }
        Ok(config)
    }
}

/// Command-line flags of the control-plane daemon.
#[cfg(feature = "cli")]
#[derive(Debug, structopt::StructOpt)]
#[structopt(name = "kuberdock", about = "A multi-tenant PaaS control plane atop Kubernetes")]
struct Opts {
    #[structopt(
        long = "master-ip",
        env = "MASTER_IP",
        help = "Address of the Kubernetes master"
    )]
    master_ip: Option<String>,

    #[structopt(
        long = "database-url",
        env = "DATABASE_URL",
        help = "Postgres connection string"
    )]
    database_url: Option<String>,

    #[structopt(long = "redis-url", env = "REDIS_URL", help = "Redis connection string")]
    redis_url: Option<String>,

    #[structopt(
        long = "sse-listen-addr",
        env = "SSE_LISTEN_ADDR",
        help = "Address the event-stream endpoint listens on"
    )]
    sse_listen_addr: Option<std::net::SocketAddr>,
}

/// System settings stored in the database and editable at runtime.
///
/// Unlike [`Config`], these may change between requests and are re-read
/// where it matters.
#[derive(Clone, Copy, Debug)]
pub struct SystemSettings {
    /// Upper bound on kubes a single container may request.
    pub max_kubes_per_container: i32,
    /// Upper bound on a persistent disk size, GB.
    pub persistent_disk_max_size: i64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        SystemSettings {
            max_kubes_per_container: 10,
            persistent_disk_max_size: 10,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_mode_is_floating_local() {
        let config = Config::default();
        assert_eq!(config.storage, StorageKind::Local);
        assert_eq!(config.ip_mode, IpMode::Floating);
        assert_eq!(
            config.node_local_storage_prefix,
            "/var/lib/kuberdock/storage"
        );
    }

    #[test]
    fn kube_api_base_is_versioned() {
        let config = Config {
            master_ip: "10.1.2.3".to_owned(),
            ..Config::default()
        };
        assert_eq!(config.kube_api_base(), "http://10.1.2.3:8080/api/v1");
    }
}
