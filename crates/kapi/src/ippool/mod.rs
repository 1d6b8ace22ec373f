//! Public-IP pool management.
//!
//! Pools are CIDR blocks of public IPv4 addresses. Exactly one assignment
//! mode is active per process: floating (any free IP, any pod), fixed
//! (pools bound to nodes, taking an IP pins the pod) or AWS (no local IPs
//! at all, the ELB hostname is the public identity).
//!
//! Every writer of a pool row — allocation, blocked-list edits, node
//! rebinding — serializes through a `FOR UPDATE` lock on that row. In
//! fixed mode the node's free-IP counter annotation is kept in the same
//! logical transaction: if the annotation write fails, the pool change
//! rolls back.

pub mod net;

use std::collections::BTreeSet;

use ipnet::Ipv4Net;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::IpMode;
use crate::kube_client::KubeClient;
use crate::store::ippool::{PodIpRecord, PoolRecord};
use crate::store::nodes::NodeRecord;
use crate::store::pods::PodRecord;
use crate::store::DbPool;
use crate::{Error, Result};

/// Node annotation tracking free public IPs in fixed mode.
pub const FREE_PUBLIC_IP_COUNT_ANNOTATION: &str = "kuberdock-free-public-ip-count";

/// The pool manager.
#[derive(Clone)]
pub struct IpAddrPool {
    db: DbPool,
    kube: KubeClient,
    mode: IpMode,
}

/// One pool with its allocation report.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PoolReport {
    /// The CIDR.
    pub network: String,
    /// IPv6 flag.
    pub ipv6: bool,
    /// Bound node hostname (fixed mode).
    pub node: Option<String>,
    /// Free hosts on the requested page, dotted form.
    pub free_hosts: Vec<String>,
    /// Blocked hosts, dotted form.
    pub blocked_list: Vec<String>,
    /// `(start, end, state)` runs over the whole network, state one of
    /// `free` / `busy` / `blocked`.
    pub blocks: Vec<(String, String, String)>,
    /// The requested page.
    pub page: u32,
    /// Total pages.
    pub pages: u32,
}

impl IpAddrPool {
    /// Build the manager for the configured mode.
    pub fn new(db: DbPool, kube: KubeClient, mode: IpMode) -> Self {
        Self { db, kube, mode }
    }

    /// The active assignment mode.
    pub fn mode(&self) -> IpMode {
        self.mode
    }

    /// List every pool with its allocation report.
    pub async fn list(&self, page: Option<u32>) -> Result<Vec<PoolReport>> {
        let mut reports = Vec::new();
        for record in PoolRecord::all(&self.db).await? {
            reports.push(self.report(&record, page).await?);
        }
        Ok(reports)
    }

    /// One pool's allocation report.
    pub async fn get(&self, network: &str, page: Option<u32>) -> Result<PoolReport> {
        let record = PoolRecord::by_network(&self.db, network)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Network '{}' does not exist", network)))?;
        self.report(&record, page).await
    }

    async fn report(&self, record: &PoolRecord, page: Option<u32>) -> Result<PoolReport> {
        let network = net::parse_network(&record.network)?;
        let allocated = PodIpRecord::allocated_set(&self.db, &record.network).await?;
        let blocked: BTreeSet<u32> = record
            .blocked_set()
            .into_iter()
            .filter(|ip| net::contains(&network, *ip))
            .collect();
        let taken: BTreeSet<u32> = allocated.union(&blocked).copied().collect();

        let page = net::clamp_page(&network, page);
        let free_hosts = net::free_hosts_in_page(&network, page, &taken)
            .into_iter()
            .map(net::int_to_ip)
            .collect();

        let busy_blocks = net::ip_list_by_blocks(&allocated);
        let blocked_blocks = net::ip_list_by_blocks(&blocked);
        let mut non_free: Vec<(u32, u32)> = busy_blocks
            .iter()
            .chain(blocked_blocks.iter())
            .copied()
            .collect();
        non_free.sort_unstable();
        let base = u32::from(network.network());
        let end = base + (net::host_count(&network) - 1) as u32;
        let free_blocks = net::missing_intervals(&non_free, base, end);

        let mut tagged: Vec<(u32, u32, &str)> = Vec::new();
        for (kind, runs) in [
            ("busy", busy_blocks),
            ("blocked", blocked_blocks),
            ("free", free_blocks),
        ] {
            tagged.extend(runs.into_iter().map(|(start, end)| (start, end, kind)));
        }
        tagged.sort_unstable();
        let blocks = tagged
            .into_iter()
            .map(|(start, end, kind)| {
                (net::int_to_ip(start), net::int_to_ip(end), kind.to_owned())
            })
            .collect();

        let node = match record.node_id {
            Some(node_id) => Some(NodeRecord::by_id(&self.db, node_id).await?.hostname),
            None => None,
        };

        Ok(PoolReport {
            network: record.network.clone(),
            ipv6: record.ipv6,
            node,
            free_hosts,
            blocked_list: blocked.into_iter().map(net::int_to_ip).collect(),
            blocks,
            page,
            pages: net::pages(&network),
        })
    }

    /// Create a pool.
    ///
    /// The CIDR must not overlap any existing pool. `autoblock` is an
    /// expression of single IPs and ranges excluded from allocation. In
    /// fixed mode the pool binds to `node` and the node's free-IP counter
    /// annotation is seeded.
    #[instrument(level = "info", skip(self))]
    pub async fn create(
        &self,
        network: &str,
        node: Option<&str>,
        autoblock: Option<&str>,
    ) -> Result<PoolReport> {
        if self.mode == IpMode::Aws {
            return Err(Error::Validation(
                "IP pools are not used in AWS mode".to_owned(),
            ));
        }
        let parsed = net::parse_network(network)?;
        self.check_overlap(&parsed, network).await?;

        let node_record = match node {
            Some(hostname) => Some(NodeRecord::by_hostname(&self.db, hostname).await?),
            None => None,
        };
        if self.mode == IpMode::Fixed && node_record.is_none() {
            return Err(Error::Validation(
                "Fixed IP pools require a node binding".to_owned(),
            ));
        }

        let blocked = match autoblock {
            Some(expression) => net::parse_autoblock(expression)?,
            None => BTreeSet::new(),
        };
        let record = PoolRecord {
            network: parsed.to_string(),
            ipv6: false,
            blocked_list: Some(PoolRecord::encode_blocked(&blocked)),
            node_id: node_record.as_ref().map(|n| n.id),
        };

        let mut tx = self.db.begin().await?;
        PoolRecord::insert(&mut tx, &record).await?;
        if self.mode == IpMode::Fixed {
            let node_record = node_record.as_ref().expect("checked above");
            let free = net::host_count(&parsed) as i64 - blocked.len() as i64;
            // Same logical transaction: a failed annotation write aborts
            // the pool creation.
            self.increment_node_free_count(&node_record.hostname, free)
                .await?;
        }
        tx.commit().await?;
        info!(%network, "IP pool created");

        self.get(&record.network, None).await
    }

    async fn check_overlap(&self, candidate: &Ipv4Net, original: &str) -> Result<()> {
        for existing in PoolRecord::all(&self.db).await? {
            let existing_net = net::parse_network(&existing.network)?;
            if existing_net == *candidate {
                return Err(Error::Conflict(format!(
                    "Network {} already exists",
                    original
                )));
            }
            if candidate.contains(&existing_net.network()) || existing_net.contains(&candidate.network())
            {
                return Err(Error::Conflict(format!(
                    "New {} network overlaps {} which already exists",
                    original, existing.network
                )));
            }
        }
        Ok(())
    }

    /// Block an IP. Blocking an allocated IP does not touch the allocation.
    ///
    /// Serialized with every other writer of the pool through the row
    /// lock, so two concurrent blocks cannot lose each other's entry.
    pub async fn block_ip(&self, network: &str, ip: &str) -> Result<()> {
        let ip = net::ip_to_int(ip)?;
        let mut tx = self.db.begin().await?;
        let record = PoolRecord::lock(&mut tx, network).await?;
        let mut blocked = record.blocked_set();
        if !blocked.insert(ip) {
            return Err(Error::Conflict("IP is already blocked".to_owned()));
        }
        PoolRecord::set_blocked(&mut tx, network, &blocked).await?;
        // A failed counter write aborts the block.
        self.adjust_fixed_count(&record, -1).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Unblock an IP.
    pub async fn unblock_ip(&self, network: &str, ip: &str) -> Result<()> {
        let ip = net::ip_to_int(ip)?;
        let mut tx = self.db.begin().await?;
        let record = PoolRecord::lock(&mut tx, network).await?;
        let mut blocked = record.blocked_set();
        if !blocked.remove(&ip) {
            return Err(Error::Conflict("IP is already unblocked".to_owned()));
        }
        PoolRecord::set_blocked(&mut tx, network, &blocked).await?;
        self.adjust_fixed_count(&record, 1).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Rebind a pool to another node (fixed mode). Refused while any of
    /// the pool's IPs is assigned to a pod.
    pub async fn set_node(&self, network: &str, node: &str) -> Result<()> {
        let node = NodeRecord::by_hostname(&self.db, node).await?;
        let mut tx = self.db.begin().await?;
        let record = PoolRecord::lock(&mut tx, network).await?;
        if !PodIpRecord::allocated_set_tx(&mut tx, network).await?.is_empty() {
            return Err(Error::Conflict(format!(
                "You cannot change the node of network '{}' while some of \
                 IP-addresses of this network were assigned to Pods",
                network
            )));
        }
        PoolRecord::set_node(&mut tx, network, Some(node.id)).await?;
        if self.mode == IpMode::Fixed {
            let parsed = net::parse_network(network)?;
            let free = net::host_count(&parsed) as i64 - record.blocked_set().len() as i64;
            if let Some(old_node_id) = record.node_id {
                let old_node = NodeRecord::by_id(&self.db, old_node_id).await?;
                let _ = self.increment_node_free_count(&old_node.hostname, -free).await;
            }
            self.increment_node_free_count(&node.hostname, free).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Release the PodIP row holding an IP, freeing it for reallocation.
    pub async fn unbind_ip(&self, ip: &str) -> Result<()> {
        let ip_int = net::ip_to_int(ip)?;
        let binding = PodIpRecord::by_ip(&self.db, ip_int).await?;
        let released = PodIpRecord::delete_by_ip(&self.db, ip_int).await?;
        if released == 0 {
            return Err(Error::NotFound(format!("IP {} is not assigned", ip)));
        }
        if let Some(binding) = binding {
            if let Some(record) = PoolRecord::by_network(&self.db, &binding.network).await? {
                self.adjust_fixed_count(&record, 1).await?;
            }
        }
        Ok(())
    }

    /// Delete a pool. Refused while any pod still holds one of its IPs.
    #[instrument(level = "info", skip(self))]
    pub async fn delete(&self, network: &str) -> Result<()> {
        let record = self.require_pool(network).await?;
        if !PodIpRecord::in_network(&self.db, network).await?.is_empty() {
            return Err(Error::Conflict(format!(
                "You cannot delete this network '{}' while some of IP-addresses \
                 of this network are assigned to Pods",
                network
            )));
        }

        let parsed = net::parse_network(network)?;
        let blocked = record.blocked_set();
        let free = net::host_count(&parsed) as i64 - blocked.len() as i64;

        let mut tx = self.db.begin().await?;
        PoolRecord::delete(&mut tx, network).await?;
        if self.mode == IpMode::Fixed {
            if let Some(node_id) = record.node_id {
                let node = NodeRecord::by_id(&self.db, node_id).await?;
                // A node already gone from Kubernetes lost its counters too.
                if let Err(e) = self.increment_node_free_count(&node.hostname, -free).await {
                    warn!(error = %e, node = %node.hostname,
                        "could not decrement free-IP counter while deleting pool");
                }
            }
        }
        tx.commit().await?;
        info!(%network, "IP pool deleted");
        Ok(())
    }

    /// Return one free IP without allocating it (`/ippool/?free-only=1`).
    pub async fn get_free(&self) -> Result<Option<String>> {
        match self.find_free(None, None).await {
            Ok((_, ip)) => Ok(Some(net::int_to_ip(ip))),
            Err(Error::NoFreeIps) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Find a free IP, preferring `preferred_ip` when it is available and
    /// satisfies the node constraint. Does not allocate.
    async fn find_free(
        &self,
        node: Option<&str>,
        preferred_ip: Option<&str>,
    ) -> Result<(PoolRecord, u32)> {
        let records = match node {
            Some(hostname) if self.mode == IpMode::Fixed => {
                let node = NodeRecord::by_hostname(&self.db, hostname).await?;
                PoolRecord::by_node(&self.db, node.id).await?
            }
            _ => PoolRecord::all(&self.db).await?,
        };

        if let Some(preferred) = preferred_ip {
            let preferred = net::ip_to_int(preferred)?;
            for record in &records {
                let network = net::parse_network(&record.network)?;
                if !net::contains(&network, preferred) {
                    continue;
                }
                let taken = self.taken_set(record, &network).await?;
                if !taken.contains(&preferred) {
                    return Ok((record.clone(), preferred));
                }
            }
        }

        for record in records {
            let network = net::parse_network(&record.network)?;
            let taken = self.taken_set(&record, &network).await?;
            if let Some(host) = net::first_free_host(&network, &taken) {
                return Ok((record, host));
            }
        }
        Err(Error::NoFreeIps)
    }

    async fn taken_set(&self, record: &PoolRecord, network: &Ipv4Net) -> Result<BTreeSet<u32>> {
        let allocated = PodIpRecord::allocated_set(&self.db, &record.network).await?;
        let blocked: BTreeSet<u32> = record
            .blocked_set()
            .into_iter()
            .filter(|ip| net::contains(network, *ip))
            .collect();
        Ok(allocated.union(&blocked).copied().collect())
    }

    /// Allocate a free public IP to a pod and re-issue its Service with the
    /// new `externalIPs`.
    ///
    /// Concurrent callers racing for the same pool serialize on the pool
    /// row lock and re-check the free set inside the transaction.
    #[instrument(level = "info", skip(self))]
    pub async fn assign_ip_to_pod(
        &self,
        pod_id: Uuid,
        node: Option<&str>,
        preferred_ip: Option<&str>,
    ) -> Result<String> {
        if self.mode == IpMode::Aws {
            return Err(Error::Validation(
                "Public IPs are provided by the load balancer in AWS mode".to_owned(),
            ));
        }
        let pod = PodRecord::by_id(&self.db, pod_id).await?;
        if PodIpRecord::by_pod(&self.db, pod_id).await?.is_some() {
            return Err(Error::Conflict(format!(
                "Pod '{}' already has a public IP",
                pod.name
            )));
        }

        let (candidate_pool, candidate_ip) = self.find_free(node, preferred_ip).await?;

        let mut tx = self.db.begin().await?;
        let locked = PoolRecord::lock(&mut tx, &candidate_pool.network).await?;
        let network = net::parse_network(&locked.network)?;
        let allocated = PodIpRecord::allocated_set_tx(&mut tx, &locked.network).await?;
        let blocked: BTreeSet<u32> = locked
            .blocked_set()
            .into_iter()
            .filter(|ip| net::contains(&network, *ip))
            .collect();
        let taken: BTreeSet<u32> = allocated.union(&blocked).copied().collect();
        // Someone may have taken our candidate between the scan and the
        // lock; fall back to the first free host under the lock.
        let ip = if taken.contains(&candidate_ip) {
            net::first_free_host(&network, &taken).ok_or(Error::NoFreeIps)?
        } else {
            candidate_ip
        };

        PodIpRecord::insert(
            &mut tx,
            &PodIpRecord {
                pod_id,
                network: locked.network.clone(),
                ip_address: ip as i64,
            },
        )
        .await?;
        if self.mode == IpMode::Fixed {
            if let Some(node_id) = locked.node_id {
                let node = NodeRecord::by_id(&self.db, node_id).await?;
                self.increment_node_free_count(&node.hostname, -1).await?;
            }
        }
        tx.commit().await?;

        let ip_string = net::int_to_ip(ip);
        info!(%pod_id, ip = %ip_string, "public IP assigned");

        // Store the IP in the pod config and re-issue the service.
        let mut config = pod.config()?;
        config.public_ip = Some(ip_string.clone());
        if self.mode == IpMode::Fixed {
            if let Some(hostname) = node {
                config.node = Some(hostname.to_owned());
            }
        }
        PodRecord::set_config(&self.db, pod_id, &config).await?;
        self.update_service_external_ips(pod_id, &ip_string).await?;
        Ok(ip_string)
    }

    /// Release a pod's public IP and its PodIP row.
    pub async fn release_pod_ip(&self, pod_id: Uuid) -> Result<()> {
        if let Some(binding) = PodIpRecord::by_pod(&self.db, pod_id).await? {
            PodIpRecord::delete_by_pod(&self.db, pod_id).await?;
            if let Some(record) = PoolRecord::by_network(&self.db, &binding.network).await? {
                self.adjust_fixed_count(&record, 1).await?;
            }
        }
        Ok(())
    }

    async fn update_service_external_ips(&self, pod_id: Uuid, ip: &str) -> Result<()> {
        let namespace = pod_id.to_string();
        for mut service in self.kube.services_by_pod(&namespace).await? {
            if let Some(spec) = service.spec.as_mut() {
                spec.external_ips = Some(vec![ip.to_owned()]);
            }
            self.kube.replace_service(&namespace, &service).await?;
        }
        Ok(())
    }

    async fn require_pool(&self, network: &str) -> Result<PoolRecord> {
        PoolRecord::by_network(&self.db, network)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Network '{}' does not exist", network)))
    }

    async fn adjust_fixed_count(&self, record: &PoolRecord, delta: i64) -> Result<()> {
        if self.mode != IpMode::Fixed {
            return Ok(());
        }
        if let Some(node_id) = record.node_id {
            let node = NodeRecord::by_id(&self.db, node_id).await?;
            self.increment_node_free_count(&node.hostname, delta)
                .await
                .map_err(|_| {
                    Error::Conflict("Could not modify IP. Please try later".to_owned())
                })?;
        }
        Ok(())
    }

    async fn increment_node_free_count(&self, hostname: &str, delta: i64) -> Result<()> {
        self.kube
            .increment_node_annotation(hostname, FREE_PUBLIC_IP_COUNT_ANNOTATION, delta)
            .await
            .map(|_| ())
    }

    /// A user's public identities for API listings: ELB hostnames in AWS
    /// mode, assigned IPs otherwise.
    pub async fn user_addresses(&self, owner_id: i32) -> Result<Vec<serde_json::Value>> {
        let pods = PodRecord::live_by_owner(&self.db, owner_id).await?;

        if self.mode == IpMode::Aws {
            let lbs = crate::lbpoll::LoadBalanceService::new(self.kube.clone());
            let ids: Vec<Uuid> = pods.iter().map(|pod| pod.id).collect();
            let hostnames = lbs.dns_by_pods(&ids).await?;
            return Ok(pods
                .iter()
                .filter_map(|pod| {
                    hostnames.get(&pod.id).map(|hostname| {
                        json!({ "id": hostname, "pod": pod.name, "pod_id": pod.id })
                    })
                })
                .collect());
        }

        let mut result = Vec::new();
        for pod in pods {
            if let Some(binding) = PodIpRecord::by_pod(&self.db, pod.id).await? {
                result.push(json!({
                    "id": net::int_to_ip(binding.ip_address as u32),
                    "pod": pod.name,
                    "pod_id": pod.id,
                }));
            }
        }
        Ok(result)
    }
}
