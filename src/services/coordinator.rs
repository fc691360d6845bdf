//! Reservation coordinator: tunnel create/delete across local and
//! federated hops.
//!
//! A tunnel is an ordered set of hops: entry hops, middle-chain hop
//! groups (parallel members per position) and exit hops. Entry hops take
//! customer traffic on forward ports created later and reserve nothing
//! here; chain and exit hops each bind one port on their node — picked
//! locally for local nodes, reserved over federation for shadow nodes.
//!
//! Hops are resolved exit-first so every hop's `target` already names
//! the bound address of its downstream group. Any failure after partial
//! remote progress releases prior reservations in reverse order; local
//! port conflicts retry the whole plan with fresh picks, preferring the
//! ports of the previous attempt.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::api::dto::{CreateTunnelRequest, HopSpec};
use crate::error::{AppError, Result};
use crate::models::node::Node;
use crate::models::tunnel::{
    role_for_chain_type, ChainTunnel, FederationTunnelBinding, Tunnel, CHAIN_TYPE_ENTRY,
    CHAIN_TYPE_EXIT, CHAIN_TYPE_MIDDLE,
};
use crate::services::federation_client::{FederationClient, PeerEndpoint, ReserveRequest};
use crate::services::port_picker::{pick_port, used_ports};
use crate::services::session_registry::{NodeCommand, SessionRegistry};

const MAX_CREATE_ATTEMPTS: u32 = 8;

/// One hop of a tunnel plan.
#[derive(Debug, Clone)]
pub struct PlannedHop {
    pub node: Node,
    pub chain_type: i64,
    /// Middle-chain position (0 for entry/exit hops).
    pub inx: i64,
    /// Stable slot label within the tunnel, e.g. `2.0.1`.
    pub pos_label: String,
    pub protocol: String,
    pub strategy: String,
    pub requested_port: i64,
    /// Bound port; stays 0 for entry hops and, until the federation
    /// step runs, for remote auto-port hops.
    pub port: i64,
    pub target: String,
    /// Reservation id returned by the peer, remote hops only.
    pub reservation_id: String,
}

impl PlannedHop {
    pub fn is_remote(&self) -> bool {
        self.node.is_remote()
    }

    fn peer(&self) -> PeerEndpoint {
        PeerEndpoint {
            base_url: self.node.remote_url.clone(),
            share_token: self.node.remote_token.clone(),
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.node.dial_ip(), self.port)
    }
}

/// A resolved tunnel-create request before the federation step.
#[derive(Debug)]
pub struct TunnelPlan {
    pub name: String,
    pub tunnel_type: i64,
    pub flow: i64,
    pub status: i64,
    pub user_id: i64,
    pub entries: Vec<PlannedHop>,
    pub chains: Vec<Vec<PlannedHop>>,
    pub exits: Vec<PlannedHop>,
}

pub struct TunnelCoordinator {
    db: SqlitePool,
    sessions: Arc<SessionRegistry>,
    federation: Arc<FederationClient>,
}

impl TunnelCoordinator {
    pub fn new(
        db: SqlitePool,
        sessions: Arc<SessionRegistry>,
        federation: Arc<FederationClient>,
    ) -> Self {
        Self {
            db,
            sessions,
            federation,
        }
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Create a tunnel and return its id.
    pub async fn create_tunnel(&self, req: &CreateTunnelRequest, user_id: i64) -> Result<i64> {
        if req.name.trim().is_empty() {
            return Err(AppError::BadRequest("tunnel name is required".into()));
        }
        if req.in_nodes.is_empty() || req.out_nodes.is_empty() {
            return Err(AppError::BadRequest(
                "tunnel needs at least one entry and one exit hop".into(),
            ));
        }

        // Ports held by the previous attempt are preferred on retry so a
        // transient conflict does not reshuffle the whole allocation.
        let mut preferred: HashMap<String, i64> = HashMap::new();
        let mut last_err = AppError::Internal("tunnel create did not run".into());

        for attempt in 0..MAX_CREATE_ATTEMPTS {
            let plan = match self.plan(req, user_id, &preferred).await {
                Ok(plan) => plan,
                Err(AppError::PortBusy(msg)) => {
                    last_err = AppError::PortBusy(msg);
                    continue;
                }
                Err(other) => return Err(other),
            };
            for hop in plan.all_hops() {
                if hop.port > 0 {
                    preferred.insert(hop.pos_label.clone(), hop.port);
                }
            }

            match self.execute(plan).await {
                Ok(id) => return Ok(id),
                Err(AppError::PortBusy(msg)) => {
                    tracing::debug!(attempt, msg = %msg, "port conflict, replanning tunnel");
                    last_err = AppError::PortBusy(msg);
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_err)
    }

    /// Resolve nodes, classify hops and pick local ports. Remote hops
    /// keep port 0 (or their requested port) until the federation step.
    pub async fn plan(
        &self,
        req: &CreateTunnelRequest,
        user_id: i64,
        preferred: &HashMap<String, i64>,
    ) -> Result<TunnelPlan> {
        let mut plan = TunnelPlan {
            name: req.name.trim().to_string(),
            tunnel_type: req.tunnel_type,
            flow: req.flow,
            status: req.status,
            user_id,
            entries: Vec::new(),
            chains: Vec::new(),
            exits: Vec::new(),
        };

        for (j, spec) in req.in_nodes.iter().enumerate() {
            let label = format!("{CHAIN_TYPE_ENTRY}.{j}");
            plan.entries
                .push(self.resolve_hop(spec, CHAIN_TYPE_ENTRY, 0, label).await?);
        }
        for (inx, group) in req.chain_nodes.iter().enumerate() {
            let mut hops = Vec::new();
            for (j, spec) in group.iter().enumerate() {
                let label = format!("{CHAIN_TYPE_MIDDLE}.{inx}.{j}");
                hops.push(
                    self.resolve_hop(spec, CHAIN_TYPE_MIDDLE, inx as i64 + 1, label)
                        .await?,
                );
            }
            plan.chains.push(hops);
        }
        for (j, spec) in req.out_nodes.iter().enumerate() {
            let label = format!("{CHAIN_TYPE_EXIT}.{j}");
            plan.exits
                .push(self.resolve_hop(spec, CHAIN_TYPE_EXIT, 0, label).await?);
        }

        self.pick_local_ports(&mut plan, preferred).await?;
        Ok(plan)
    }

    async fn resolve_hop(
        &self,
        spec: &HopSpec,
        chain_type: i64,
        inx: i64,
        pos_label: String,
    ) -> Result<PlannedHop> {
        let node = Node::by_id(&self.db, spec.node_id)
            .await?
            .ok_or_else(|| AppError::BadRequest(format!("node {} not found", spec.node_id)))?;

        if node.is_remote() && (node.remote_url.is_empty() || node.remote_token.is_empty()) {
            return Err(AppError::BadRequest(format!(
                "remote node {} has no peer coordinates",
                node.id
            )));
        }

        Ok(PlannedHop {
            node,
            chain_type,
            inx,
            pos_label,
            protocol: spec.protocol.clone(),
            strategy: spec.strategy.clone(),
            requested_port: spec.port,
            port: if chain_type == CHAIN_TYPE_ENTRY { 0 } else { spec.port },
            target: String::new(),
            reservation_id: String::new(),
        })
    }

    /// Pick ports for local chain/exit hops. Hops of the same plan on
    /// the same node must not collide, so picks accumulate into the
    /// per-node used set.
    async fn pick_local_ports(
        &self,
        plan: &mut TunnelPlan,
        preferred: &HashMap<String, i64>,
    ) -> Result<()> {
        let mut used_by_node: HashMap<i64, BTreeSet<i64>> = HashMap::new();

        for hop in plan.reserving_hops_mut() {
            if hop.is_remote() {
                continue;
            }

            let node_id = hop.node.id;
            if !used_by_node.contains_key(&node_id) {
                let mut conn = self.db.acquire().await?;
                let used = used_ports(&mut conn, node_id).await?;
                used_by_node.insert(node_id, used);
            }
            let used = used_by_node
                .get_mut(&node_id)
                .expect("used set inserted above");

            let hints: Vec<i64> = preferred.get(&hop.pos_label).copied().into_iter().collect();
            let range = hop.node.port_range()?;
            let port = pick_port(used, range, hop.requested_port, &hints)?;
            used.insert(port);
            hop.port = port;
        }

        Ok(())
    }

    /// Run the federation and persistence steps of a resolved plan.
    async fn execute(&self, mut plan: TunnelPlan) -> Result<i64> {
        let mut reserved: Vec<(PeerEndpoint, String)> = Vec::new();

        match self.reserve_remote(&mut plan, &mut reserved).await {
            Ok(()) => {}
            Err(err) => {
                self.release_reserved(&mut reserved).await;
                return Err(err);
            }
        }

        for (peer, reservation_id) in &reserved {
            if let Err(err) = self.federation.commit(peer, reservation_id).await {
                self.release_reserved(&mut reserved).await;
                return Err(err);
            }
        }

        let tunnel_id = match self.persist(&plan).await {
            Ok(id) => id,
            Err(err) => {
                self.release_reserved(&mut reserved).await;
                return Err(err);
            }
        };

        self.apply_local(tunnel_id, &plan).await;
        Ok(tunnel_id)
    }

    /// Reserve every remote chain/exit hop, exit hops first so middle
    /// hops can carry their downstream addresses as targets.
    async fn reserve_remote(
        &self,
        plan: &mut TunnelPlan,
        reserved: &mut Vec<(PeerEndpoint, String)>,
    ) -> Result<()> {
        // Exits have no downstream target inside the tunnel.
        for hop in plan.exits.iter_mut() {
            self.reserve_hop(&plan.name, hop, reserved).await?;
        }

        let mut downstream: Vec<String> = plan.exits.iter().map(PlannedHop::address).collect();

        for group in plan.chains.iter_mut().rev() {
            let target = downstream.join(",");
            for hop in group.iter_mut() {
                hop.target = target.clone();
                self.reserve_hop(&plan.name, hop, reserved).await?;
            }
            downstream = group.iter().map(PlannedHop::address).collect();
        }

        // Entry hops point at the head of the chain but reserve nothing.
        let entry_target = downstream.join(",");
        for hop in plan.entries.iter_mut() {
            hop.target = entry_target.clone();
        }

        Ok(())
    }

    async fn reserve_hop(
        &self,
        tunnel_name: &str,
        hop: &mut PlannedHop,
        reserved: &mut Vec<(PeerEndpoint, String)>,
    ) -> Result<()> {
        if !hop.is_remote() {
            return Ok(());
        }

        let peer = hop.peer();
        let request = ReserveRequest {
            resource_key: resource_key(tunnel_name, hop.chain_type, &hop.pos_label),
            role: role_for_chain_type(hop.chain_type).to_string(),
            chain_name: tunnel_name.to_string(),
            protocol: hop.protocol.clone(),
            strategy: hop.strategy.clone(),
            port: hop.requested_port,
            target: hop.target.clone(),
            binding_id: format!("{tunnel_name}#{}", hop.pos_label),
        };

        let reply = match self.federation.reserve(&peer, &request).await {
            Ok(reply) => reply,
            // A pinned port may be taken on the provider; fall back to
            // letting it pick. Auto-port requests surface the error.
            Err(AppError::PortBusy(_)) if request.port != 0 => {
                let retry = ReserveRequest { port: 0, ..request };
                self.federation.reserve(&peer, &retry).await?
            }
            Err(err) => return Err(err),
        };

        hop.port = reply.port;
        hop.reservation_id = reply.reservation_id.clone();
        reserved.push((peer, reply.reservation_id));
        Ok(())
    }

    /// Write the tunnel, chain rows and bindings in one transaction.
    /// Local picks are re-verified inside the transaction: a concurrent
    /// create that won the port surfaces here as `PortBusy`.
    async fn persist(&self, plan: &TunnelPlan) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.db.begin().await?;

        let tunnel_id = sqlx::query(
            "INSERT INTO tunnel(name, type, flow, status, user_id, created_time, updated_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(&plan.name)
        .bind(plan.tunnel_type)
        .bind(plan.flow)
        .bind(plan.status)
        .bind(plan.user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut verified: HashMap<i64, BTreeSet<i64>> = HashMap::new();

        for hop in plan.all_hops() {
            if hop.chain_type != CHAIN_TYPE_ENTRY && !hop.is_remote() {
                if !verified.contains_key(&hop.node.id) {
                    let set = used_ports(&mut tx, hop.node.id).await?;
                    verified.insert(hop.node.id, set);
                }
                let used = verified.get(&hop.node.id).expect("used set inserted above");
                if used.contains(&hop.port) {
                    return Err(AppError::PortBusy(hop.port.to_string()));
                }
            }

            let chain_tunnel_id = sqlx::query(
                "INSERT INTO chain_tunnel(tunnel_id, chain_type, node_id, port, inx, protocol, strategy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(tunnel_id)
            .bind(hop.chain_type)
            .bind(hop.node.id)
            .bind(hop.port)
            .bind(hop.inx)
            .bind(&hop.protocol)
            .bind(&hop.strategy)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            verified
                .entry(hop.node.id)
                .or_default()
                .insert(hop.port);

            if !hop.reservation_id.is_empty() {
                sqlx::query(
                    "INSERT INTO federation_tunnel_binding
                        (tunnel_id, chain_type, chain_tunnel_id, remote_node_id,
                         remote_share_token, peer_url, peer_reservation_id,
                         status, created_time, updated_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
                )
                .bind(tunnel_id)
                .bind(hop.chain_type)
                .bind(chain_tunnel_id)
                .bind(hop.node.id)
                .bind(&hop.node.remote_token)
                .bind(&hop.node.remote_url)
                .bind(&hop.reservation_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(tunnel_id)
    }

    /// Dispatch create-service to local hops with a live session. Remote
    /// hops were applied by the provider at commit time; local hops
    /// without a session pick the service up on reconnect.
    async fn apply_local(&self, tunnel_id: i64, plan: &TunnelPlan) {
        for hop in plan.all_hops() {
            if hop.is_remote() || hop.chain_type == CHAIN_TYPE_ENTRY {
                continue;
            }
            if !self.sessions.is_alive(hop.node.id) {
                continue;
            }

            let service = local_service_name(tunnel_id, hop.chain_type, hop.inx, hop.port);
            let result = self
                .sessions
                .call(
                    hop.node.id,
                    NodeCommand::new(
                        "CreateService",
                        json!({
                            "name": service,
                            "protocol": hop.protocol,
                            "port": hop.port,
                            "target": hop.target,
                            "strategy": hop.strategy,
                            "chainName": plan.name,
                        }),
                    ),
                )
                .await;
            if let Err(err) = result {
                tracing::warn!(tunnel_id, node_id = hop.node.id, error = %err, "local service apply failed");
            }
        }
    }

    async fn release_reserved(&self, reserved: &mut Vec<(PeerEndpoint, String)>) {
        while let Some((peer, reservation_id)) = reserved.pop() {
            if let Err(err) = self.federation.release(&peer, &reservation_id).await {
                tracing::warn!(
                    peer = %peer.base_url,
                    reservation_id = %reservation_id,
                    error = %err,
                    "compensating release failed"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    /// Delete a tunnel: bindings, chain rows and the tunnel row go in one
    /// transaction, then remote releases and local service teardown run
    /// best-effort outside it. Binding deletion first means a crash here
    /// leaves only the durable pending-release path to finish the job.
    pub async fn delete_tunnel(&self, tunnel_id: i64) -> Result<()> {
        let tunnel = Tunnel::by_id(&self.db, tunnel_id)
            .await?
            .ok_or_else(|| AppError::BadRequest(format!("tunnel {tunnel_id} not found")))?;

        let bindings = FederationTunnelBinding::for_tunnel(&self.db, tunnel_id).await?;
        let chains = ChainTunnel::for_tunnel(&self.db, tunnel_id).await?;

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM federation_tunnel_binding WHERE tunnel_id = ?1")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chain_tunnel WHERE tunnel_id = ?1")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tunnel WHERE id = ?1")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        for binding in &bindings {
            let peer = PeerEndpoint {
                base_url: binding.peer_url.clone(),
                share_token: binding.remote_share_token.clone(),
            };
            if let Err(err) = self
                .federation
                .release(&peer, &binding.peer_reservation_id)
                .await
            {
                tracing::warn!(tunnel_id, error = %err, "remote release failed during delete");
            }
        }

        let remote_chain_ids: BTreeSet<i64> =
            bindings.iter().map(|b| b.chain_tunnel_id).collect();
        for chain in chains
            .iter()
            .filter(|c| c.chain_type != CHAIN_TYPE_ENTRY && !remote_chain_ids.contains(&c.id))
        {
            if !self.sessions.is_alive(chain.node_id) {
                continue;
            }
            let base = local_service_name(tunnel_id, chain.chain_type, chain.inx, chain.port);
            for name in crate::services::naming::control_service_names(&base, "DeleteService") {
                let _ = self
                    .sessions
                    .call(chain.node_id, NodeCommand::new("DeleteService", json!({ "name": name })))
                    .await;
            }
        }

        tracing::info!(tunnel_id, name = %tunnel.name, "tunnel deleted");
        Ok(())
    }
}

impl TunnelPlan {
    /// All hops in persistence order: entries, chain groups, exits.
    pub fn all_hops(&self) -> impl Iterator<Item = &PlannedHop> {
        self.entries
            .iter()
            .chain(self.chains.iter().flatten())
            .chain(self.exits.iter())
    }

    /// Hops that bind a port (chain and exit).
    fn reserving_hops_mut(&mut self) -> impl Iterator<Item = &mut PlannedHop> {
        self.chains
            .iter_mut()
            .flatten()
            .chain(self.exits.iter_mut())
    }
}

/// Stable idempotency key for a remote slot: same tunnel name, chain
/// type and position always map to the same key, so a retried create
/// re-attaches to its own reservation instead of leaking a second one.
pub fn resource_key(tunnel_name: &str, chain_type: i64, pos_label: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tunnel_name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(chain_type.to_le_bytes());
    hasher.update([0x1f]);
    hasher.update(pos_label.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..48].to_string()
}

fn local_service_name(tunnel_id: i64, chain_type: i64, inx: i64, port: i64) -> String {
    format!("tun_{tunnel_id}_{chain_type}_{inx}_{port}")
}
