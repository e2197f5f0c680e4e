//! The site node: a member of the federation ring.
//!
//! Owns the partner table, a pooled client connection per partner
//! address, and the bootstrap state machine. Incoming messages arrive
//! through the borrowed transport server's callback; every message is
//! first mined for partner info headers (the epidemic exchange), then
//! offered to the request table.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OnceCell, watch};
use weft_transport::{
    Actor, ByteArrayMessage, ClientConfig, ClientTls, Connection, HeaderId, Message,
    MessageHeaders, MessageIdGenerator, RequestTable, Server, TransportError,
};

use crate::error::FederationError;
use crate::node_id::{NodeId, NodeInstance};
use crate::partner_table::PartnerTable;
use crate::proto::{
    FederationPartnerNodeHeader, NodePhase, PToPActor, PToPHeader, PartnerNodeInfo,
    RoutingHeader, register_federation_headers,
};
use crate::time::{StopwatchTime, TimeSpan};

const ACTION_VOTE_PING: &str = "VotePing";
const ACTION_PING: &str = "Ping";
const ACTION_NEIGHBORHOOD_QUERY: &str = "NeighborhoodQueryRequest";

/// How a site node reaches a partner address.
pub type Dialer = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send>>
        + Send
        + Sync,
>;

/// A seed node: a well-known ring member used to bootstrap.
#[derive(Debug, Clone)]
pub struct SeedNodeInfo {
    /// The seed's ring id.
    pub id: NodeId,
    /// The seed's transport address.
    pub address: String,
}

/// Configuration for a site node.
#[derive(Clone, Default)]
pub struct SiteNodeConfig {
    /// This node's id and incarnation.
    pub instance: NodeInstance,
    /// Ring members to bootstrap from. Must not be empty.
    pub seed_nodes: Vec<SeedNodeInfo>,
    /// Address of the external lease agent advertised to partners.
    pub lease_agent_address: String,
    /// Name of the ring this node belongs to.
    pub ring_name: String,
    /// TLS identity for outbound partner connections.
    pub client_tls: Option<ClientTls>,
    /// Custom dialer; defaults to TCP with `client_tls`.
    pub dialer: Option<Dialer>,
    /// Pause between bootstrap vote-ping rounds.
    pub bootstrap_interval: Option<Duration>,
    /// Pause between discovery ping rounds.
    pub discover_interval: Option<Duration>,
}

const DEFAULT_BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_DISCOVER_INTERVAL: Duration = Duration::from_secs(1);
const DISCOVER_QUIET_ROUNDS: u32 = 5;

struct CachedConn {
    cell: OnceCell<Result<Connection, TransportError>>,
}

struct SiteNodeInner {
    instance: NodeInstance,
    seeds: Vec<SeedNodeInfo>,
    server: Arc<Server>,
    lease_agent_address: String,
    ring_name: String,
    phase: watch::Sender<NodePhase>,
    generator: MessageIdGenerator,
    requests: RequestTable,
    dialer: Dialer,
    pool: DashMap<String, Arc<CachedConn>>,
    partners: PartnerTable,
    bootstrap_interval: Duration,
    discover_interval: Duration,
}

/// A member of the federation ring.
///
/// Clones share the same node. The borrowed transport server must be
/// driven by the caller (its `serve` loop accepts partner connections).
#[derive(Clone)]
pub struct SiteNode {
    inner: Arc<SiteNodeInner>,
}

impl std::fmt::Debug for SiteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteNode")
            .field("instance", &self.inner.instance)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SiteNode {
    /// Creates a site node on top of a transport server.
    ///
    /// Installs this node's message callback on the server and seeds
    /// the partner table from the configured seed nodes.
    pub fn new(server: Arc<Server>, config: SiteNodeConfig) -> Result<SiteNode, FederationError> {
        if config.seed_nodes.is_empty() {
            return Err(FederationError::NoSeedNodes);
        }

        register_federation_headers();

        let dialer: Dialer = match config.dialer {
            Some(dialer) => dialer,
            None => {
                let tls = config.client_tls.clone();
                Arc::new(move |address: String| {
                    let tls = tls.clone();
                    Box::pin(async move {
                        Connection::dial(
                            address,
                            ClientConfig { tls, ..ClientConfig::default() },
                        )
                        .await
                    })
                })
            }
        };

        let inner = Arc::new(SiteNodeInner {
            instance: config.instance,
            seeds: config.seed_nodes.clone(),
            server,
            lease_agent_address: config.lease_agent_address,
            ring_name: config.ring_name,
            phase: watch::Sender::new(NodePhase::BOOTING),
            generator: MessageIdGenerator::new(),
            requests: RequestTable::new(),
            dialer,
            pool: DashMap::new(),
            partners: PartnerTable::default(),
            bootstrap_interval: config.bootstrap_interval.unwrap_or(DEFAULT_BOOTSTRAP_INTERVAL),
            discover_interval: config.discover_interval.unwrap_or(DEFAULT_DISCOVER_INTERVAL),
        });

        // Dummy entries (incarnation zero) that give bootstrap somewhere
        // to send its first pings.
        for seed in &inner.seeds {
            inner.partners.update(&PartnerNodeInfo {
                instance: NodeInstance { id: seed.id, instance_id: 0 },
                address: seed.address.clone(),
                ..PartnerNodeInfo::default()
            });
        }

        let weak = Arc::downgrade(&inner);
        inner.server.set_message_callback(Arc::new(move |_conn, message| {
            if let Some(inner) = weak.upgrade() {
                SiteNodeInner::on_message(&inner, &message);
            }
        }));

        Ok(SiteNode { inner })
    }

    /// This node's instance.
    pub fn instance(&self) -> NodeInstance {
        self.inner.instance
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> NodePhase {
        *self.inner.phase.borrow()
    }

    /// Completes when the phase next changes.
    pub async fn phase_changed(&self) {
        let mut rx = self.inner.phase.subscribe();
        let _ = rx.changed().await;
    }

    /// Snapshot of every partner with a live incarnation.
    pub fn known_partners(&self) -> Vec<PartnerNodeInfo> {
        self.inner.partners.known(|p| p.instance.instance_id > 0)
    }

    /// Sends `message` directly to the node with exactly this id.
    pub async fn send_one_way(
        &self,
        id: NodeId,
        mut message: Message,
    ) -> Result<(), FederationError> {
        let (connection, target) = self.connect_to_node(id, true).await?;

        self.prepare(&mut message);
        message.headers.set_custom(
            HeaderId::PTOP,
            PToPHeader {
                from: self.inner.instance,
                to: target.instance,
                actor: PToPActor::DIRECT,
                exact_instance: true,
                ..PToPHeader::default()
            },
        );

        connection.send_one_way(&mut message).await?;
        Ok(())
    }

    /// Routes `message` toward `id` through the closest partner and
    /// waits for the correlated reply.
    ///
    /// A non-success error code on the reply surfaces as
    /// [`FederationError::Fault`]. Dropping the future cancels the
    /// pending request.
    pub async fn route(
        &self,
        id: NodeId,
        mut message: Message,
    ) -> Result<ByteArrayMessage, FederationError> {
        let (connection, target) = self.connect_to_node(id, false).await?;

        self.prepare(&mut message);
        message.headers.set_custom(
            HeaderId::PTOP,
            PToPHeader {
                from: self.inner.instance,
                to: target.instance,
                actor: PToPActor::ROUTING,
                exact_instance: false,
                ..PToPHeader::default()
            },
        );
        message.headers.set_custom(
            HeaderId::ROUTING,
            RoutingHeader {
                from: self.inner.instance,
                to: target.instance,
                message_id: message.headers.id,
                use_exact_routing: false,
                expects_reply: true,
                expiration: TimeSpan::MAX,
                retry_timeout: TimeSpan::MAX,
            },
        );
        message.headers.expects_reply = true;

        // Install the pending entry before the bytes can reach the wire.
        let pending = self.inner.requests.put(message.headers.id);
        connection.send_one_way(&mut message).await?;
        let reply = pending.wait().await?;

        if reply.headers.error_code.is_failure() {
            return Err(FederationError::Fault(reply.headers.error_code));
        }
        Ok(reply)
    }

    /// Drives the booting phase: vote-pings every seed until the node
    /// advances past `BOOTING`.
    pub async fn bootstrap(&self) -> Result<(), FederationError> {
        if self.phase() >= NodePhase::JOINING {
            return Ok(());
        }

        let mut phase_rx = self.inner.phase.subscribe();
        loop {
            for seed in &self.inner.seeds {
                if let Err(err) = self.vote_ping(seed.id).await {
                    tracing::warn!(seed = %seed.address, %err, "vote ping failed");
                }
            }

            loop {
                if *phase_rx.borrow_and_update() >= NodePhase::JOINING {
                    return Ok(());
                }
                tokio::select! {
                    changed = phase_rx.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                    () = tokio::time::sleep(self.inner.bootstrap_interval) => break,
                }
            }
        }
    }

    /// Pings known partners until no new partner info arrives for five
    /// consecutive rounds, then returns the accumulated set.
    pub async fn discover(&self) -> Vec<PartnerNodeInfo> {
        let mut quiet_rounds = 0;
        let mut last_version = self.inner.partners.version();

        while quiet_rounds < DISCOVER_QUIET_ROUNDS {
            for partner in self.known_partners() {
                if partner.instance.id == self.inner.instance.id {
                    continue;
                }
                let headers = MessageHeaders {
                    actor: Actor::FEDERATION,
                    action: ACTION_PING.to_string(),
                    ..MessageHeaders::default()
                };
                if let Err(err) =
                    self.send_one_way(partner.instance.id, Message { headers, ..Message::default() }).await
                {
                    tracing::debug!(partner = %partner.instance.id, %err, "discover ping failed");
                }
            }

            tokio::time::sleep(self.inner.discover_interval).await;

            let version = self.inner.partners.version();
            if version == last_version {
                quiet_rounds += 1;
            } else {
                quiet_rounds = 0;
                last_version = version;
            }
        }

        self.known_partners()
    }

    /// Issues the neighborhood query that starts the joining phase and
    /// returns the raw reply (its partner headers have already been
    /// folded into the table).
    pub async fn join(&self) -> Result<ByteArrayMessage, FederationError> {
        let headers = MessageHeaders {
            actor: Actor::FEDERATION,
            action: ACTION_NEIGHBORHOOD_QUERY.to_string(),
            ..MessageHeaders::default()
        };
        let message = Message::typed(headers, &NeighborhoodQuery { time: StopwatchTime(1) })?;
        self.route(self.inner.instance.id, message).await
    }

    /// Closes every pooled connection. The borrowed transport server is
    /// left to its owner.
    pub async fn close(&self) {
        let cached: Vec<Arc<CachedConn>> =
            self.inner.pool.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.inner.pool.clear();

        for entry in cached {
            if let Some(Ok(connection)) = entry.cell.get() {
                connection.close().await;
            }
        }
    }

    async fn vote_ping(&self, id: NodeId) -> Result<(), FederationError> {
        let headers = MessageHeaders {
            actor: Actor::FEDERATION,
            action: ACTION_VOTE_PING.to_string(),
            ..MessageHeaders::default()
        };
        self.send_one_way(id, Message { headers, ..Message::default() }).await
    }

    fn prepare(&self, message: &mut Message) {
        if message.headers.id.is_empty() {
            message.headers.id = self.inner.generator.next();
        }
        self.append_partner_info(message);
    }

    // The epidemic exchange: stamp our own info plus every live partner
    // onto the outgoing message.
    fn append_partner_info(&self, message: &mut Message) {
        let own = PartnerNodeInfo {
            instance: self.inner.instance,
            phase: self.phase(),
            address: self
                .inner
                .server
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            lease_agent_address: self.inner.lease_agent_address.clone(),
            ring_name: self.inner.ring_name.clone(),
            ..PartnerNodeInfo::default()
        };
        message
            .headers
            .append_custom(HeaderId::FEDERATION_PARTNER_NODE, FederationPartnerNodeHeader::from(own));

        for partner in self.known_partners() {
            message.headers.append_custom(
                HeaderId::FEDERATION_PARTNER_NODE,
                FederationPartnerNodeHeader::from(partner),
            );
        }
    }

    async fn connect_to_node(
        &self,
        id: NodeId,
        exact: bool,
    ) -> Result<(Connection, PartnerNodeInfo), FederationError> {
        let target = self
            .inner
            .partners
            .closest(id, self.inner.instance.id)
            .ok_or(FederationError::PartnerNotFound(id))?;

        if exact && target.instance.id != id {
            return Err(FederationError::PartnerNotFound(id));
        }

        let connection = self.get_conn(&target).await?;
        Ok((connection, target))
    }

    // One cached connection per partner address; initialization is
    // single-shot, and the entry evicts itself when the read loop exits
    // so the next call reconnects.
    async fn get_conn(&self, partner: &PartnerNodeInfo) -> Result<Connection, FederationError> {
        let address = partner.address.clone();
        let cached = {
            let entry = self
                .inner
                .pool
                .entry(address.clone())
                .or_insert_with(|| Arc::new(CachedConn { cell: OnceCell::new() }));
            Arc::clone(entry.value())
        };

        let inner = Arc::downgrade(&self.inner);
        let dial_address = address.clone();
        let result = cached
            .cell
            .get_or_init(|| async move {
                let Some(strong) = inner.upgrade() else {
                    return Err(TransportError::Closed);
                };
                let connection = (strong.dialer)(dial_address.clone()).await?;

                let weak_cb = Arc::downgrade(&strong);
                connection.set_message_callback(Arc::new(move |_conn, message| {
                    if let Some(inner) = weak_cb.upgrade() {
                        SiteNodeInner::on_message(&inner, &message);
                    }
                }));

                let runner = connection.clone();
                let weak_evict = Arc::downgrade(&strong);
                let evict_address = dial_address.clone();
                tokio::spawn(async move {
                    let _ = runner.run().await;
                    if let Some(inner) = weak_evict.upgrade() {
                        inner.pool.remove(&evict_address);
                    }
                });

                Ok(connection)
            })
            .await
            .clone();

        if result.is_err() {
            // Failed entries do not stick around; the next caller dials
            // again.
            self.inner.pool.remove(&address);
        }
        Ok(result?)
    }
}

impl SiteNodeInner {
    fn on_message(inner: &Arc<SiteNodeInner>, message: &ByteArrayMessage) {
        for header in message
            .headers
            .typed_customs::<FederationPartnerNodeHeader>(HeaderId::FEDERATION_PARTNER_NODE)
        {
            Self::update_partner(inner, &header.info);
        }

        if let Err(message) = inner.requests.feed(message.clone()) {
            tracing::trace!(actor = ?message.headers.actor, action = %message.headers.action,
                "unhandled federation message");
        }
    }

    fn update_partner(inner: &Arc<SiteNodeInner>, info: &PartnerNodeInfo) {
        let Some((accepted, is_new)) = inner.partners.update(info) else {
            return;
        };
        tracing::debug!(partner = %accepted.instance.id, new = is_new, phase = ?accepted.phase,
            "partner table updated");

        // The first routing-capable partner moves a booting node to the
        // joining phase.
        if accepted.phase == NodePhase::ROUTING && *inner.phase.borrow() == NodePhase::BOOTING {
            Self::change_phase(inner, NodePhase::JOINING);
        }
    }

    fn change_phase(inner: &Arc<SiteNodeInner>, new_phase: NodePhase) {
        inner.phase.send_if_modified(|phase| {
            if *phase == new_phase {
                false
            } else {
                *phase = new_phase;
                true
            }
        });
    }
}

weft_codec::weft_struct! {
    struct NeighborhoodQuery {
        time: StopwatchTime,
    }
}
