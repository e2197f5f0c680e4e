//! Site nodes exchanging partner info over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use weft_federation::{
    FederationPartnerNodeHeader, NodeId, NodeInstance, NodePhase, PartnerNodeInfo, SeedNodeInfo,
    SiteNode, SiteNodeConfig,
};
use weft_transport::{
    Actor, ClientConfig, Connection, HeaderId, Message, MessageHeaders, Server, ServerConfig,
};

async fn start_node(
    id: u128,
    instance_id: u64,
    seeds: Vec<SeedNodeInfo>,
) -> (SiteNode, String) {
    let server = Arc::new(Server::listen("127.0.0.1:0", ServerConfig::default()).await.unwrap());
    let addr = server.local_addr().unwrap().to_string();

    let node = SiteNode::new(
        Arc::clone(&server),
        SiteNodeConfig {
            instance: NodeInstance { id: NodeId(id), instance_id },
            seed_nodes: seeds,
            lease_agent_address: format!("lease-{id}"),
            discover_interval: Some(Duration::from_millis(50)),
            bootstrap_interval: Some(Duration::from_millis(100)),
            ..SiteNodeConfig::default()
        },
    )
    .unwrap();

    tokio::spawn(async move {
        let _ = server.serve().await;
    });

    (node, addr)
}

fn vote_ping() -> Message {
    Message {
        headers: MessageHeaders {
            actor: Actor::FEDERATION,
            action: "VotePing".to_string(),
            ..MessageHeaders::default()
        },
        ..Message::default()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn empty_seed_list_is_rejected() {
    let server = Arc::new(Server::listen("127.0.0.1:0", ServerConfig::default()).await.unwrap());
    let result = SiteNode::new(server, SiteNodeConfig::default());
    assert!(result.is_err());
}

#[tokio::test]
async fn partner_info_spreads_on_first_contact() {
    // Node A seeds from a dead address; node B seeds from A.
    let (node_a, addr_a) = start_node(
        100,
        1,
        vec![SeedNodeInfo { id: NodeId(1), address: "127.0.0.1:1".into() }],
    )
    .await;

    let (node_b, _addr_b) = start_node(
        200,
        1,
        vec![SeedNodeInfo { id: NodeId(100), address: addr_a }],
    )
    .await;

    // B pings its seed directly; the message carries B's own partner
    // info, so A learns about B.
    node_b.send_one_way(NodeId(100), vote_ping()).await.unwrap();

    let learned = eventually(|| {
        node_a.known_partners().iter().any(|p| p.instance.id == NodeId(200))
    })
    .await;
    assert!(learned, "node A never learned about node B");

    // B's advertised lease agent address made it across.
    let partner = node_a
        .known_partners()
        .into_iter()
        .find(|p| p.instance.id == NodeId(200))
        .unwrap();
    assert_eq!(partner.lease_agent_address, "lease-200");

    node_b.close().await;
    node_a.close().await;
}

#[tokio::test]
async fn routing_partner_moves_booting_node_to_joining() {
    let (node_b, addr_b) = start_node(
        200,
        5,
        vec![SeedNodeInfo { id: NodeId(1), address: "127.0.0.1:1".into() }],
    )
    .await;
    assert_eq!(node_b.phase(), NodePhase::BOOTING);

    // A peer announcing a routing-phase partner moves B to joining.
    let client = Connection::dial(&addr_b, ClientConfig::default()).await.unwrap();
    let mut message = vote_ping();
    message.headers.append_custom(
        HeaderId::FEDERATION_PARTNER_NODE,
        FederationPartnerNodeHeader::from(PartnerNodeInfo {
            instance: NodeInstance { id: NodeId(300), instance_id: 2 },
            phase: NodePhase::ROUTING,
            address: "127.0.0.1:1".to_string(),
            ..PartnerNodeInfo::default()
        }),
    );
    client.send_one_way(&mut message).await.unwrap();

    let joined = eventually(|| node_b.phase() >= NodePhase::JOINING).await;
    assert!(joined, "node B never advanced past booting");

    client.close().await;
    node_b.close().await;
}

#[tokio::test]
async fn bootstrap_returns_once_phase_advances() {
    let (node_b, addr_b) = start_node(
        200,
        5,
        vec![SeedNodeInfo { id: NodeId(1), address: "127.0.0.1:1".into() }],
    )
    .await;

    let bootstrapper = node_b.clone();
    let handle = tokio::spawn(async move { bootstrapper.bootstrap().await });

    // Unstick bootstrap by announcing a routing partner.
    let client = Connection::dial(&addr_b, ClientConfig::default()).await.unwrap();
    let mut message = vote_ping();
    message.headers.append_custom(
        HeaderId::FEDERATION_PARTNER_NODE,
        FederationPartnerNodeHeader::from(PartnerNodeInfo {
            instance: NodeInstance { id: NodeId(300), instance_id: 2 },
            phase: NodePhase::ROUTING,
            address: "127.0.0.1:1".to_string(),
            ..PartnerNodeInfo::default()
        }),
    );
    client.send_one_way(&mut message).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(matches!(result, Ok(Ok(Ok(())))), "bootstrap did not finish");

    client.close().await;
    node_b.close().await;
}

#[tokio::test]
async fn discover_settles_after_quiet_rounds() {
    let (node_a, addr_a) = start_node(
        100,
        1,
        vec![SeedNodeInfo { id: NodeId(1), address: "127.0.0.1:1".into() }],
    )
    .await;
    let (node_b, _addr_b) = start_node(
        200,
        1,
        vec![SeedNodeInfo { id: NodeId(100), address: addr_a }],
    )
    .await;

    // First contact teaches A about B; the return ping teaches B about
    // A's live incarnation.
    node_b.send_one_way(NodeId(100), vote_ping()).await.unwrap();
    let learned = eventually(|| {
        node_a.known_partners().iter().any(|p| p.instance.id == NodeId(200))
    })
    .await;
    assert!(learned);
    node_a.send_one_way(NodeId(200), vote_ping()).await.unwrap();

    let partners = tokio::time::timeout(Duration::from_secs(10), node_b.discover())
        .await
        .unwrap();
    assert!(partners.iter().any(|p| p.instance.id == NodeId(100)));

    node_b.close().await;
    node_a.close().await;
}
