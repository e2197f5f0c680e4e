//! Federation wire types: node phases, point-to-point and routing
//! headers, and the partner info exchanged epidemically on every
//! federation message.

use weft_codec::{weft_newtype, weft_struct};
use weft_transport::{HeaderId, MessageId, register_header_activator};

use crate::node_id::{NodeIdRange, NodeInstance};
use crate::time::TimeSpan;
use crate::uri::Uri;

/// Lifecycle stage of a site node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct NodePhase(pub i64);

weft_newtype!(NodePhase => i64);

#[allow(missing_docs)]
impl NodePhase {
    pub const BOOTING: NodePhase = NodePhase(0);
    pub const JOINING: NodePhase = NodePhase(1);
    pub const INSERTING: NodePhase = NodePhase(2);
    pub const ROUTING: NodePhase = NodePhase(3);
    pub const SHUTDOWN: NodePhase = NodePhase(4);
}

/// Sub-actor of a point-to-point envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PToPActor(pub i64);

weft_newtype!(PToPActor => i64);

#[allow(missing_docs)]
impl PToPActor {
    pub const DIRECT: PToPActor = PToPActor(0);
    pub const FEDERATION: PToPActor = PToPActor(1);
    pub const ROUTING: PToPActor = PToPActor(2);
    pub const BROADCAST: PToPActor = PToPActor(3);
    pub const UPPER_BOUND: PToPActor = PToPActor(4);
}

weft_struct! {
    /// A claimed node-id range plus the version arbitrating ownership.
    #[derive(Copy)]
    pub struct RoutingToken {
        /// The claimed arc of the ring.
        pub range: NodeIdRange,
        /// Monotonically increasing claim version.
        pub version: u64,
    }
}

weft_struct! {
    /// Everything a site node knows about one partner.
    pub struct PartnerNodeInfo {
        /// The partner's id and incarnation.
        pub instance: NodeInstance,
        /// The partner's lifecycle phase.
        pub phase: NodePhase,
        /// Transport listener address.
        pub address: String,
        /// Routing token the partner claims.
        pub token: RoutingToken,
        /// Address of the partner's lease agent.
        pub lease_agent_address: String,
        /// Instance of the partner's lease agent.
        pub lease_agent_instance_id: i64,
        /// The partner speaks end-to-end mode.
        pub end_to_end: bool,
        /// Fault-domain id of the partner.
        pub fault_domain: Uri,
        /// Name of the ring the partner belongs to.
        pub ring_name: String,
    }
}

weft_struct! {
    /// Partner info as exchanged on the wire; flattens the info fields
    /// ahead of the trailing flags.
    pub struct FederationPartnerNodeHeader {
        flatten info: PartnerNodeInfo;
        /// Reserved flag bits.
        pub flags: i32,
    }
}

impl From<PartnerNodeInfo> for FederationPartnerNodeHeader {
    fn from(info: PartnerNodeInfo) -> Self {
        FederationPartnerNodeHeader { info, flags: 0 }
    }
}

weft_struct! {
    /// Point-to-point envelope stamped on every federation send.
    pub struct PToPHeader {
        /// Sending node instance.
        pub from: NodeInstance,
        /// Target node instance.
        pub to: NodeInstance,
        /// Point-to-point sub-actor.
        pub actor: PToPActor,
        /// Ring the sender belongs to.
        pub from_ring: String,
        /// Ring the target belongs to.
        pub to_ring: String,
        /// Delivery requires this exact target instance.
        pub exact_instance: bool,
    }
}

weft_struct! {
    /// Routing envelope for messages relayed through the ring.
    pub struct RoutingHeader {
        /// Originating node instance.
        pub from: NodeInstance,
        /// First-hop target instance.
        pub to: NodeInstance,
        /// Id of the routed message.
        pub message_id: MessageId,
        /// Deliver only to the exact target id.
        pub use_exact_routing: bool,
        /// The originator awaits a reply.
        pub expects_reply: bool,
        /// How long the message may live in the ring.
        pub expiration: TimeSpan,
        /// Per-hop retry budget.
        pub retry_timeout: TimeSpan,
    }
}

/// Registers the federation header activators with the process-wide
/// registry. Idempotent; called by site node construction.
pub fn register_federation_headers() {
    register_header_activator::<PToPHeader>(HeaderId::PTOP);
    register_header_activator::<FederationPartnerNodeHeader>(HeaderId::FEDERATION_PARTNER_NODE);
    register_header_activator::<RoutingHeader>(HeaderId::ROUTING);
}

#[cfg(test)]
mod tests {
    use weft_codec::{decode, encode};

    use super::{FederationPartnerNodeHeader, NodePhase, PartnerNodeInfo, RoutingToken};
    use crate::node_id::{NodeId, NodeIdRange, NodeInstance};

    #[test]
    fn partner_header_roundtrip() {
        let header = FederationPartnerNodeHeader {
            info: PartnerNodeInfo {
                instance: NodeInstance { id: NodeId::from_md5("p1"), instance_id: 7 },
                phase: NodePhase::ROUTING,
                address: "10.0.0.1:19000".into(),
                token: RoutingToken {
                    range: NodeIdRange { begin: NodeId(1), end: NodeId(100) },
                    version: 3,
                },
                lease_agent_address: "10.0.0.1:19001".into(),
                lease_agent_instance_id: 1,
                end_to_end: true,
                ring_name: "main".into(),
                ..PartnerNodeInfo::default()
            },
            flags: 0,
        };

        let bytes = encode(&header).unwrap();
        let back: FederationPartnerNodeHeader = decode(&bytes).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn phase_ordering_follows_lifecycle() {
        assert!(NodePhase::BOOTING < NodePhase::JOINING);
        assert!(NodePhase::JOINING < NodePhase::ROUTING);
    }
}
