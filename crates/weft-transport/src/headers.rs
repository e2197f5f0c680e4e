//! Message headers: the TLV wire format, the well-known typed slots and
//! the extensible custom-header bag.
//!
//! Headers are a concatenation of `u16 id / u16 length / payload`
//! records; each payload is itself a structured-serializer value.
//! Parsing is tolerant: unknown ids are kept as raw bytes, and ids with
//! a registered activator are decoded into typed instances.

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use parking_lot::RwLock;
use weft_codec::{CodecError, FabricValue, weft_newtype, weft_struct};

use crate::error::TransportError;
use crate::message::MessageId;

/// A header record id. Well-known ids live in the 0x8000–0x8FFF range;
/// unknown ids are carried opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HeaderId(pub u16);

#[rustfmt::skip]
#[allow(missing_docs)]
impl HeaderId {
    pub const INVALID: HeaderId = HeaderId(0x8000);

    // Transport level headers.
    pub const ACTOR: HeaderId = HeaderId(0x8001);
    pub const ACTION: HeaderId = HeaderId(0x8002);
    pub const MESSAGE_ID: HeaderId = HeaderId(0x8003);
    pub const RELATES_TO: HeaderId = HeaderId(0x8004);
    pub const EXPECTS_REPLY: HeaderId = HeaderId(0x8005);
    pub const RETRY: HeaderId = HeaderId(0x8006);
    pub const FAULT: HeaderId = HeaderId(0x8007);
    pub const IDEMPOTENT: HeaderId = HeaderId(0x8008);
    pub const HIGH_PRIORITY: HeaderId = HeaderId(0x8009);
    pub const RE_FROM: HeaderId = HeaderId(0x800A);
    pub const IPC: HeaderId = HeaderId(0x800B);

    // Federation protocol headers.
    pub const FEDERATION_PARTNER_NODE: HeaderId = HeaderId(0x800C);
    pub const FEDERATION_NEIGHBORHOOD_RANGE: HeaderId = HeaderId(0x800D);
    pub const FEDERATION_NEIGHBORHOOD_VERSION: HeaderId = HeaderId(0x800E);
    pub const FEDERATION_ROUTING_TOKEN: HeaderId = HeaderId(0x800F);
    pub const ROUTING: HeaderId = HeaderId(0x8010);
    pub const FEDERATION_TRACE_PROBE: HeaderId = HeaderId(0x8011);
    pub const FEDERATION_TOKEN_ECHO: HeaderId = HeaderId(0x8012);

    // Point-to-point headers.
    pub const PTOP: HeaderId = HeaderId(0x8013);

    // Broadcast headers.
    pub const BROADCAST: HeaderId = HeaderId(0x8014);
    pub const BROADCAST_RANGE: HeaderId = HeaderId(0x8015);
    pub const BROADCAST_RELATES_TO: HeaderId = HeaderId(0x8016);
    pub const BROADCAST_STEP: HeaderId = HeaderId(0x8017);

    // Reliability.
    pub const GENERATION: HeaderId = HeaderId(0x8018);

    // Replication.
    pub const REPLICATION_ACTOR: HeaderId = HeaderId(0x8019);
    pub const REPLICATION_OPERATION: HeaderId = HeaderId(0x801A);
    pub const COPY_OPERATION: HeaderId = HeaderId(0x801B);
    pub const COMPLETED_LSN: HeaderId = HeaderId(0x801C);
    pub const COPY_CONTEXT_OPERATION: HeaderId = HeaderId(0x801D);
    pub const OPERATION_ACK: HeaderId = HeaderId(0x801E);
    pub const OPERATION_ERROR: HeaderId = HeaderId(0x801F);

    // System services (common).
    pub const FABRIC_ACTIVITY: HeaderId = HeaderId(0x8020);
    pub const REQUEST_INSTANCE: HeaderId = HeaderId(0x8021);
    pub const SYSTEM_SERVICE_FILTER: HeaderId = HeaderId(0x8022);
    pub const TIMEOUT: HeaderId = HeaderId(0x8023);

    // Naming service.
    pub const CACHE_MODE: HeaderId = HeaderId(0x8024);
    pub const CLIENT_PROTOCOL_VERSION: HeaderId = HeaderId(0x8025);
    pub const GATEWAY_RETRY: HeaderId = HeaderId(0x8026);
    pub const PRIMARY_RECOVERY: HeaderId = HeaderId(0x8027);

    // Cluster manager service.
    pub const FORWARD_MESSAGE: HeaderId = HeaderId(0x8028);

    // Security headers.
    pub const MESSAGE_SECURITY: HeaderId = HeaderId(0x8029);

    pub const QUERY_ADDRESS: HeaderId = HeaderId(0x802A);
    pub const FABRIC_CODE_VERSION: HeaderId = HeaderId(0x802B);
    pub const SERVICE_ROUTING_AGENT: HeaderId = HeaderId(0x802C);
    pub const SERVICE_ROUTING_AGENT_PROXY: HeaderId = HeaderId(0x802D);

    // Reliable messaging.
    pub const RELIABLE_MESSAGING_SESSION: HeaderId = HeaderId(0x802E);
    pub const RELIABLE_MESSAGING_SOURCE: HeaderId = HeaderId(0x802F);
    pub const RELIABLE_MESSAGING_TARGET: HeaderId = HeaderId(0x8030);
    pub const RELIABLE_MESSAGING_PROTOCOL_RESPONSE: HeaderId = HeaderId(0x8031);
    pub const RELIABLE_MESSAGING_SESSION_PARAMS: HeaderId = HeaderId(0x8032);

    pub const DELETE_NAME: HeaderId = HeaderId(0x8033);
    pub const PARTITION_TARGET: HeaderId = HeaderId(0x8034);
    pub const CUSTOM_CLIENT_AUTH: HeaderId = HeaderId(0x8035);
    pub const NAMING_PROPERTY: HeaderId = HeaderId(0x8036);
    pub const SECONDARY_LOCATIONS: HeaderId = HeaderId(0x8037);
    pub const CLIENT_ROLE: HeaderId = HeaderId(0x8038);
    pub const MULTICAST: HeaderId = HeaderId(0x8039);
    pub const MULTICAST_TARGETS: HeaderId = HeaderId(0x803A);
    pub const FILE_UPLOAD_REQUEST: HeaderId = HeaderId(0x803B);
    pub const FILE_SEQUENCE: HeaderId = HeaderId(0x803C);
    pub const SERVICE_TARGET: HeaderId = HeaderId(0x803D);
    pub const UNCORRELATED_REPLY: HeaderId = HeaderId(0x803E);
    pub const SERVICE_DIRECT_MESSAGING: HeaderId = HeaderId(0x803F);
    pub const CLIENT_IDENTITY: HeaderId = HeaderId(0x8040);
    pub const SERVER_AUTH: HeaderId = HeaderId(0x8041);
    pub const GLOBAL_TIME_EXCHANGE: HeaderId = HeaderId(0x8041);
    pub const VOTER_STORE: HeaderId = HeaderId(0x8042);

    // Service TCP communication.
    pub const SERVICE_LOCATION_ACTOR: HeaderId = HeaderId(0x8043);
    pub const TCP_SERVICE_MESSAGE: HeaderId = HeaderId(0x8044);
    pub const TCP_CLIENT_ID: HeaderId = HeaderId(0x8045);
    pub const SERVICE_COMMUNICATION_ERROR: HeaderId = HeaderId(0x8046);
    pub const IS_ASYNC_OPERATION: HeaderId = HeaderId(0x8047);

    pub const SECURITY_NEGOTIATION: HeaderId = HeaderId(0x8048);
    pub const JOIN_THROTTLE: HeaderId = HeaderId(0x8049);
    pub const REPLICATION_OPERATION_BODY: HeaderId = HeaderId(0x804A);
    pub const CREATE_COMPOSE_DEPLOYMENT_REQUEST: HeaderId = HeaderId(0x804B);
    pub const FABRIC_TRANSPORT_MESSAGE: HeaderId = HeaderId(0x804C);
    pub const UPGRADE_COMPOSE_DEPLOYMENT_REQUEST: HeaderId = HeaderId(0x804D);
    pub const CREATE_VOLUME_REQUEST: HeaderId = HeaderId(0x804E);
    pub const FILE_UPLOAD_CREATE_REQUEST: HeaderId = HeaderId(0x804F);
    pub const FILE_TRANSFER_TRANSPORT_DOWNLOAD: HeaderId = HeaderId(0x8050);
    pub const FILE_TRANSFER_TRANSPORT_UPLOAD: HeaderId = HeaderId(0x8051);
    pub const FILE_TRANSFER_TRANSPORT_ERROR: HeaderId = HeaderId(0x8052);
    pub const FEDERATION_FORWARD_MESSAGING: HeaderId = HeaderId(0x8053);
    pub const FEDERATION_AGENT_REQUEST: HeaderId = HeaderId(0x8054);
    pub const SYSTEM_SERVICE_TCP: HeaderId = HeaderId(0x8055);
    pub const TRANSPORT_ROUTING: HeaderId = HeaderId(0x8056);
}

/// Top-level routing label identifying which subsystem handles a
/// message. Carried as a signed 64-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Actor(pub i64);

weft_newtype!(Actor => i64);

#[rustfmt::skip]
#[allow(missing_docs)]
impl Actor {
    pub const EMPTY: Actor = Actor(0);
    pub const TRANSPORT: Actor = Actor(1);
    pub const FEDERATION: Actor = Actor(2);
    pub const ROUTING: Actor = Actor(3);
    pub const CM: Actor = Actor(4);
    pub const NAMING_GATEWAY: Actor = Actor(5);
    pub const NAMING_STORE_SERVICE: Actor = Actor(6);
    pub const APPLICATION_HOST_MANAGER: Actor = Actor(7);
    pub const APPLICATION_HOST: Actor = Actor(8);
    pub const FABRIC_RUNTIME_MANAGER: Actor = Actor(9);
    pub const FMM: Actor = Actor(10);
    pub const FM: Actor = Actor(11);
    pub const RA: Actor = Actor(12);
    pub const RS: Actor = Actor(13);
    pub const SERVICE_RESOLVER: Actor = Actor(14);
    pub const HOSTING: Actor = Actor(15);
    pub const HM: Actor = Actor(16);
    pub const SERVICE_ROUTING_AGENT: Actor = Actor(17);
    pub const IS: Actor = Actor(18);
    pub const FABRIC_ACTIVATOR: Actor = Actor(19);
    pub const FABRIC_ACTIVATOR_CLIENT: Actor = Actor(20);
    pub const IPC: Actor = Actor(21);
    pub const FILE_STORE_SERVICE: Actor = Actor(22);
    pub const TVS: Actor = Actor(23);
    pub const RM: Actor = Actor(24);
    pub const FILE_SENDER: Actor = Actor(25);
    pub const FILE_RECEIVER: Actor = Actor(26);
    pub const FILE_TRANSFER_CLIENT: Actor = Actor(27);
    pub const FILE_TRANSFER_GATEWAY: Actor = Actor(28);
    pub const TRANSPORT_SEND_TARGET: Actor = Actor(29);
    pub const ENTREE_SERVICE_PROXY: Actor = Actor(30);
    pub const ENTREE_SERVICE_TRANSPORT: Actor = Actor(31);
    pub const HOSTED_SERVICE_ACTIVATOR: Actor = Actor(32);
    pub const NM: Actor = Actor(33);
    pub const DIRECT_MESSAGING_AGENT: Actor = Actor(34);
    pub const SECURITY_CONTEXT: Actor = Actor(35);
    pub const SERVICE_COMMUNICATION: Actor = Actor(36);
    pub const RESTART_MANAGER: Actor = Actor(37);
    pub const RESTART_MANAGER_CLIENT: Actor = Actor(38);
    pub const FAS: Actor = Actor(39);
    pub const TESTABILITY_SUBSYSTEM: Actor = Actor(40);
    pub const UOS: Actor = Actor(41);
    pub const BA: Actor = Actor(42);
    pub const BRS: Actor = Actor(43);
    pub const BAP: Actor = Actor(44);
    pub const CONTAINER_ACTIVATOR_SERVICE: Actor = Actor(45);
    pub const CONTAINER_ACTIVATOR_SERVICE_CLIENT: Actor = Actor(46);
    pub const RESOURCE_MONITOR: Actor = Actor(47);
    pub const CSS: Actor = Actor(48);
    pub const NETWORK_INVENTORY_SERVICE: Actor = Actor(49);
    pub const NETWORK_INVENTORY_AGENT: Actor = Actor(50);
    pub const GATEWAY_RESOURCE_MANAGER: Actor = Actor(51);
    pub const FEDERATION_AGENT: Actor = Actor(54);
    pub const FEDERATION_PROXY: Actor = Actor(55);
    pub const SYSTEM_SERVICE_TCP_CONNECTION: Actor = Actor(56);
    pub const NAMING_GATEWAY_SERVICE: Actor = Actor(57);
    pub const SYSTEM_SERVICE_CONFIG_SETTING: Actor = Actor(58);
    pub const SYSTEM_CACHE: Actor = Actor(59);

    // Test range.
    pub const WINDOWS_FABRIC_TEST_API: Actor = Actor(0xFFFF);
    pub const GENERIC_TEST_ACTOR: Actor = Actor(0x10000);
    pub const GENERIC_TEST_ACTOR2: Actor = Actor(0x10001);
    pub const DISTRIBUTED_SESSION: Actor = Actor(0x10002);
    pub const IPC_TEST_ACTOR1: Actor = Actor(0x10003);
    pub const IPC_TEST_ACTOR2: Actor = Actor(0x10004);
}

/// Error code surface carried in fault headers. `SUCCESS` is the only
/// value the transport interprets; any other value on a reply is
/// propagated to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(pub u32);

weft_newtype!(ErrorCode => u32);

impl ErrorCode {
    /// The success code.
    pub const SUCCESS: ErrorCode = ErrorCode(0);

    /// True unless this is `SUCCESS`.
    pub fn is_failure(self) -> bool {
        self != ErrorCode::SUCCESS
    }
}

weft_struct! {
    struct ActorHeader {
        actor: Actor,
    }
}

weft_struct! {
    struct ActionHeader {
        action: String,
    }
}

weft_struct! {
    struct ExpectsReplyHeader {
        expects_reply: bool,
    }
}

weft_struct! {
    struct HighPriorityHeader {
        high_priority: bool,
    }
}

weft_struct! {
    struct IdempotentHeader {
        idempotent: bool,
    }
}

weft_struct! {
    struct FaultHeader {
        error_code: ErrorCode,
        has_fault_body: bool,
    }
}

weft_struct! {
    struct RetryHeader {
        retry_count: i32,
    }
}

weft_struct! {
    /// The listen-side identity carried inside a security negotiation.
    pub struct ListenInstance {
        /// Listener address of the sending side.
        pub address: String,
        /// Listener instance number.
        pub instance: u64,
        /// Connection nonce.
        pub nonce: weft_codec::Guid,
        /// Whether the sender answers heartbeats.
        pub heartbeat_supported: bool,
        /// Connection feature flag bits.
        pub connection_feature_flags: u32,
    }
}

weft_struct! {
    /// Security negotiation header sent with the first tunnelled TLS
    /// record.
    pub struct SecurityNegotiationHeader {
        /// The TLS records are wrapped in transport frames.
        pub x509_extra_framing_enabled: bool,
        /// Frame-level protection stays on for the negotiation.
        pub framing_protection_enabled: bool,
        /// Identity of the negotiating listener.
        pub listen_instance: ListenInstance,
        /// Largest frame the sender will accept.
        pub max_incoming_frame_size: u64,
    }
}

/// A typed custom-header payload: anything the structured serializer
/// can encode.
pub trait HeaderValue: std::fmt::Debug + Send + Sync + 'static {
    /// Serializes the payload to its wire form.
    fn encode_payload(&self) -> Result<Vec<u8>, CodecError>;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl<T> HeaderValue for T
where
    T: FabricValue + std::fmt::Debug + Send + Sync + 'static,
{
    fn encode_payload(&self) -> Result<Vec<u8>, CodecError> {
        weft_codec::encode(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One decoded custom header instance.
#[derive(Debug, Clone)]
pub enum CustomHeader {
    /// Decoded by a registered activator.
    Typed(Arc<dyn HeaderValue>),
    /// No activator registered; raw payload bytes.
    Raw(Bytes),
}

impl CustomHeader {
    /// The payload as `T`, if this instance was decoded as one.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            CustomHeader::Typed(value) => value.as_any().downcast_ref(),
            CustomHeader::Raw(_) => None,
        }
    }
}

type Activator = fn(&[u8]) -> Result<Arc<dyn HeaderValue>, CodecError>;

// The transport's own custom header is pre-registered; everything else
// comes from the layers above at startup.
static ACTIVATORS: LazyLock<RwLock<HashMap<HeaderId, Activator>>> = LazyLock::new(|| {
    let mut activators: HashMap<HeaderId, Activator> = HashMap::new();
    activators.insert(HeaderId::SECURITY_NEGOTIATION, activate::<SecurityNegotiationHeader>);
    RwLock::new(activators)
});

fn activate<T>(payload: &[u8]) -> Result<Arc<dyn HeaderValue>, CodecError>
where
    T: FabricValue + std::fmt::Debug + Send + Sync + 'static,
{
    Ok(Arc::new(weft_codec::decode::<T>(payload)?))
}

/// Registers the decoder used for custom headers with the given id.
///
/// The registry is process-wide; registering the same id again replaces
/// the previous activator (last writer wins). Intended to be called at
/// program startup.
pub fn register_header_activator<T>(id: HeaderId)
where
    T: FabricValue + std::fmt::Debug + Send + Sync + 'static,
{
    ACTIVATORS.write().insert(id, activate::<T>);
}

fn lookup_activator(id: HeaderId) -> Option<Activator> {
    ACTIVATORS.read().get(&id).copied()
}

/// The header bag attached to every message.
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders {
    /// Unique id of this message.
    pub id: MessageId,
    /// Id of the request this message replies to.
    pub relates_to: MessageId,
    /// Routing actor.
    pub actor: Actor,
    /// Operation label within the actor.
    pub action: String,
    /// The sender awaits a correlated reply.
    pub expects_reply: bool,
    /// Delivery ahead of normal-priority traffic.
    pub high_priority: bool,
    /// Safe to retry without side effects.
    pub idempotent: bool,
    /// Error code from the fault header.
    pub error_code: ErrorCode,
    /// The body carries a fault payload.
    pub has_fault_body: bool,
    /// Retry attempt counter.
    pub retry_count: i32,

    /// Custom headers, keyed by header id in wire order.
    pub custom: BTreeMap<HeaderId, Vec<CustomHeader>>,
}

impl MessageHeaders {
    /// All custom header instances recorded under `id`.
    pub fn custom_headers(&self, id: HeaderId) -> &[CustomHeader] {
        self.custom.get(&id).map_or(&[], Vec::as_slice)
    }

    /// The first custom header under `id` decoded as `T`.
    pub fn first_custom<T: 'static>(&self, id: HeaderId) -> Option<&T> {
        self.custom_headers(id).iter().find_map(CustomHeader::downcast_ref)
    }

    /// All custom headers under `id` decoded as `T`, in wire order.
    pub fn typed_customs<T: 'static>(&self, id: HeaderId) -> impl Iterator<Item = &T> {
        self.custom_headers(id).iter().filter_map(CustomHeader::downcast_ref)
    }

    /// Sets a custom header only if `id` is not present yet. Returns
    /// whether the header was stored.
    pub fn set_custom<T: HeaderValue>(&mut self, id: HeaderId, header: T) -> bool {
        if self.custom.contains_key(&id) {
            return false;
        }
        self.custom.insert(id, vec![CustomHeader::Typed(Arc::new(header))]);
        true
    }

    /// Appends a custom header instance under `id`. Multiple instances
    /// of one id are allowed and their order is preserved.
    pub fn append_custom<T: HeaderValue>(&mut self, id: HeaderId, header: T) {
        self.custom.entry(id).or_default().push(CustomHeader::Typed(Arc::new(header)));
    }

    /// Serializes the headers in their mandated write order.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), TransportError> {
        write_record(out, HeaderId::MESSAGE_ID, &weft_codec::encode(&self.id)?)?;

        if !self.relates_to.is_empty() {
            write_record(out, HeaderId::RELATES_TO, &weft_codec::encode(&self.relates_to)?)?;
        }

        write_record(
            out,
            HeaderId::ACTOR,
            &weft_codec::encode(&ActorHeader { actor: self.actor })?,
        )?;

        if !self.action.is_empty() {
            write_record(
                out,
                HeaderId::ACTION,
                &weft_codec::encode(&ActionHeader { action: self.action.clone() })?,
            )?;
        }
        if self.expects_reply {
            write_record(
                out,
                HeaderId::EXPECTS_REPLY,
                &weft_codec::encode(&ExpectsReplyHeader { expects_reply: true })?,
            )?;
        }
        if self.high_priority {
            write_record(
                out,
                HeaderId::HIGH_PRIORITY,
                &weft_codec::encode(&HighPriorityHeader { high_priority: true })?,
            )?;
        }
        if self.idempotent {
            write_record(
                out,
                HeaderId::IDEMPOTENT,
                &weft_codec::encode(&IdempotentHeader { idempotent: true })?,
            )?;
        }
        if self.error_code.is_failure() || self.has_fault_body {
            write_record(
                out,
                HeaderId::FAULT,
                &weft_codec::encode(&FaultHeader {
                    error_code: self.error_code,
                    has_fault_body: self.has_fault_body,
                })?,
            )?;
        }
        if self.retry_count > 0 {
            write_record(
                out,
                HeaderId::RETRY,
                &weft_codec::encode(&RetryHeader { retry_count: self.retry_count })?,
            )?;
        }

        for (id, instances) in &self.custom {
            for instance in instances {
                match instance {
                    CustomHeader::Typed(value) => {
                        write_record(out, *id, &value.encode_payload()?)?;
                    }
                    CustomHeader::Raw(bytes) => write_record(out, *id, bytes)?,
                }
            }
        }

        Ok(())
    }

    /// Parses a headers byte run into a bag.
    pub fn parse(data: &[u8]) -> Result<MessageHeaders, TransportError> {
        let mut headers = MessageHeaders::default();
        let mut input = data;

        while !input.is_empty() {
            let (id, payload, rest) = next_record(input)?;
            input = rest;

            if id == HeaderId::INVALID {
                continue;
            }

            match id {
                HeaderId::MESSAGE_ID => headers.id = weft_codec::decode(payload)?,
                HeaderId::RELATES_TO => headers.relates_to = weft_codec::decode(payload)?,
                HeaderId::ACTOR => {
                    headers.actor = weft_codec::decode::<ActorHeader>(payload)?.actor;
                }
                HeaderId::ACTION => {
                    headers.action = weft_codec::decode::<ActionHeader>(payload)?.action;
                }
                HeaderId::EXPECTS_REPLY => {
                    headers.expects_reply =
                        weft_codec::decode::<ExpectsReplyHeader>(payload)?.expects_reply;
                }
                HeaderId::HIGH_PRIORITY => {
                    headers.high_priority =
                        weft_codec::decode::<HighPriorityHeader>(payload)?.high_priority;
                }
                HeaderId::IDEMPOTENT => {
                    headers.idempotent =
                        weft_codec::decode::<IdempotentHeader>(payload)?.idempotent;
                }
                HeaderId::FAULT => {
                    let fault = weft_codec::decode::<FaultHeader>(payload)?;
                    headers.error_code = fault.error_code;
                    headers.has_fault_body = fault.has_fault_body;
                }
                HeaderId::RETRY => {
                    headers.retry_count = weft_codec::decode::<RetryHeader>(payload)?.retry_count;
                }
                _ => {
                    let instance = match lookup_activator(id) {
                        Some(activator) => CustomHeader::Typed(activator(payload)?),
                        None => CustomHeader::Raw(Bytes::copy_from_slice(payload)),
                    };
                    headers.custom.entry(id).or_default().push(instance);
                }
            }
        }

        Ok(headers)
    }
}

fn write_record(out: &mut Vec<u8>, id: HeaderId, payload: &[u8]) -> Result<(), TransportError> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        TransportError::Format(format!("header {:#06x} payload exceeds u16 length", id.0))
    })?;
    out.extend_from_slice(&id.0.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

fn next_record(input: &[u8]) -> Result<(HeaderId, &[u8], &[u8]), TransportError> {
    if input.len() < 4 {
        return Err(TransportError::Format("truncated header record".into()));
    }
    let id = HeaderId(u16::from_le_bytes([input[0], input[1]]));
    let len = usize::from(u16::from_le_bytes([input[2], input[3]]));
    let rest = &input[4..];
    if rest.len() < len {
        return Err(TransportError::Format("truncated header payload".into()));
    }
    Ok((id, &rest[..len], &rest[len..]))
}

#[cfg(test)]
mod tests {
    use weft_codec::weft_struct;

    use super::{Actor, ErrorCode, HeaderId, MessageHeaders, register_header_activator};
    use crate::message::{MessageId, MessageIdGenerator};

    weft_struct! {
        struct TimeoutHeader {
            timeout_ticks: i64,
        }
    }

    #[test]
    fn roundtrip_all_well_known_slots() {
        let generator = MessageIdGenerator::new();
        let mut headers = MessageHeaders {
            id: generator.next(),
            relates_to: generator.next(),
            actor: Actor::GENERIC_TEST_ACTOR2,
            action: "AC".to_string(),
            expects_reply: true,
            high_priority: true,
            idempotent: true,
            error_code: ErrorCode(100),
            has_fault_body: true,
            retry_count: 4567,
            ..MessageHeaders::default()
        };
        register_header_activator::<TimeoutHeader>(HeaderId::TIMEOUT);
        headers.set_custom(HeaderId::TIMEOUT, TimeoutHeader { timeout_ticks: 200_000_000 });

        let mut wire = Vec::new();
        headers.write_to(&mut wire).unwrap();
        let parsed = MessageHeaders::parse(&wire).unwrap();

        assert_eq!(parsed.id, headers.id);
        assert_eq!(parsed.relates_to, headers.relates_to);
        assert_eq!(parsed.actor, headers.actor);
        assert_eq!(parsed.action, headers.action);
        assert!(parsed.expects_reply);
        assert!(parsed.high_priority);
        assert!(parsed.idempotent);
        assert_eq!(parsed.error_code, ErrorCode(100));
        assert!(parsed.has_fault_body);
        assert_eq!(parsed.retry_count, 4567);

        let timeout: &TimeoutHeader = parsed.first_custom(HeaderId::TIMEOUT).unwrap();
        assert_eq!(timeout.timeout_ticks, 200_000_000);
        assert!(parsed.first_custom::<TimeoutHeader>(HeaderId::CUSTOM_CLIENT_AUTH).is_none());
    }

    #[test]
    fn unknown_ids_survive_as_raw_bytes() {
        let headers = MessageHeaders::default();
        let mut wire = Vec::new();
        headers.write_to(&mut wire).unwrap();

        // Append an unregistered record by hand.
        wire.extend_from_slice(&0x8FFFu16.to_le_bytes());
        wire.extend_from_slice(&3u16.to_le_bytes());
        wire.extend_from_slice(&[9, 9, 9]);

        let parsed = MessageHeaders::parse(&wire).unwrap();
        let raw = parsed.custom_headers(HeaderId(0x8FFF));
        assert_eq!(raw.len(), 1);
        assert!(raw[0].downcast_ref::<MessageId>().is_none());
    }

    #[test]
    fn write_order_starts_with_id_relates_to_actor() {
        let generator = MessageIdGenerator::new();
        let headers = MessageHeaders {
            id: generator.next(),
            relates_to: generator.next(),
            actor: Actor::TRANSPORT,
            action: "A".to_string(),
            ..MessageHeaders::default()
        };

        let mut wire = Vec::new();
        headers.write_to(&mut wire).unwrap();

        let mut record_ids = Vec::new();
        let mut rest = &wire[..];
        while !rest.is_empty() {
            let id = u16::from_le_bytes([rest[0], rest[1]]);
            let len = usize::from(u16::from_le_bytes([rest[2], rest[3]]));
            record_ids.push(HeaderId(id));
            rest = &rest[4 + len..];
        }

        assert_eq!(
            record_ids,
            [HeaderId::MESSAGE_ID, HeaderId::RELATES_TO, HeaderId::ACTOR, HeaderId::ACTION]
        );
    }

    #[test]
    fn relates_to_is_elided_when_empty() {
        let headers = MessageHeaders::default();
        let mut wire = Vec::new();
        headers.write_to(&mut wire).unwrap();

        let parsed = MessageHeaders::parse(&wire).unwrap();
        assert!(parsed.relates_to.is_empty());
        // Only MessageId and Actor records are present.
        assert_eq!(u16::from_le_bytes([wire[0], wire[1]]), HeaderId::MESSAGE_ID.0);
    }

    #[test]
    fn truncated_record_is_a_format_error() {
        let mut wire = Vec::new();
        MessageHeaders::default().write_to(&mut wire).unwrap();
        wire.truncate(wire.len() - 1);
        assert!(MessageHeaders::parse(&wire).is_err());
    }

    #[test]
    fn repeated_custom_ids_preserve_order() {
        register_header_activator::<TimeoutHeader>(HeaderId::TIMEOUT);
        let mut headers = MessageHeaders::default();
        for ticks in [1i64, 2, 3] {
            headers.append_custom(HeaderId::TIMEOUT, TimeoutHeader { timeout_ticks: ticks });
        }

        let mut wire = Vec::new();
        headers.write_to(&mut wire).unwrap();
        let parsed = MessageHeaders::parse(&wire).unwrap();

        let ticks: Vec<i64> = parsed
            .typed_customs::<TimeoutHeader>(HeaderId::TIMEOUT)
            .map(|h| h.timeout_ticks)
            .collect();
        assert_eq!(ticks, [1, 2, 3]);
    }
}
