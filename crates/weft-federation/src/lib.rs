//! Federation ring overlay.
//!
//! A [`SiteNode`] sits on top of a transport server and a pool of
//! client connections, maintains a partner table fed by the epidemic
//! partner-info exchange, routes messages to the ring-closest partner,
//! and walks the Booting → Joining lifecycle by vote-pinging its seed
//! nodes.

pub mod error;
pub mod node_id;
mod partner_table;
pub mod proto;
pub mod site_node;
pub mod time;
pub mod uri;

pub use error::FederationError;
pub use node_id::{NodeId, NodeIdRange, NodeInstance};
pub use proto::{
    FederationPartnerNodeHeader, NodePhase, PToPActor, PToPHeader, PartnerNodeInfo,
    RoutingHeader, RoutingToken, register_federation_headers,
};
pub use site_node::{Dialer, SeedNodeInfo, SiteNode, SiteNodeConfig};
pub use time::{DateTime, StopwatchTime, TimeSpan};
pub use uri::{Uri, UriHostKind, UriKind};
