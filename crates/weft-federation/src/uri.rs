//! Structured URI as carried in partner fault-domain fields.

use weft_codec::{weft_newtype, weft_struct};

/// Overall shape of a URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UriKind(pub i64);

weft_newtype!(UriKind => i64);

#[allow(missing_docs)]
impl UriKind {
    pub const AUTHORITY_AB_EMPTY: UriKind = UriKind(0);
    pub const ABSOLUTE: UriKind = UriKind(1);
    pub const ROOTLESS: UriKind = UriKind(2);
    pub const EMPTY: UriKind = UriKind(3);
}

/// Kind of host component in a URI authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UriHostKind(pub i64);

weft_newtype!(UriHostKind => i64);

#[allow(missing_docs)]
impl UriHostKind {
    pub const NONE: UriHostKind = UriHostKind(0);
    pub const IPV4: UriHostKind = UriHostKind(1);
    pub const IPV6: UriHostKind = UriHostKind(2);
    pub const REG_NAME: UriHostKind = UriHostKind(3);
}

weft_struct! {
    /// A decomposed URI, e.g. a node's fault-domain id `fd:/dc1/rack3`.
    pub struct Uri {
        /// Overall URI shape.
        pub kind: UriKind,
        /// Scheme component.
        pub scheme: String,
        /// Authority component.
        pub authority: String,
        /// Host kind within the authority.
        pub host_kind: UriHostKind,
        /// Host component.
        pub host: String,
        /// Port, zero when absent.
        pub port: i32,
        /// Path component.
        pub path: String,
        /// Query component.
        pub query: String,
        /// Fragment component.
        pub fragment: String,
        /// Path split on separators.
        pub path_segments: Vec<String>,
    }
}
