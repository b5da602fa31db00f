//! Wire types for virtual services and real servers.
//!
//! Records are prost messages with stable field numbers so that state written
//! by one daemon version stays readable by another. The types are implemented
//! directly in Rust with prost derives rather than generated from protobuf
//! definitions; the field numbers noted on each message are the wire
//! contract.
//!
//! Optional scalars that must distinguish "not set" from "set to zero" are
//! wrapper sub-messages ([`UInt32Value`] / [`StringValue`], byte-compatible
//! with the protobuf well-known wrapper types). Enumerations reserve 0 for
//! "unset" so a missing value is detectable on the wire.

pub mod merge;
pub mod validate;

use prost::Message;
use std::fmt;

/// Transport protocol of a virtual service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum Protocol {
    Unset = 0,
    Tcp = 1,
    Udp = 2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// How the kernel forwards packets to a real server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ForwardMethod {
    Unset = 0,
    /// Direct routing.
    Route = 1,
    /// IP-in-IP tunnel.
    Tunnel = 2,
    /// Source NAT.
    Masq = 3,
}

impl fmt::Display for ForwardMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Route => write!(f, "route"),
            Self::Tunnel => write!(f, "tunnel"),
            Self::Masq => write!(f, "masq"),
        }
    }
}

/// Presence-carrying unsigned 32-bit scalar, wire-compatible with
/// `google.protobuf.UInt32Value`: a sub-message whose `value` sits at tag 1.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Message)]
pub struct UInt32Value {
    #[prost(uint32, tag = "1")]
    pub value: u32,
}

impl UInt32Value {
    pub fn new(value: u32) -> Self {
        Self { value }
    }
}

/// Presence-carrying string, wire-compatible with
/// `google.protobuf.StringValue`.
#[derive(Clone, PartialEq, Message)]
pub struct StringValue {
    #[prost(string, tag = "1")]
    pub value: String,
}

impl StringValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Identity of a virtual service in the kernel: `(ip, port, protocol)`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Message)]
pub struct VirtualServiceKey {
    /// IPv4 dotted-quad address.
    #[prost(string, tag = "1")]
    pub ip: String,
    /// Port in [1, 65535].
    #[prost(uint32, tag = "2")]
    pub port: u32,
    /// Transport protocol.
    #[prost(enumeration = "Protocol", tag = "3")]
    pub protocol: i32,
}

impl VirtualServiceKey {
    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::try_from(self.protocol).ok().filter(|p| *p != Protocol::Unset)
    }
}

impl fmt::Display for VirtualServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = self
            .protocol()
            .map(|p| p.to_string())
            .unwrap_or_else(|| format!("protocol({})", self.protocol));
        write!(f, "{}:{}/{}", self.ip, self.port, protocol)
    }
}

/// Scheduling configuration of a virtual service.
#[derive(Clone, PartialEq, Message)]
pub struct VirtualServiceConfig {
    /// Kernel scheduling algorithm name (e.g. `rr`, `wrr`, `sh`).
    /// Opaque at this layer.
    #[prost(string, tag = "1")]
    pub scheduler: String,
    /// Scheduler flag names (e.g. `flag-1`, `sh-port`).
    #[prost(string, repeated, tag = "2")]
    pub flags: Vec<String>,
    /// Client-affinity persistence window in seconds. Wrapper field:
    /// absent means "not persistent", zero is an explicit value.
    #[prost(message, optional, tag = "3")]
    pub persistence_timeout: Option<UInt32Value>,
}

impl VirtualServiceConfig {
    pub fn persistence_timeout(&self) -> Option<u32> {
        self.persistence_timeout.map(|t| t.value)
    }
}

/// Opaque health-check declaration, carried through but never interpreted
/// by this daemon.
#[derive(Clone, PartialEq, Message)]
pub struct HealthCheck {
    #[prost(message, optional, tag = "1")]
    pub endpoint: Option<StringValue>,
    #[prost(uint32, tag = "2")]
    pub period_seconds: u32,
    #[prost(uint32, tag = "3")]
    pub timeout_seconds: u32,
    #[prost(uint32, tag = "4")]
    pub up_threshold: u32,
    #[prost(uint32, tag = "5")]
    pub down_threshold: u32,
}

impl HealthCheck {
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_ref().map(|e| e.value.as_str())
    }
}

/// A front-end endpoint presented to clients of the load balancer.
#[derive(Clone, PartialEq, Message)]
pub struct VirtualService {
    /// Client-assigned opaque identifier, unique across services.
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub key: Option<VirtualServiceKey>,
    #[prost(message, optional, tag = "3")]
    pub config: Option<VirtualServiceConfig>,
    #[prost(message, optional, tag = "4")]
    pub health_check: Option<HealthCheck>,
}

/// Identity of a real server within its parent service: `(ip, port)`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Message)]
pub struct RealServerKey {
    /// IPv4 dotted-quad address.
    #[prost(string, tag = "1")]
    pub ip: String,
    /// Port in [1, 65535].
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

impl fmt::Display for RealServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Forwarding configuration of a real server.
#[derive(Clone, PartialEq, Message)]
pub struct RealServerConfig {
    /// Scheduling weight. Wrapper field: required at create time, and zero
    /// is a valid value meaning "drained, no new connections".
    #[prost(message, optional, tag = "1")]
    pub weight: Option<UInt32Value>,
    /// Packet forwarding method.
    #[prost(enumeration = "ForwardMethod", tag = "2")]
    pub forward: i32,
}

impl RealServerConfig {
    pub fn weight(&self) -> Option<u32> {
        self.weight.map(|w| w.value)
    }

    pub fn forward(&self) -> Option<ForwardMethod> {
        ForwardMethod::try_from(self.forward)
            .ok()
            .filter(|f| *f != ForwardMethod::Unset)
    }
}

/// A backend bound to exactly one virtual service.
#[derive(Clone, PartialEq, Message)]
pub struct RealServer {
    /// `id` of the parent virtual service.
    #[prost(string, tag = "1")]
    pub service_id: String,
    #[prost(message, optional, tag = "2")]
    pub key: Option<RealServerKey>,
    #[prost(message, optional, tag = "3")]
    pub config: Option<RealServerConfig>,
}

// RPC envelope messages.

#[derive(Clone, PartialEq, Message)]
pub struct Empty {}

/// Identifies a virtual service by id.
#[derive(Clone, PartialEq, Message)]
pub struct ServiceId {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct VirtualServiceList {
    #[prost(message, repeated, tag = "1")]
    pub services: Vec<VirtualService>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RealServerList {
    #[prost(message, repeated, tag = "1")]
    pub servers: Vec<RealServer>,
}
