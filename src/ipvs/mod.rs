//! Kernel IPVS adapter.
//!
//! The reconciler drives the kernel through the narrow [`Ipvs`] trait so it
//! can be tested against an in-memory fake. [`netlink::NetlinkIpvs`] is the
//! real driver. All mutations are idempotent from the caller's viewpoint:
//! the driver normalizes the kernel's `EEXIST`/`ENOENT` to success, so a
//! retried operation cannot fail on "already done".

pub mod netlink;

use crate::types::{RealServerConfig, RealServerKey, VirtualServiceConfig, VirtualServiceKey};
use async_trait::async_trait;
use thiserror::Error;

/// Kernel adapter failure.
#[derive(Debug, Error)]
pub enum IpvsError {
    #[error("netlink i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("kernel rejected {operation}: {errno} ({message})")]
    Kernel {
        operation: &'static str,
        errno: i32,
        message: String,
    },

    #[error("malformed kernel reply: {0}")]
    Protocol(String),

    #[error("unknown scheduler flag {0:?}")]
    UnknownFlag(String),
}

pub type IpvsResult<T> = std::result::Result<T, IpvsError>;

/// Narrow interface over the kernel's IPVS tables.
///
/// Only the reconciler task touches an implementation; the trait does not
/// need to be safe for concurrent mutation.
#[async_trait]
pub trait Ipvs: Send + Sync {
    /// Services currently present in the kernel.
    async fn list_services(&self) -> IpvsResult<Vec<(VirtualServiceKey, VirtualServiceConfig)>>;

    /// Backends of one kernel service.
    async fn list_servers(
        &self,
        key: &VirtualServiceKey,
    ) -> IpvsResult<Vec<(RealServerKey, RealServerConfig)>>;

    async fn add_service(
        &self,
        key: &VirtualServiceKey,
        config: &VirtualServiceConfig,
    ) -> IpvsResult<()>;

    async fn update_service(
        &self,
        key: &VirtualServiceKey,
        config: &VirtualServiceConfig,
    ) -> IpvsResult<()>;

    async fn delete_service(&self, key: &VirtualServiceKey) -> IpvsResult<()>;

    async fn add_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
        config: &RealServerConfig,
    ) -> IpvsResult<()>;

    async fn update_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
        config: &RealServerConfig,
    ) -> IpvsResult<()>;

    async fn delete_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
    ) -> IpvsResult<()>;

    /// Release the underlying socket. Further calls fail.
    async fn close(&self);
}

/// Kernel scheduler-private flag bits (`IP_VS_SVC_F_SCHED*`).
mod svc_flags {
    pub const SCHED1: u32 = 0x0008;
    pub const SCHED2: u32 = 0x0010;
    pub const SCHED3: u32 = 0x0020;
}

/// Scheduler flag names accepted in service configs, mapped onto the
/// kernel's scheduler-private bits. `sh-fallback` and `sh-port` are the
/// `sh` scheduler's documented aliases for the first two bits.
const FLAG_NAMES: &[(&str, u32)] = &[
    ("flag-1", svc_flags::SCHED1),
    ("flag-2", svc_flags::SCHED2),
    ("flag-3", svc_flags::SCHED3),
    ("sh-fallback", svc_flags::SCHED1),
    ("sh-port", svc_flags::SCHED2),
];

/// Convert flag names to the kernel bitmask.
pub fn flags_to_bits(flags: &[String]) -> IpvsResult<u32> {
    let mut bits = 0;
    for flag in flags {
        let bit = FLAG_NAMES
            .iter()
            .find(|(name, _)| name == flag)
            .map(|(_, bit)| *bit)
            .ok_or_else(|| IpvsError::UnknownFlag(flag.clone()))?;
        bits |= bit;
    }
    Ok(bits)
}

/// Convert a kernel bitmask back to canonical flag names, ignoring bits this
/// daemon does not manage.
pub fn bits_to_flags(bits: u32) -> Vec<String> {
    let mut flags = Vec::new();
    for (name, bit) in &[
        ("flag-1", svc_flags::SCHED1),
        ("flag-2", svc_flags::SCHED2),
        ("flag-3", svc_flags::SCHED3),
    ] {
        if bits & bit != 0 {
            flags.push((*name).to_string());
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_names_round_trip_through_bits() {
        let bits = flags_to_bits(&["flag-1".to_string(), "flag-3".to_string()]).unwrap();
        assert_eq!(bits, 0x0008 | 0x0020);
        assert_eq!(bits_to_flags(bits), vec!["flag-1", "flag-3"]);
    }

    #[test]
    fn sh_aliases_share_sched_bits() {
        let aliased = flags_to_bits(&["sh-fallback".to_string(), "sh-port".to_string()]).unwrap();
        let numbered = flags_to_bits(&["flag-1".to_string(), "flag-2".to_string()]).unwrap();
        assert_eq!(aliased, numbered);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        match flags_to_bits(&["bogus".to_string()]) {
            Err(IpvsError::UnknownFlag(name)) => assert_eq!(name, "bogus"),
            other => panic!("expected UnknownFlag, got {other:?}"),
        }
    }

    #[test]
    fn unmanaged_bits_are_dropped_on_read() {
        assert_eq!(bits_to_flags(0x0001 | 0x0008), vec!["flag-1"]);
    }
}
