//! Overlay semantics for partial updates.
//!
//! An update carries a partial record; fields present in the patch overwrite
//! the stored value, fields absent from the patch leave it untouched.
//! Wrapper fields (`persistence_timeout`, `weight`) carry explicit presence,
//! so "set to zero" and "not set" are distinct. Plain scalars and repeated
//! fields cannot represent absence on the wire and are treated as omitted
//! when equal to their default.

use crate::types::{ForwardMethod, RealServer, VirtualService};

/// Overlay a service patch onto the stored record.
pub fn merge_service(current: &VirtualService, patch: &VirtualService) -> VirtualService {
    let mut merged = current.clone();

    if let Some(patch_key) = &patch.key {
        merged.key = Some(patch_key.clone());
    }

    if let Some(patch_config) = &patch.config {
        let config = merged.config.get_or_insert_with(Default::default);
        if !patch_config.scheduler.is_empty() {
            config.scheduler = patch_config.scheduler.clone();
        }
        if !patch_config.flags.is_empty() {
            config.flags = patch_config.flags.clone();
        }
        if let Some(timeout) = patch_config.persistence_timeout {
            config.persistence_timeout = Some(timeout);
        }
    }

    // The health check is opaque to this layer; a present record replaces
    // the stored one wholesale.
    if let Some(patch_check) = &patch.health_check {
        merged.health_check = Some(patch_check.clone());
    }

    merged
}

/// Overlay a server patch onto the stored record.
pub fn merge_server(current: &RealServer, patch: &RealServer) -> RealServer {
    let mut merged = current.clone();

    if let Some(patch_config) = &patch.config {
        let config = merged.config.get_or_insert_with(Default::default);
        if let Some(weight) = patch_config.weight {
            config.weight = Some(weight);
        }
        if patch_config.forward != ForwardMethod::Unset as i32 {
            config.forward = patch_config.forward;
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        HealthCheck, Protocol, RealServerConfig, RealServerKey, StringValue, UInt32Value,
        VirtualServiceConfig, VirtualServiceKey,
    };

    fn stored_service() -> VirtualService {
        VirtualService {
            id: "service1".to_string(),
            key: Some(VirtualServiceKey {
                ip: "10.10.10.1".to_string(),
                port: 101,
                protocol: Protocol::Tcp as i32,
            }),
            config: Some(VirtualServiceConfig {
                scheduler: "sh".to_string(),
                flags: vec!["sh-port".to_string()],
                persistence_timeout: Some(UInt32Value::new(300)),
            }),
            health_check: Some(HealthCheck {
                endpoint: Some(StringValue::new("http://:80/health")),
                period_seconds: 10,
                timeout_seconds: 2,
                up_threshold: 3,
                down_threshold: 2,
            }),
        }
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let stored = stored_service();
        let patch = VirtualService {
            id: stored.id.clone(),
            ..Default::default()
        };
        assert_eq!(merge_service(&stored, &patch), stored);
    }

    #[test]
    fn present_fields_overwrite() {
        let stored = stored_service();
        let patch = VirtualService {
            id: stored.id.clone(),
            config: Some(VirtualServiceConfig {
                scheduler: "wrr".to_string(),
                flags: vec!["flag-1".to_string(), "flag-2".to_string()],
                persistence_timeout: None,
            }),
            ..Default::default()
        };

        let merged = merge_service(&stored, &patch);
        let config = merged.config.unwrap();
        assert_eq!(config.scheduler, "wrr");
        assert_eq!(config.flags, vec!["flag-1", "flag-2"]);
        // Absent wrapper left untouched.
        assert_eq!(config.persistence_timeout(), Some(300));
        assert_eq!(merged.key, stored.key);
    }

    #[test]
    fn wrapper_set_to_zero_overwrites() {
        let stored = stored_service();
        let patch = VirtualService {
            id: stored.id.clone(),
            config: Some(VirtualServiceConfig {
                persistence_timeout: Some(UInt32Value::new(0)),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = merge_service(&stored, &patch);
        assert_eq!(merged.config.unwrap().persistence_timeout(), Some(0));
    }

    #[test]
    fn health_check_replaced_wholesale() {
        let stored = stored_service();
        let patch = VirtualService {
            id: stored.id.clone(),
            health_check: Some(HealthCheck {
                endpoint: Some(StringValue::new("http://:8081/ping")),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = merge_service(&stored, &patch);
        let check = merged.health_check.unwrap();
        assert_eq!(check.endpoint(), Some("http://:8081/ping"));
        assert_eq!(check.period_seconds, 0);
    }

    #[test]
    fn server_weight_zero_overwrites_and_unset_forward_leaves() {
        let stored = RealServer {
            service_id: "service1".to_string(),
            key: Some(RealServerKey {
                ip: "172.16.1.1".to_string(),
                port: 9090,
            }),
            config: Some(RealServerConfig {
                weight: Some(UInt32Value::new(5)),
                forward: ForwardMethod::Route as i32,
            }),
        };

        let patch = RealServer {
            service_id: stored.service_id.clone(),
            key: stored.key.clone(),
            config: Some(RealServerConfig {
                weight: Some(UInt32Value::new(0)),
                forward: ForwardMethod::Unset as i32,
            }),
        };

        let merged = merge_server(&stored, &patch);
        let config = merged.config.unwrap();
        assert_eq!(config.weight(), Some(0));
        assert_eq!(config.forward, ForwardMethod::Route as i32);
    }

    #[test]
    fn server_forward_overwrites_when_present() {
        let stored = RealServer {
            service_id: "service1".to_string(),
            key: Some(RealServerKey {
                ip: "172.16.1.1".to_string(),
                port: 9090,
            }),
            config: Some(RealServerConfig {
                weight: Some(UInt32Value::new(5)),
                forward: ForwardMethod::Route as i32,
            }),
        };

        let patch = RealServer {
            service_id: stored.service_id.clone(),
            key: stored.key.clone(),
            config: Some(RealServerConfig {
                weight: None,
                forward: ForwardMethod::Tunnel as i32,
            }),
        };

        let merged = merge_server(&stored, &patch);
        let config = merged.config.unwrap();
        assert_eq!(config.weight(), Some(5));
        assert_eq!(config.forward, ForwardMethod::Tunnel as i32);
    }
}
