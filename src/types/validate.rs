//! Create- and update-time validation of virtual services and real servers.
//!
//! Pure predicates; no I/O. Create validation requires every mandatory field;
//! update validation relaxes "required" for fields absent from the partial
//! record, but any field that is present must be individually valid. Every
//! failure is an `InvalidArgument` carrying a short reason.

use crate::core::error::{Error, Result};
use crate::types::{
    ForwardMethod, Protocol, RealServer, RealServerKey, VirtualService, VirtualServiceKey,
};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Validate a virtual service for creation.
pub fn validate_service_create(service: &VirtualService) -> Result<()> {
    validate_service_id(&service.id)?;

    let key = service
        .key
        .as_ref()
        .ok_or_else(|| Error::invalid_argument("service key required"))?;
    validate_service_key(key)?;

    let config = service
        .config
        .as_ref()
        .ok_or_else(|| Error::invalid_argument("service config required"))?;
    validate_scheduler(&config.scheduler)?;

    Ok(())
}

/// Validate a partial virtual service for update.
pub fn validate_service_update(service: &VirtualService) -> Result<()> {
    validate_service_id(&service.id)?;

    if let Some(key) = &service.key {
        validate_service_key(key)?;
    }
    if let Some(config) = &service.config {
        if !config.scheduler.is_empty() {
            validate_scheduler(&config.scheduler)?;
        }
    }

    Ok(())
}

/// Validate a real server for creation.
pub fn validate_server_create(server: &RealServer) -> Result<()> {
    validate_service_id(&server.service_id)?;

    let key = server
        .key
        .as_ref()
        .ok_or_else(|| Error::invalid_argument("server key required"))?;
    validate_server_key(key)?;

    let config = server
        .config
        .as_ref()
        .ok_or_else(|| Error::invalid_argument("server config required"))?;
    if config.weight.is_none() {
        return Err(Error::invalid_argument("server weight required"));
    }
    validate_forward(config.forward, true)?;

    Ok(())
}

/// Validate a partial real server for update.
pub fn validate_server_update(server: &RealServer) -> Result<()> {
    validate_service_id(&server.service_id)?;

    let key = server
        .key
        .as_ref()
        .ok_or_else(|| Error::invalid_argument("server key required"))?;
    validate_server_key(key)?;

    if let Some(config) = &server.config {
        validate_forward(config.forward, false)?;
    }

    Ok(())
}

fn validate_service_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid_argument("service id required"));
    }
    Ok(())
}

fn validate_service_key(key: &VirtualServiceKey) -> Result<()> {
    validate_ip(&key.ip)?;
    validate_port(key.port)?;
    match Protocol::try_from(key.protocol) {
        Ok(Protocol::Tcp) | Ok(Protocol::Udp) => Ok(()),
        Ok(Protocol::Unset) => Err(Error::invalid_argument("protocol required")),
        Err(_) => Err(Error::invalid_argument(format!(
            "unrecognized protocol {}",
            key.protocol
        ))),
    }
}

fn validate_server_key(key: &RealServerKey) -> Result<()> {
    validate_ip(&key.ip)?;
    validate_port(key.port)
}

fn validate_ip(ip: &str) -> Result<()> {
    if ip.is_empty() {
        return Err(Error::invalid_argument("ip required"));
    }
    Ipv4Addr::from_str(ip)
        .map(|_| ())
        .map_err(|_| Error::invalid_argument(format!("{ip:?} is not a valid IPv4 address")))
}

fn validate_port(port: u32) -> Result<()> {
    if port == 0 || port > u32::from(u16::MAX) {
        return Err(Error::invalid_argument(format!(
            "port must be in [1, 65535], got {port}"
        )));
    }
    Ok(())
}

fn validate_scheduler(scheduler: &str) -> Result<()> {
    if scheduler.is_empty() {
        return Err(Error::invalid_argument("scheduler required"));
    }
    Ok(())
}

fn validate_forward(forward: i32, required: bool) -> Result<()> {
    match ForwardMethod::try_from(forward) {
        Ok(ForwardMethod::Route) | Ok(ForwardMethod::Tunnel) | Ok(ForwardMethod::Masq) => Ok(()),
        Ok(ForwardMethod::Unset) if !required => Ok(()),
        Ok(ForwardMethod::Unset) => Err(Error::invalid_argument("forward method required")),
        Err(_) => Err(Error::invalid_argument(format!(
            "unrecognized forward method {forward}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RealServerConfig, UInt32Value, VirtualServiceConfig};

    fn service() -> VirtualService {
        VirtualService {
            id: "service1".to_string(),
            key: Some(VirtualServiceKey {
                ip: "127.0.0.1".to_string(),
                port: 8080,
                protocol: Protocol::Tcp as i32,
            }),
            config: Some(VirtualServiceConfig {
                scheduler: "sh".to_string(),
                flags: vec![],
                persistence_timeout: None,
            }),
            health_check: None,
        }
    }

    fn server() -> RealServer {
        RealServer {
            service_id: "service1".to_string(),
            key: Some(RealServerKey {
                ip: "172.16.1.1".to_string(),
                port: 9090,
            }),
            config: Some(RealServerConfig {
                weight: Some(UInt32Value::new(2)),
                forward: ForwardMethod::Route as i32,
            }),
        }
    }

    fn assert_rejected(result: crate::core::error::Result<()>) {
        match result {
            Err(Error::InvalidArgument { .. }) => {}
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[test]
    fn valid_service_accepted() {
        validate_service_create(&service()).unwrap();
    }

    #[test]
    fn empty_service_rejected() {
        assert_rejected(validate_service_create(&VirtualService::default()));
    }

    #[test]
    fn service_missing_id_rejected() {
        let mut svc = service();
        svc.id.clear();
        assert_rejected(validate_service_create(&svc));
    }

    #[test]
    fn service_missing_key_rejected() {
        let mut svc = service();
        svc.key = None;
        assert_rejected(validate_service_create(&svc));
    }

    #[test]
    fn service_invalid_ip_rejected() {
        for ip in ["", "999.999.999.999", "not-an-ip", "fe80::1"] {
            let mut svc = service();
            svc.key.as_mut().unwrap().ip = ip.to_string();
            assert_rejected(validate_service_create(&svc));
        }
    }

    #[test]
    fn service_port_bounds_enforced() {
        for port in [0, 99999] {
            let mut svc = service();
            svc.key.as_mut().unwrap().port = port;
            assert_rejected(validate_service_create(&svc));
        }
    }

    #[test]
    fn service_protocol_must_be_tcp_or_udp() {
        for protocol in [Protocol::Unset as i32, 999] {
            let mut svc = service();
            svc.key.as_mut().unwrap().protocol = protocol;
            assert_rejected(validate_service_create(&svc));
        }

        let mut svc = service();
        svc.key.as_mut().unwrap().protocol = Protocol::Udp as i32;
        validate_service_create(&svc).unwrap();
    }

    #[test]
    fn service_config_and_scheduler_required() {
        let mut svc = service();
        svc.config = None;
        assert_rejected(validate_service_create(&svc));

        let mut svc = service();
        svc.config.as_mut().unwrap().scheduler.clear();
        assert_rejected(validate_service_create(&svc));
    }

    #[test]
    fn service_update_allows_absent_optionals() {
        let patch = VirtualService {
            id: "service1".to_string(),
            key: None,
            config: None,
            health_check: None,
        };
        validate_service_update(&patch).unwrap();
    }

    #[test]
    fn service_update_still_checks_present_fields() {
        let mut patch = service();
        patch.key.as_mut().unwrap().ip = "bogus".to_string();
        assert_rejected(validate_service_update(&patch));
    }

    #[test]
    fn valid_server_accepted() {
        validate_server_create(&server()).unwrap();
    }

    #[test]
    fn empty_server_rejected() {
        assert_rejected(validate_server_create(&RealServer::default()));
    }

    #[test]
    fn server_missing_service_id_rejected() {
        let mut srv = server();
        srv.service_id.clear();
        assert_rejected(validate_server_create(&srv));
    }

    #[test]
    fn server_key_fields_enforced() {
        let mut srv = server();
        srv.key = None;
        assert_rejected(validate_server_create(&srv));

        let mut srv = server();
        srv.key.as_mut().unwrap().ip = "999.999.999.999".to_string();
        assert_rejected(validate_server_create(&srv));

        let mut srv = server();
        srv.key.as_mut().unwrap().port = 0;
        assert_rejected(validate_server_create(&srv));
    }

    #[test]
    fn server_config_weight_and_forward_required() {
        let mut srv = server();
        srv.config = None;
        assert_rejected(validate_server_create(&srv));

        let mut srv = server();
        srv.config.as_mut().unwrap().weight = None;
        assert_rejected(validate_server_create(&srv));

        let mut srv = server();
        srv.config.as_mut().unwrap().forward = ForwardMethod::Unset as i32;
        assert_rejected(validate_server_create(&srv));
    }

    #[test]
    fn zero_weight_is_valid() {
        let mut srv = server();
        srv.config.as_mut().unwrap().weight = Some(UInt32Value::new(0));
        validate_server_create(&srv).unwrap();
    }

    #[test]
    fn server_update_allows_absent_config() {
        let mut patch = server();
        patch.config = None;
        validate_server_update(&patch).unwrap();

        let mut patch = server();
        patch.config.as_mut().unwrap().weight = None;
        patch.config.as_mut().unwrap().forward = ForwardMethod::Unset as i32;
        validate_server_update(&patch).unwrap();
    }

    #[test]
    fn verdict_is_stable_across_repetition() {
        let svc = service();
        for _ in 0..3 {
            validate_service_create(&svc).unwrap();
        }
        let mut bad = service();
        bad.key.as_mut().unwrap().port = 0;
        for _ in 0..3 {
            assert_rejected(validate_service_create(&bad));
        }
    }
}
