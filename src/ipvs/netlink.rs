//! Generic-netlink driver for the kernel IPVS subsystem.
//!
//! Talks to the `IPVS` generic-netlink family directly over an
//! `AF_NETLINK`/`NETLINK_GENERIC` socket: the family id is resolved through
//! `nlctrl` at open time, requests are packed and replies parsed with the
//! attribute helpers below. Command and attribute numbering follows
//! `include/uapi/linux/ip_vs.h`.
//!
//! Netlink headers and attribute scalars are host-endian; ports travel in
//! network byte order; addresses are written as the kernel's 16-byte
//! address union with the IPv4 address in the leading bytes.

use crate::ipvs::{flags_to_bits, bits_to_flags, Ipvs, IpvsError, IpvsResult};
use crate::types::{
    ForwardMethod, Protocol, RealServerConfig, RealServerKey, UInt32Value,
    VirtualServiceConfig, VirtualServiceKey,
};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

const NETLINK_GENERIC: i32 = 16;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
/// NLM_F_ROOT | NLM_F_MATCH.
const NLM_F_DUMP: u16 = 0x300;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = 0x3fff;

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const IPVS_GENL_NAME: &str = "IPVS";
const IPVS_GENL_VERSION: u8 = 1;

// IPVS generic-netlink commands.
const IPVS_CMD_NEW_SERVICE: u8 = 1;
const IPVS_CMD_SET_SERVICE: u8 = 2;
const IPVS_CMD_DEL_SERVICE: u8 = 3;
const IPVS_CMD_GET_SERVICE: u8 = 4;
const IPVS_CMD_NEW_DEST: u8 = 5;
const IPVS_CMD_SET_DEST: u8 = 6;
const IPVS_CMD_DEL_DEST: u8 = 7;
const IPVS_CMD_GET_DEST: u8 = 8;

// Top-level command attributes.
const IPVS_CMD_ATTR_SERVICE: u16 = 1;
const IPVS_CMD_ATTR_DEST: u16 = 2;

// Service attributes (nested under IPVS_CMD_ATTR_SERVICE).
const IPVS_SVC_ATTR_AF: u16 = 1;
const IPVS_SVC_ATTR_PROTOCOL: u16 = 2;
const IPVS_SVC_ATTR_ADDR: u16 = 3;
const IPVS_SVC_ATTR_PORT: u16 = 4;
const IPVS_SVC_ATTR_FWMARK: u16 = 5;
const IPVS_SVC_ATTR_SCHED_NAME: u16 = 6;
const IPVS_SVC_ATTR_FLAGS: u16 = 7;
const IPVS_SVC_ATTR_TIMEOUT: u16 = 8;
const IPVS_SVC_ATTR_NETMASK: u16 = 9;

// Destination attributes (nested under IPVS_CMD_ATTR_DEST).
const IPVS_DEST_ATTR_ADDR: u16 = 1;
const IPVS_DEST_ATTR_PORT: u16 = 2;
const IPVS_DEST_ATTR_FWD_METHOD: u16 = 3;
const IPVS_DEST_ATTR_WEIGHT: u16 = 4;
const IPVS_DEST_ATTR_U_THRESH: u16 = 5;
const IPVS_DEST_ATTR_L_THRESH: u16 = 6;

/// Connection flags: forwarding method mask and values.
const IP_VS_CONN_F_FWD_MASK: u32 = 0x0007;
const IP_VS_CONN_F_MASQ: u32 = 0x0000;
const IP_VS_CONN_F_TUNNEL: u32 = 0x0002;
const IP_VS_CONN_F_DROUTE: u32 = 0x0003;

/// Service flag: persistent virtual service.
const IP_VS_SVC_F_PERSISTENT: u32 = 0x0001;

const AF_INET: u16 = libc::AF_INET as u16;

const RECV_BUF_SIZE: usize = 64 * 1024;

/// IPVS driver over a generic-netlink socket.
///
/// Single-writer by design: the socket is serialized behind a mutex and only
/// the reconciler task holds the adapter.
pub struct NetlinkIpvs {
    socket: Mutex<Option<NetlinkSocket>>,
    family: u16,
    seq: AtomicU32,
}

impl NetlinkIpvs {
    /// Open a netlink socket and resolve the IPVS family id. Fails when the
    /// kernel lacks IPVS support.
    pub fn open() -> IpvsResult<Self> {
        let socket = NetlinkSocket::open()?;
        let family = resolve_family(&socket, IPVS_GENL_NAME)?;
        Ok(Self {
            socket: Mutex::new(Some(socket)),
            family,
            seq: AtomicU32::new(1),
        })
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Issue a mutation and wait for the kernel's ack.
    ///
    /// `EEXIST` and `ENOENT` are normalized to success so retried
    /// reconciler operations are idempotent.
    async fn ack_request(
        &self,
        operation: &'static str,
        cmd: u8,
        attrs: &[u8],
    ) -> IpvsResult<()> {
        let guard = self.socket.lock().await;
        let socket = guard
            .as_ref()
            .ok_or_else(|| IpvsError::Io(io::Error::from(io::ErrorKind::NotConnected)))?;

        let seq = self.next_seq();
        let msg = build_message(self.family, NLM_F_REQUEST | NLM_F_ACK, seq, cmd, attrs);
        socket.send(&msg)?;

        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let n = socket.recv(&mut buf)?;
        for (msg_type, payload) in split_messages(&buf[..n])? {
            if msg_type == NLMSG_ERROR {
                let errno = read_errno(payload)?;
                return match errno {
                    0 => Ok(()),
                    libc::EEXIST | libc::ENOENT => Ok(()),
                    errno => Err(IpvsError::Kernel {
                        operation,
                        errno,
                        message: io::Error::from_raw_os_error(errno).to_string(),
                    }),
                };
            }
        }
        Err(IpvsError::Protocol(format!("no ack for {operation}")))
    }

    /// Issue a dump and collect the attribute payload of every reply
    /// message (genl header stripped).
    async fn dump_request(
        &self,
        operation: &'static str,
        cmd: u8,
        attrs: &[u8],
    ) -> IpvsResult<Vec<Vec<u8>>> {
        let guard = self.socket.lock().await;
        let socket = guard
            .as_ref()
            .ok_or_else(|| IpvsError::Io(io::Error::from(io::ErrorKind::NotConnected)))?;

        let seq = self.next_seq();
        let msg = build_message(self.family, NLM_F_REQUEST | NLM_F_DUMP, seq, cmd, attrs);
        socket.send(&msg)?;

        let mut parts = Vec::new();
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let n = socket.recv(&mut buf)?;
            for (msg_type, payload) in split_messages(&buf[..n])? {
                match msg_type {
                    NLMSG_DONE => return Ok(parts),
                    NLMSG_ERROR => {
                        let errno = read_errno(payload)?;
                        if errno == 0 || errno == libc::ENOENT {
                            return Ok(parts);
                        }
                        return Err(IpvsError::Kernel {
                            operation,
                            errno,
                            message: io::Error::from_raw_os_error(errno).to_string(),
                        });
                    }
                    t if t == self.family => {
                        if payload.len() < 4 {
                            return Err(IpvsError::Protocol("short genl message".to_string()));
                        }
                        parts.push(payload[4..].to_vec());
                    }
                    _ => {}
                }
            }
        }
    }
}

#[async_trait]
impl Ipvs for NetlinkIpvs {
    async fn list_services(&self) -> IpvsResult<Vec<(VirtualServiceKey, VirtualServiceConfig)>> {
        let parts = self
            .dump_request("list services", IPVS_CMD_GET_SERVICE, &[])
            .await?;

        let mut services = Vec::new();
        for part in parts {
            for (ty, payload) in AttrIter::new(&part) {
                if ty == IPVS_CMD_ATTR_SERVICE {
                    if let Some(entry) = parse_service(payload)? {
                        services.push(entry);
                    }
                }
            }
        }
        Ok(services)
    }

    async fn list_servers(
        &self,
        key: &VirtualServiceKey,
    ) -> IpvsResult<Vec<(RealServerKey, RealServerConfig)>> {
        let mut attrs = BytesMut::new();
        put_nested(&mut attrs, IPVS_CMD_ATTR_SERVICE, &service_key_attrs(key)?);

        let parts = self
            .dump_request("list servers", IPVS_CMD_GET_DEST, &attrs)
            .await?;

        let mut servers = Vec::new();
        for part in parts {
            for (ty, payload) in AttrIter::new(&part) {
                if ty == IPVS_CMD_ATTR_DEST {
                    servers.push(parse_dest(payload)?);
                }
            }
        }
        Ok(servers)
    }

    async fn add_service(
        &self,
        key: &VirtualServiceKey,
        config: &VirtualServiceConfig,
    ) -> IpvsResult<()> {
        let mut attrs = BytesMut::new();
        put_nested(
            &mut attrs,
            IPVS_CMD_ATTR_SERVICE,
            &service_attrs(key, config)?,
        );
        self.ack_request("add service", IPVS_CMD_NEW_SERVICE, &attrs)
            .await
    }

    async fn update_service(
        &self,
        key: &VirtualServiceKey,
        config: &VirtualServiceConfig,
    ) -> IpvsResult<()> {
        let mut attrs = BytesMut::new();
        put_nested(
            &mut attrs,
            IPVS_CMD_ATTR_SERVICE,
            &service_attrs(key, config)?,
        );
        self.ack_request("update service", IPVS_CMD_SET_SERVICE, &attrs)
            .await
    }

    async fn delete_service(&self, key: &VirtualServiceKey) -> IpvsResult<()> {
        let mut attrs = BytesMut::new();
        put_nested(&mut attrs, IPVS_CMD_ATTR_SERVICE, &service_key_attrs(key)?);
        self.ack_request("delete service", IPVS_CMD_DEL_SERVICE, &attrs)
            .await
    }

    async fn add_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
        config: &RealServerConfig,
    ) -> IpvsResult<()> {
        let mut attrs = BytesMut::new();
        put_nested(
            &mut attrs,
            IPVS_CMD_ATTR_SERVICE,
            &service_key_attrs(service)?,
        );
        put_nested(&mut attrs, IPVS_CMD_ATTR_DEST, &dest_attrs(key, config)?);
        self.ack_request("add server", IPVS_CMD_NEW_DEST, &attrs).await
    }

    async fn update_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
        config: &RealServerConfig,
    ) -> IpvsResult<()> {
        let mut attrs = BytesMut::new();
        put_nested(
            &mut attrs,
            IPVS_CMD_ATTR_SERVICE,
            &service_key_attrs(service)?,
        );
        put_nested(&mut attrs, IPVS_CMD_ATTR_DEST, &dest_attrs(key, config)?);
        self.ack_request("update server", IPVS_CMD_SET_DEST, &attrs).await
    }

    async fn delete_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
    ) -> IpvsResult<()> {
        let mut attrs = BytesMut::new();
        put_nested(
            &mut attrs,
            IPVS_CMD_ATTR_SERVICE,
            &service_key_attrs(service)?,
        );
        put_nested(&mut attrs, IPVS_CMD_ATTR_DEST, &dest_key_attrs(key)?);
        self.ack_request("delete server", IPVS_CMD_DEL_DEST, &attrs).await
    }

    async fn close(&self) {
        self.socket.lock().await.take();
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_GENERIC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd })
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        let rc = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc =
            unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

// ---------------------------------------------------------------------------
// Message framing
// ---------------------------------------------------------------------------

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Assemble nlmsghdr + genlmsghdr + attributes.
fn build_message(msg_type: u16, flags: u16, seq: u32, cmd: u8, attrs: &[u8]) -> Vec<u8> {
    let len = 16 + 4 + attrs.len();
    let mut buf = BytesMut::with_capacity(align4(len));
    buf.put_u32_ne(len as u32);
    buf.put_u16_ne(msg_type);
    buf.put_u16_ne(flags);
    buf.put_u32_ne(seq);
    buf.put_u32_ne(0); // pid: kernel assigns
    buf.put_u8(cmd);
    buf.put_u8(if msg_type == GENL_ID_CTRL { 2 } else { IPVS_GENL_VERSION });
    buf.put_u16_ne(0); // reserved
    buf.put_slice(attrs);
    buf.to_vec()
}

/// Split a receive buffer into `(message type, payload)` pairs.
fn split_messages(mut data: &[u8]) -> IpvsResult<Vec<(u16, &[u8])>> {
    let mut messages = Vec::new();
    while data.len() >= 16 {
        let len = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len < 16 || len > data.len() {
            return Err(IpvsError::Protocol(format!("bad nlmsg length {len}")));
        }
        let msg_type = u16::from_ne_bytes([data[4], data[5]]);
        messages.push((msg_type, &data[16..len]));
        data = &data[align4(len).min(data.len())..];
    }
    Ok(messages)
}

/// The payload of an NLMSG_ERROR starts with a negated errno.
fn read_errno(payload: &[u8]) -> IpvsResult<i32> {
    if payload.len() < 4 {
        return Err(IpvsError::Protocol("short error message".to_string()));
    }
    let code = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok(-code)
}

fn put_attr(buf: &mut BytesMut, ty: u16, payload: &[u8]) {
    buf.put_u16_ne((4 + payload.len()) as u16);
    buf.put_u16_ne(ty);
    buf.put_slice(payload);
    for _ in payload.len()..align4(payload.len()) {
        buf.put_u8(0);
    }
}

fn put_nested(buf: &mut BytesMut, ty: u16, inner: &[u8]) {
    put_attr(buf, ty | NLA_F_NESTED, inner);
}

fn put_attr_u16(buf: &mut BytesMut, ty: u16, value: u16) {
    put_attr(buf, ty, &value.to_ne_bytes());
}

fn put_attr_u32(buf: &mut BytesMut, ty: u16, value: u32) {
    put_attr(buf, ty, &value.to_ne_bytes());
}

fn put_attr_be16(buf: &mut BytesMut, ty: u16, value: u16) {
    put_attr(buf, ty, &value.to_be_bytes());
}

fn put_attr_str(buf: &mut BytesMut, ty: u16, value: &str) {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    put_attr(buf, ty, &bytes);
}

/// Write an IPv4 address as the kernel's 16-byte address union.
fn put_attr_addr(buf: &mut BytesMut, ty: u16, addr: Ipv4Addr) {
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&addr.octets());
    put_attr(buf, ty, &bytes);
}

struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([self.data[0], self.data[1]]) as usize;
        if len < 4 || len > self.data.len() {
            return None;
        }
        let ty = u16::from_ne_bytes([self.data[2], self.data[3]]) & NLA_TYPE_MASK;
        let payload = &self.data[4..len];
        self.data = &self.data[align4(len).min(self.data.len())..];
        Some((ty, payload))
    }
}

fn attr_u16(payload: &[u8]) -> IpvsResult<u16> {
    payload
        .get(..2)
        .map(|b| u16::from_ne_bytes([b[0], b[1]]))
        .ok_or_else(|| IpvsError::Protocol("short u16 attribute".to_string()))
}

fn attr_u32(payload: &[u8]) -> IpvsResult<u32> {
    payload
        .get(..4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| IpvsError::Protocol("short u32 attribute".to_string()))
}

fn attr_be16(payload: &[u8]) -> IpvsResult<u16> {
    payload
        .get(..2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| IpvsError::Protocol("short port attribute".to_string()))
}

fn attr_str(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).to_string()
}

fn attr_v4(payload: &[u8]) -> IpvsResult<Ipv4Addr> {
    payload
        .get(..4)
        .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        .ok_or_else(|| IpvsError::Protocol("short address attribute".to_string()))
}

// ---------------------------------------------------------------------------
// IPVS attribute packing / parsing
// ---------------------------------------------------------------------------

fn parse_ip(ip: &str) -> IpvsResult<Ipv4Addr> {
    Ipv4Addr::from_str(ip)
        .map_err(|_| IpvsError::Protocol(format!("invalid IPv4 address {ip:?}")))
}

fn protocol_number(key: &VirtualServiceKey) -> IpvsResult<u16> {
    match key.protocol() {
        Some(Protocol::Tcp) => Ok(libc::IPPROTO_TCP as u16),
        Some(Protocol::Udp) => Ok(libc::IPPROTO_UDP as u16),
        _ => Err(IpvsError::Protocol(format!(
            "unmapped protocol {}",
            key.protocol
        ))),
    }
}

/// Identity attributes of a service: enough for deletes and dest commands.
fn service_key_attrs(key: &VirtualServiceKey) -> IpvsResult<BytesMut> {
    let mut buf = BytesMut::new();
    put_attr_u16(&mut buf, IPVS_SVC_ATTR_AF, AF_INET);
    put_attr_u16(&mut buf, IPVS_SVC_ATTR_PROTOCOL, protocol_number(key)?);
    put_attr_addr(&mut buf, IPVS_SVC_ATTR_ADDR, parse_ip(&key.ip)?);
    put_attr_be16(&mut buf, IPVS_SVC_ATTR_PORT, key.port as u16);
    Ok(buf)
}

/// Full attribute set for service creation and update.
fn service_attrs(
    key: &VirtualServiceKey,
    config: &VirtualServiceConfig,
) -> IpvsResult<BytesMut> {
    let mut flags = flags_to_bits(&config.flags)?;
    if config.persistence_timeout.is_some() {
        flags |= IP_VS_SVC_F_PERSISTENT;
    }

    let mut buf = service_key_attrs(key)?;
    put_attr_str(&mut buf, IPVS_SVC_ATTR_SCHED_NAME, &config.scheduler);
    // struct ip_vs_flags { flags, mask }: claim every bit so stale state
    // from a previous configuration cannot linger.
    let mut flag_attr = [0u8; 8];
    flag_attr[..4].copy_from_slice(&flags.to_ne_bytes());
    flag_attr[4..].copy_from_slice(&u32::MAX.to_ne_bytes());
    put_attr(&mut buf, IPVS_SVC_ATTR_FLAGS, &flag_attr);
    put_attr_u32(
        &mut buf,
        IPVS_SVC_ATTR_TIMEOUT,
        config.persistence_timeout().unwrap_or(0),
    );
    put_attr_u32(&mut buf, IPVS_SVC_ATTR_NETMASK, u32::MAX);
    Ok(buf)
}

fn dest_key_attrs(key: &RealServerKey) -> IpvsResult<BytesMut> {
    let mut buf = BytesMut::new();
    put_attr_addr(&mut buf, IPVS_DEST_ATTR_ADDR, parse_ip(&key.ip)?);
    put_attr_be16(&mut buf, IPVS_DEST_ATTR_PORT, key.port as u16);
    Ok(buf)
}

fn dest_attrs(key: &RealServerKey, config: &RealServerConfig) -> IpvsResult<BytesMut> {
    let fwd = match config.forward() {
        Some(ForwardMethod::Masq) => IP_VS_CONN_F_MASQ,
        Some(ForwardMethod::Tunnel) => IP_VS_CONN_F_TUNNEL,
        Some(ForwardMethod::Route) => IP_VS_CONN_F_DROUTE,
        _ => {
            return Err(IpvsError::Protocol(format!(
                "unmapped forward method {}",
                config.forward
            )))
        }
    };

    let mut buf = dest_key_attrs(key)?;
    put_attr_u32(&mut buf, IPVS_DEST_ATTR_FWD_METHOD, fwd);
    put_attr_u32(&mut buf, IPVS_DEST_ATTR_WEIGHT, config.weight().unwrap_or(0));
    put_attr_u32(&mut buf, IPVS_DEST_ATTR_U_THRESH, 0);
    put_attr_u32(&mut buf, IPVS_DEST_ATTR_L_THRESH, 0);
    Ok(buf)
}

/// Parse one kernel service entry. Returns `None` for entries outside this
/// daemon's model (non-IPv4, firewall-mark services).
fn parse_service(
    payload: &[u8],
) -> IpvsResult<Option<(VirtualServiceKey, VirtualServiceConfig)>> {
    let mut af = None;
    let mut protocol = None;
    let mut addr = None;
    let mut port = None;
    let mut fwmark = 0;
    let mut scheduler = String::new();
    let mut flags = 0u32;
    let mut timeout = 0u32;

    for (ty, value) in AttrIter::new(payload) {
        match ty {
            IPVS_SVC_ATTR_AF => af = Some(attr_u16(value)?),
            IPVS_SVC_ATTR_PROTOCOL => protocol = Some(attr_u16(value)?),
            IPVS_SVC_ATTR_ADDR => addr = Some(attr_v4(value)?),
            IPVS_SVC_ATTR_PORT => port = Some(attr_be16(value)?),
            IPVS_SVC_ATTR_FWMARK => fwmark = attr_u32(value)?,
            IPVS_SVC_ATTR_SCHED_NAME => scheduler = attr_str(value),
            IPVS_SVC_ATTR_FLAGS => flags = attr_u32(value)?,
            IPVS_SVC_ATTR_TIMEOUT => timeout = attr_u32(value)?,
            _ => {}
        }
    }

    if fwmark != 0 || af != Some(AF_INET) {
        return Ok(None);
    }
    let (Some(protocol), Some(addr), Some(port)) = (protocol, addr, port) else {
        return Err(IpvsError::Protocol("service entry missing identity".to_string()));
    };

    let protocol = match i32::from(protocol) {
        p if p == libc::IPPROTO_TCP => Protocol::Tcp,
        p if p == libc::IPPROTO_UDP => Protocol::Udp,
        _ => return Ok(None),
    };

    let key = VirtualServiceKey {
        ip: addr.to_string(),
        port: u32::from(port),
        protocol: protocol as i32,
    };
    let config = VirtualServiceConfig {
        scheduler,
        flags: bits_to_flags(flags),
        persistence_timeout: (flags & IP_VS_SVC_F_PERSISTENT != 0)
            .then_some(UInt32Value::new(timeout)),
    };
    Ok(Some((key, config)))
}

fn parse_dest(payload: &[u8]) -> IpvsResult<(RealServerKey, RealServerConfig)> {
    let mut addr = None;
    let mut port = None;
    let mut fwd = 0u32;
    let mut weight = 0u32;

    for (ty, value) in AttrIter::new(payload) {
        match ty {
            IPVS_DEST_ATTR_ADDR => addr = Some(attr_v4(value)?),
            IPVS_DEST_ATTR_PORT => port = Some(attr_be16(value)?),
            IPVS_DEST_ATTR_FWD_METHOD => fwd = attr_u32(value)?,
            IPVS_DEST_ATTR_WEIGHT => weight = attr_u32(value)?,
            _ => {}
        }
    }

    let (Some(addr), Some(port)) = (addr, port) else {
        return Err(IpvsError::Protocol("destination entry missing identity".to_string()));
    };

    let forward = match fwd & IP_VS_CONN_F_FWD_MASK {
        IP_VS_CONN_F_MASQ => ForwardMethod::Masq,
        IP_VS_CONN_F_TUNNEL => ForwardMethod::Tunnel,
        IP_VS_CONN_F_DROUTE => ForwardMethod::Route,
        other => {
            return Err(IpvsError::Protocol(format!(
                "unmapped kernel forward method {other}"
            )))
        }
    };

    Ok((
        RealServerKey {
            ip: addr.to_string(),
            port: u32::from(port),
        },
        RealServerConfig {
            weight: Some(UInt32Value::new(weight)),
            forward: forward as i32,
        },
    ))
}

/// Resolve a generic-netlink family id through `nlctrl`.
fn resolve_family(socket: &NetlinkSocket, name: &str) -> IpvsResult<u16> {
    let mut attrs = BytesMut::new();
    put_attr_str(&mut attrs, CTRL_ATTR_FAMILY_NAME, name);
    let msg = build_message(GENL_ID_CTRL, NLM_F_REQUEST, 0, CTRL_CMD_GETFAMILY, &attrs);
    socket.send(&msg)?;

    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let n = socket.recv(&mut buf)?;
    for (msg_type, payload) in split_messages(&buf[..n])? {
        match msg_type {
            NLMSG_ERROR => {
                let errno = read_errno(payload)?;
                if errno != 0 {
                    return Err(IpvsError::Kernel {
                        operation: "resolve family",
                        errno,
                        message: io::Error::from_raw_os_error(errno).to_string(),
                    });
                }
            }
            GENL_ID_CTRL => {
                if payload.len() < 4 {
                    continue;
                }
                for (ty, value) in AttrIter::new(&payload[4..]) {
                    if ty == CTRL_ATTR_FAMILY_ID {
                        return Ok(attr_u16(value)?);
                    }
                }
            }
            _ => {}
        }
    }
    Err(IpvsError::Protocol(format!(
        "generic netlink family {name:?} not found; is IPVS available?"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_are_aligned_and_typed() {
        let mut buf = BytesMut::new();
        put_attr_str(&mut buf, IPVS_SVC_ATTR_SCHED_NAME, "rr");
        // 4 header + "rr\0" padded to 4.
        assert_eq!(buf.len(), 8);
        let (ty, payload) = AttrIter::new(&buf).next().unwrap();
        assert_eq!(ty, IPVS_SVC_ATTR_SCHED_NAME);
        assert_eq!(attr_str(payload), "rr");
    }

    #[test]
    fn nested_flag_is_masked_off_on_iteration() {
        let mut inner = BytesMut::new();
        put_attr_u16(&mut inner, IPVS_SVC_ATTR_AF, AF_INET);
        let mut outer = BytesMut::new();
        put_nested(&mut outer, IPVS_CMD_ATTR_SERVICE, &inner);

        let (ty, payload) = AttrIter::new(&outer).next().unwrap();
        assert_eq!(ty, IPVS_CMD_ATTR_SERVICE);
        let (inner_ty, inner_payload) = AttrIter::new(payload).next().unwrap();
        assert_eq!(inner_ty, IPVS_SVC_ATTR_AF);
        assert_eq!(attr_u16(inner_payload).unwrap(), AF_INET);
    }

    #[test]
    fn service_attrs_round_trip_through_parser() {
        let key = VirtualServiceKey {
            ip: "10.1.1.1".to_string(),
            port: 80,
            protocol: Protocol::Tcp as i32,
        };
        let config = VirtualServiceConfig {
            scheduler: "sh".to_string(),
            flags: vec!["flag-1".to_string()],
            persistence_timeout: Some(UInt32Value::new(300)),
        };

        let attrs = service_attrs(&key, &config).unwrap();
        let (parsed_key, parsed_config) = parse_service(&attrs).unwrap().unwrap();
        assert_eq!(parsed_key, key);
        assert_eq!(parsed_config.scheduler, "sh");
        assert_eq!(parsed_config.flags, vec!["flag-1"]);
        assert_eq!(parsed_config.persistence_timeout(), Some(300));
    }

    #[test]
    fn dest_attrs_round_trip_through_parser() {
        let key = RealServerKey {
            ip: "172.16.1.1".to_string(),
            port: 9090,
        };
        let config = RealServerConfig {
            weight: Some(UInt32Value::new(2)),
            forward: ForwardMethod::Route as i32,
        };

        let attrs = dest_attrs(&key, &config).unwrap();
        let (parsed_key, parsed_config) = parse_dest(&attrs).unwrap();
        assert_eq!(parsed_key, key);
        assert_eq!(parsed_config.weight(), Some(2));
        assert_eq!(parsed_config.forward, ForwardMethod::Route as i32);
    }

    #[test]
    fn fwmark_and_non_inet_services_are_skipped() {
        let mut buf = BytesMut::new();
        put_attr_u16(&mut buf, IPVS_SVC_ATTR_AF, AF_INET);
        put_attr_u32(&mut buf, IPVS_SVC_ATTR_FWMARK, 7);
        assert!(parse_service(&buf).unwrap().is_none());
    }

    #[test]
    fn split_messages_walks_aligned_frames() {
        let msg = build_message(GENL_ID_CTRL, NLM_F_REQUEST, 1, CTRL_CMD_GETFAMILY, &[]);
        let messages = split_messages(&msg).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, GENL_ID_CTRL);
    }
}
