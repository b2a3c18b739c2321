use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::bail;
use if_addrs::IfAddr;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::config::{BROADCAST_PORT, DYNAMIC_PORT_RANGE};

/// The pair of sockets the transport operates per non-loopback IPv4 interface: a
///  unicast socket on a port from the dynamic range (with broadcast sending enabled),
///  and a shared broadcast-receive socket on the well-known port.
pub struct InterfaceSocket {
    pub interface_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast_addr: Ipv4Addr,
    pub unicast: Arc<UdpSocket>,
    pub broadcast: Arc<UdpSocket>,
}

impl InterfaceSocket {
    pub fn unicast_addr(&self) -> SocketAddr {
        self.unicast
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// All sockets of this node, one [InterfaceSocket] per usable interface. Built once at
///  startup; re-enumerating interfaces requires shutdown and restart.
pub struct SocketTable {
    pub(crate) interfaces: Vec<InterfaceSocket>,
}

impl SocketTable {
    /// Enumerate non-loopback IPv4 interfaces and bind the socket pair on each. An
    ///  interface with no free port in the dynamic range is skipped; having no usable
    ///  interface at all is an error.
    pub async fn discover() -> anyhow::Result<SocketTable> {
        let mut interfaces = Vec::new();

        for interface in if_addrs::get_if_addrs()? {
            if interface.is_loopback() {
                continue;
            }
            let IfAddr::V4(ref v4) = interface.addr else {
                continue;
            };

            let Some(unicast) = bind_first_free_port(v4.ip).await else {
                debug!(
                    "interface {} ({}): no free port in {:?} - skipping",
                    interface.name, v4.ip, DYNAMIC_PORT_RANGE
                );
                continue;
            };
            unicast.set_broadcast(true)?;

            let broadcast = bind_reusable(v4.ip, BROADCAST_PORT)?;
            let broadcast_addr = v4
                .broadcast
                .unwrap_or_else(|| Ipv4Addr::from(u32::from(v4.ip) | !u32::from(v4.netmask)));

            info!(
                "interface {}: unicast on {}, broadcast-receive on {}:{}",
                interface.name,
                unicast.local_addr()?,
                v4.ip,
                BROADCAST_PORT
            );

            interfaces.push(InterfaceSocket {
                interface_addr: v4.ip,
                netmask: v4.netmask,
                broadcast_addr,
                unicast: Arc::new(unicast),
                broadcast: Arc::new(broadcast),
            });
        }

        if interfaces.is_empty() {
            bail!("no usable non-loopback IPv4 interface");
        }
        Ok(SocketTable { interfaces })
    }

    /// The first interface sharing a network prefix with the target, i.e. the interface
    ///  whose unicast socket can reach the target directly. `None` if no interface matches.
    pub fn socket_for_target(&self, target: IpAddr) -> Option<&InterfaceSocket> {
        let IpAddr::V4(target) = target else {
            return None;
        };
        self.interfaces
            .iter()
            .find(|s| same_subnet(s.interface_addr, s.netmask, target))
    }
}

/// Whether `target` is in the interface's network, comparing the full netmask-masked
///  addresses. Masking both sides covers partial-byte prefixes (e.g. /20) as well.
pub(crate) fn same_subnet(interface_addr: Ipv4Addr, netmask: Ipv4Addr, target: Ipv4Addr) -> bool {
    let mask = u32::from(netmask);
    (u32::from(interface_addr) & mask) == (u32::from(target) & mask)
}

async fn bind_first_free_port(ip: Ipv4Addr) -> Option<UdpSocket> {
    for port in DYNAMIC_PORT_RANGE {
        match UdpSocket::bind(SocketAddrV4::new(ip, port)).await {
            Ok(socket) => return Some(socket),
            Err(e) => {
                trace!("binding {}:{} failed: {}", ip, port, e);
            }
        }
    }
    None
}

/// Bind with SO_REUSEADDR so several transports on one host can share the well-known
///  broadcast port.
fn bind_reusable(ip: Ipv4Addr, port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(SocketAddrV4::new(ip, port)).into())?;

    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket)?)
}
