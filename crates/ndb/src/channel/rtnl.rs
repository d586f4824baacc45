//! rtnetlink channel to the local stack or a named network namespace
//!
//! NIST 800-53 Rev5 [SC-7]: Boundary Protection - Kernel interface for network state
//! NIST 800-53 Rev5 [SI-4]: System Monitoring - Link/address/neighbour/route notifications
//!
//! Each channel owns two sockets: an event socket subscribed to the link,
//! address, neighbour and route multicast groups, and a request socket used
//! only for dumps. Keeping dumps off the event socket means a dump never has
//! to be untangled from concurrent notifications. A third socket, created
//! alongside them, only wakes the event socket when ingestion is stopped.

use super::{Channel, ChannelOptions, ChannelSource};
use crate::error::Result;
use std::path::PathBuf;

/// Where a channel's sockets live
#[derive(Debug, Clone, PartialEq, Eq)]
enum Namespace {
    Local,
    Path(PathBuf),
}

/// Source of rtnetlink channels
#[derive(Debug, Clone)]
pub struct RtnlSource {
    namespace: Namespace,
}

impl RtnlSource {
    /// The stack of the calling process
    pub fn local() -> Self {
        Self {
            namespace: Namespace::Local,
        }
    }

    /// A network namespace bound at `path` (e.g. `/var/run/netns/ns0`)
    pub fn netns(path: impl Into<PathBuf>) -> Self {
        Self {
            namespace: Namespace::Path(path.into()),
        }
    }
}

impl ChannelSource for RtnlSource {
    fn open(&self, options: &ChannelOptions) -> Result<Box<dyn Channel>> {
        open_channel(&self.namespace, options)
    }

    fn describe(&self) -> String {
        match &self.namespace {
            Namespace::Local => "rtnl:local".to_string(),
            Namespace::Path(path) => format!("netns:{}", path.display()),
        }
    }
}

#[cfg(target_os = "linux")]
fn open_channel(namespace: &Namespace, options: &ChannelOptions) -> Result<Box<dyn Channel>> {
    let channel = match namespace {
        Namespace::Local => linux::RtnlChannel::open(options)?,
        Namespace::Path(path) => linux::RtnlChannel::open_in_netns(path, options)?,
    };
    Ok(Box::new(channel))
}

#[cfg(not(target_os = "linux"))]
fn open_channel(namespace: &Namespace, _options: &ChannelOptions) -> Result<Box<dyn Channel>> {
    Err(crate::error::NdbError::Netlink(format!(
        "rtnetlink is not available on this platform ({:?})",
        namespace
    )))
}

#[cfg(target_os = "linux")]
mod linux {
    use super::super::{Channel, ChannelOptions, Interrupt};
    use crate::error::{NdbError, Result};
    use crate::event::Event;
    use crate::types::{Action, ChannelError, RtnlKind, RtnlMessage, Value};
    use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload};
    use netlink_packet_core::{NLM_F_DUMP, NLM_F_REQUEST};
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::link::{LinkAttribute, LinkMessage};
    use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
    use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use std::os::fd::AsRawFd;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{debug, trace, warn};

    const RTNLGRP_LINK: u32 = 1;
    const RTNLGRP_NEIGH: u32 = 3;
    const RTNLGRP_IPV4_IFADDR: u32 = 5;
    const RTNLGRP_IPV4_ROUTE: u32 = 7;
    const RTNLGRP_IPV6_IFADDR: u32 = 9;
    const RTNLGRP_IPV6_ROUTE: u32 = 11;

    /// Socket receive buffer size (1MB) for handling burst loads
    const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

    const READ_BUFFER_SIZE: usize = 64 * 1024;

    const NLMSG_NOOP: u16 = 1;
    const NLMSG_HDRLEN: usize = 16;

    fn group_mask() -> u32 {
        [
            RTNLGRP_LINK,
            RTNLGRP_NEIGH,
            RTNLGRP_IPV4_IFADDR,
            RTNLGRP_IPV4_ROUTE,
            RTNLGRP_IPV6_IFADDR,
            RTNLGRP_IPV6_ROUTE,
        ]
        .iter()
        .fold(0, |mask, group| mask | (1 << (group - 1)))
    }

    pub struct RtnlChannel {
        events: Socket,
        requests: Socket,
        waker: Arc<Waker>,
        buffer: Vec<u8>,
        sequence: u32,
    }

    /// Sends a NOOP to the event socket's port so a blocked read returns
    ///
    /// Netlink sockets refuse `shutdown(2)`, and unicast between ports only
    /// works inside one namespace, so the waker is opened with the channel.
    struct Waker {
        socket: Socket,
        port: u32,
    }

    impl Waker {
        fn open(events: &Socket) -> Result<Self> {
            let mut address = SocketAddr::new(0, 0);
            events
                .get_address(&mut address)
                .map_err(|e| NdbError::Netlink(format!("Failed to read socket address: {}", e)))?;
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| NdbError::Netlink(format!("Failed to create socket: {}", e)))?;
            socket
                .bind_auto()
                .map_err(|e| NdbError::Netlink(format!("Failed to bind socket: {}", e)))?;
            Ok(Self {
                socket,
                port: address.port_number(),
            })
        }

        fn wake(&self) {
            if let Err(e) = self
                .socket
                .send_to(&noop_message(), &SocketAddr::new(self.port, 0), 0)
            {
                debug!(error = %e, port = self.port, "Wake-up not delivered, relying on receive timeout");
            }
        }
    }

    fn noop_message() -> [u8; NLMSG_HDRLEN] {
        let mut buf = [0u8; NLMSG_HDRLEN];
        buf[0..4].copy_from_slice(&(NLMSG_HDRLEN as u32).to_ne_bytes());
        buf[4..6].copy_from_slice(&NLMSG_NOOP.to_ne_bytes());
        buf
    }

    impl RtnlChannel {
        pub fn open(options: &ChannelOptions) -> Result<Self> {
            let mut events = Socket::new(NETLINK_ROUTE)
                .map_err(|e| NdbError::Netlink(format!("Failed to create socket: {}", e)))?;
            events
                .bind(&SocketAddr::new(0, group_mask()))
                .map_err(|e| NdbError::Netlink(format!("Failed to bind socket: {}", e)))?;

            let mut requests = Socket::new(NETLINK_ROUTE)
                .map_err(|e| NdbError::Netlink(format!("Failed to create socket: {}", e)))?;
            requests
                .bind_auto()
                .map_err(|e| NdbError::Netlink(format!("Failed to bind socket: {}", e)))?;
            requests
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| NdbError::Netlink(format!("Failed to connect socket: {}", e)))?;

            tune_socket(&events, options.recv_timeout);
            let waker = Arc::new(Waker::open(&events)?);
            debug!(groups = group_mask(), port = waker.port, "rtnetlink channel bound");

            Ok(Self {
                events,
                requests,
                waker,
                buffer: Vec::with_capacity(READ_BUFFER_SIZE),
                sequence: 0,
            })
        }

        /// Create the sockets inside the namespace at `path`
        ///
        /// Sockets stay attached to the namespace they were created in, so
        /// only the short-lived helper thread ever switches namespaces.
        pub fn open_in_netns(path: &Path, options: &ChannelOptions) -> Result<Self> {
            let file = std::fs::File::open(path)?;
            let options = *options;
            let helper = std::thread::Builder::new()
                .name("ndb-netns-open".to_string())
                .spawn(move || -> Result<RtnlChannel> {
                    nix::sched::setns(&file, nix::sched::CloneFlags::CLONE_NEWNET)
                        .map_err(|e| NdbError::Netlink(format!("setns failed: {}", e)))?;
                    RtnlChannel::open(&options)
                })?;
            helper
                .join()
                .map_err(|_| NdbError::Netlink("netns helper thread panicked".to_string()))?
        }

        fn request(&mut self, payload: RouteNetlinkMessage) -> Result<u32> {
            self.sequence = self.sequence.wrapping_add(1);
            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;
            header.sequence_number = self.sequence;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.requests
                .send(&buf, 0)
                .map_err(|e| NdbError::Netlink(format!("Failed to send dump request: {}", e)))?;
            Ok(self.sequence)
        }
    }

    impl Channel for RtnlChannel {
        fn dump(&mut self, kind: RtnlKind) -> Result<Vec<Event>> {
            let payload = match kind {
                RtnlKind::Link => RouteNetlinkMessage::GetLink(LinkMessage::default()),
                RtnlKind::Address => RouteNetlinkMessage::GetAddress(AddressMessage::default()),
                RtnlKind::Neighbour => {
                    RouteNetlinkMessage::GetNeighbour(NeighbourMessage::default())
                }
                RtnlKind::Route => RouteNetlinkMessage::GetRoute(RouteMessage::default()),
            };
            let sequence = self.request(payload)?;

            let mut events = Vec::new();
            let mut buffer = Vec::with_capacity(READ_BUFFER_SIZE);
            loop {
                buffer.clear();
                let len = self
                    .requests
                    .recv(&mut buffer, 0)
                    .map_err(|e| NdbError::Netlink(format!("Failed to receive dump: {}", e)))?;
                if parse_buffer(&buffer[..len], Some(sequence), &mut events)? {
                    break;
                }
            }
            debug!(kind = kind.as_str(), count = events.len(), "dump complete");
            Ok(events)
        }

        fn recv(&mut self) -> Result<Vec<Event>> {
            self.buffer.clear();
            match self.events.recv(&mut self.buffer, 0) {
                Ok(len) => {
                    let mut events = Vec::new();
                    parse_buffer(&self.buffer[..len], None, &mut events)?;
                    trace!(count = events.len(), "received events");
                    Ok(events)
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    Ok(Vec::new())
                }
                Err(e) if e.raw_os_error() == Some(libc::ECONNRESET) => {
                    Ok(vec![Event::Error(ChannelError::target_gone())])
                }
                Err(e) => Err(NdbError::Netlink(format!("Failed to receive: {}", e))),
            }
        }

        fn interrupter(&self) -> Interrupt {
            let waker = self.waker.clone();
            Box::new(move || waker.wake())
        }
    }

    /// Receive buffer sizing, no-ENOBUFS and the bounded receive wait
    fn tune_socket(socket: &Socket, recv_timeout: Duration) {
        let fd = socket.as_raw_fd();
        unsafe {
            let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                warn!("Failed to set SO_RCVBUF, using default buffer size");
            }

            let enable: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_NETLINK,
                libc::NETLINK_NO_ENOBUFS,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                warn!("Failed to set NETLINK_NO_ENOBUFS");
            }

            let timeout = libc::timeval {
                tv_sec: recv_timeout.as_secs() as libc::time_t,
                tv_usec: recv_timeout.subsec_micros() as libc::suseconds_t,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            ) < 0
            {
                warn!("Failed to set SO_RCVTIMEO, reads will block until traffic");
            }
        }
    }

    /// Parse every message in `buf` into `out`
    ///
    /// Returns true once the end of the dump answering `sequence` was seen.
    fn parse_buffer(buf: &[u8], sequence: Option<u32>, out: &mut Vec<Event>) -> Result<bool> {
        let mut offset = 0;
        while offset < buf.len() {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..])
                .map_err(|e| NdbError::Netlink(format!("Failed to parse message: {}", e)))?;
            let length = msg.header.length as usize;
            if length == 0 {
                break;
            }
            offset += (length + 3) & !3;

            match msg.payload {
                NetlinkPayload::Done(_) => {
                    if sequence.is_some_and(|seq| seq == msg.header.sequence_number) {
                        return Ok(true);
                    }
                }
                NetlinkPayload::Error(err) => {
                    let code = err.code.map(|c| -c.get()).unwrap_or(0);
                    if code != 0 {
                        out.push(Event::Error(ChannelError::new(code, format!("{:?}", err))));
                    }
                    if sequence.is_some() {
                        return Ok(true);
                    }
                }
                NetlinkPayload::InnerMessage(inner) => out.push(decode(inner)),
                _ => {}
            }
        }
        Ok(false)
    }

    /// Map a route netlink message onto the typed event model
    pub fn decode(msg: RouteNetlinkMessage) -> Event {
        match msg {
            RouteNetlinkMessage::NewLink(m) => decode_link(m, Action::New).into(),
            RouteNetlinkMessage::DelLink(m) => decode_link(m, Action::Del).into(),
            RouteNetlinkMessage::NewAddress(m) => decode_address(m, Action::New).into(),
            RouteNetlinkMessage::DelAddress(m) => decode_address(m, Action::Del).into(),
            RouteNetlinkMessage::NewNeighbour(m) => decode_neighbour(m, Action::New).into(),
            RouteNetlinkMessage::DelNeighbour(m) => decode_neighbour(m, Action::Del).into(),
            RouteNetlinkMessage::NewRoute(m) => decode_route(m, Action::New).into(),
            RouteNetlinkMessage::DelRoute(m) => decode_route(m, Action::Del).into(),
            other => Event::Unsupported {
                name: format!("{:?}", other)
                    .split(['(', ' '])
                    .next()
                    .unwrap_or("unknown")
                    .to_string(),
            },
        }
    }

    fn format_lladdr(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn decode_link(m: LinkMessage, action: Action) -> RtnlMessage {
        let mut msg = RtnlMessage::new(RtnlKind::Link, action)
            .with("index", m.header.index)
            .with("flags", m.header.flags.bits());
        for attr in m.attributes {
            match attr {
                LinkAttribute::IfName(name) => msg.set("IFLA_IFNAME", name),
                LinkAttribute::Address(bytes) => msg.set("IFLA_ADDRESS", format_lladdr(&bytes)),
                LinkAttribute::Broadcast(bytes) => {
                    msg.set("IFLA_BROADCAST", format_lladdr(&bytes))
                }
                LinkAttribute::Mtu(mtu) => msg.set("IFLA_MTU", mtu),
                LinkAttribute::TxQueueLen(len) => msg.set("IFLA_TXQLEN", len),
                LinkAttribute::Qdisc(qdisc) => msg.set("IFLA_QDISC", qdisc),
                LinkAttribute::OperState(state) => {
                    msg.set("IFLA_OPERSTATE", format!("{:?}", state).to_uppercase())
                }
                _ => {}
            }
        }
        msg
    }

    pub fn decode_address(m: AddressMessage, action: Action) -> RtnlMessage {
        let mut msg = RtnlMessage::new(RtnlKind::Address, action)
            .with("family", u8::from(m.header.family))
            .with("prefixlen", m.header.prefix_len)
            .with("scope", u8::from(m.header.scope))
            .with("index", m.header.index);
        for attr in m.attributes {
            match attr {
                AddressAttribute::Address(addr) => msg.set("IFA_ADDRESS", addr.to_string()),
                AddressAttribute::Local(addr) => msg.set("IFA_LOCAL", addr.to_string()),
                AddressAttribute::Label(label) => msg.set("IFA_LABEL", label),
                AddressAttribute::Broadcast(addr) => msg.set("IFA_BROADCAST", addr.to_string()),
                _ => {}
            }
        }
        msg
    }

    pub fn decode_neighbour(m: NeighbourMessage, action: Action) -> RtnlMessage {
        let mut msg = RtnlMessage::new(RtnlKind::Neighbour, action)
            .with("ifindex", m.header.ifindex)
            .with("family", u8::from(m.header.family))
            .with("state", u16::from(m.header.state))
            .with("ndm_type", u8::from(m.header.kind));
        for attr in m.attributes {
            match attr {
                NeighbourAttribute::Destination(addr) => {
                    if let Some(text) = neighbour_address(&addr) {
                        msg.set("NDA_DST", text);
                    }
                }
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    msg.set("NDA_LLADDR", format_lladdr(&bytes))
                }
                _ => {}
            }
        }
        msg
    }

    fn neighbour_address(addr: &NeighbourAddress) -> Option<String> {
        match addr {
            NeighbourAddress::Inet(v4) => Some(v4.to_string()),
            NeighbourAddress::Inet6(v6) => Some(v6.to_string()),
            _ => None,
        }
    }

    pub fn decode_route(m: RouteMessage, action: Action) -> RtnlMessage {
        let mut msg = RtnlMessage::new(RtnlKind::Route, action)
            .with("family", u8::from(m.header.address_family))
            .with("dst_len", m.header.destination_prefix_length)
            .with("src_len", m.header.source_prefix_length)
            .with("tos", m.header.tos)
            .with("proto", u8::from(m.header.protocol))
            .with("scope", u8::from(m.header.scope))
            .with("type", u8::from(m.header.kind))
            .with("RTA_TABLE", m.header.table);
        for attr in m.attributes {
            match attr {
                RouteAttribute::Destination(addr) => msg.set("RTA_DST", route_address(&addr)),
                RouteAttribute::Gateway(addr) => msg.set("RTA_GATEWAY", route_address(&addr)),
                RouteAttribute::PrefSource(addr) => msg.set("RTA_PREFSRC", route_address(&addr)),
                RouteAttribute::Oif(oif) => msg.set("RTA_OIF", oif),
                RouteAttribute::Priority(priority) => msg.set("RTA_PRIORITY", priority),
                // RTA_TABLE carries the full 32-bit table id, the header only 8 bits
                RouteAttribute::Table(table) => msg.set("RTA_TABLE", Value::from(table)),
                _ => {}
            }
        }
        msg
    }

    fn route_address(addr: &RouteAddress) -> Option<String> {
        match addr {
            RouteAddress::Inet(v4) => Some(v4.to_string()),
            RouteAddress::Inet6(v6) => Some(v6.to_string()),
            _ => None,
        }
    }

}
