//! SSDP Handler and Presence Announcer.
//!
//! A tree-driven listener: one [`SsdpListener`] per configured network interface, each
//! enumerating every root device's [`advertisement_targets`] out of the live [`Tree`] rather
//! than a fixed list of device/service tuples. The wire-format types below (`Announce`,
//! `SearchMessage`, `NotifyAliveMessage`, ..., `BroadcastMessage::parse_ssdp_payload`) describe
//! SSDP's datagram shapes, which don't depend on how many devices a host happens to advertise.

use core::str;
use std::{
    borrow::Cow,
    fmt::Display,
    io::{Cursor, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    ops::Range,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use rand::Rng;
use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::tree::{DeviceNode, Tree, Udn};
use crate::urn::{ResourceType, VersionMatch};
use crate::usn::Usn;

pub(crate) const SSDP_IP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub(crate) const SSDP_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(SSDP_IP_ADDR, 1900));
pub const DEFAULT_SSDP_TTL: u32 = 2;

async fn sleep_rand_millis_duration(range: &Range<u64>) {
    let range = {
        let mut rng = rand::rng();
        rng.random_range(range.clone())
    };
    tokio::time::sleep(Duration::from_millis(range)).await;
}

/// Binds one multicast UDP socket for `interface`, joining the SSDP group on that interface
/// specifically (rather than `Ipv4Addr::UNSPECIFIED`) so a multi-homed host can run one listener
/// per interface without them fighting over which interface outbound multicast leaves on.
fn bind_ssdp_socket(interface: Ipv4Addr, ttl: Option<u32>) -> anyhow::Result<UdpSocket> {
    let local_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 1900);
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_ttl(ttl.unwrap_or(DEFAULT_SSDP_TTL))?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    socket.join_multicast_v4(&SSDP_IP_ADDR, &interface)?;
    socket.set_multicast_if_v4(&interface)?;
    socket.bind(&SocketAddr::V4(local_addr).into())?;
    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

/// Every device/service this device tree should advertise under `root`, each paired with the
/// `Usn` a listener sends alongside it. Order follows UDA's own discovery-message table: the
/// root device gets `upnp:rootdevice` + its bare UDN + its device type, every embedded device
/// gets its bare UDN + device type, and every service anywhere in the subtree gets its service
/// type — all scoped to the owning device's UDN.
fn advertisement_targets(tree: &Tree, root: &DeviceNode) -> Vec<(NotificationType, Usn)> {
    let mut targets = vec![(
        NotificationType::RootDevice,
        Usn::root_device(root.udn.clone()),
    )];

    let mut stack = vec![root.key];
    while let Some(key) = stack.pop() {
        let device = tree.device(key);
        targets.push((
            NotificationType::Uuid(device.udn.clone()),
            Usn::device_udn(device.udn.clone()),
        ));
        targets.push((
            NotificationType::Urn(device.device_type.clone()),
            Usn::resource(device.udn.clone(), device.device_type.clone()),
        ));
        for service_key in &device.services {
            let service = tree.service(*service_key);
            targets.push((
                NotificationType::Urn(service.service_type.clone()),
                Usn::resource(device.udn.clone(), service.service_type.clone()),
            ));
        }
        stack.extend(device.children.iter().copied());
    }
    targets
}

#[derive(Debug, Clone)]
pub struct SsdpListenerConfig {
    pub ttl: Option<u32>,
    pub server: String,
    pub cache_control_secs: usize,
    pub individual_advertisement_count: usize,
    pub boot_id: usize,
    pub config_id: usize,
    /// Index into every root device's `locations`, i.e. which bound interface this listener
    /// speaks for.
    pub interface_index: usize,
}

pub struct SsdpListener {
    socket: Arc<UdpSocket>,
    tree: Arc<Tree>,
    server: String,
    cache_control: usize,
    individual_advertisement_count: usize,
    boot_id: usize,
    config_id: usize,
    locations: std::collections::HashMap<Udn, String>,
}

impl SsdpListener {
    pub async fn bind(tree: Arc<Tree>, interface: Ipv4Addr, config: SsdpListenerConfig) -> anyhow::Result<Self> {
        let socket = bind_ssdp_socket(interface, config.ttl).context("failed to bind ssdp socket")?;
        let locations = tree
            .roots()
            .filter_map(|root| {
                root.locations
                    .get(config.interface_index)
                    .map(|url| (root.udn.clone(), url.to_string()))
            })
            .collect();

        Ok(Self {
            socket: Arc::new(socket),
            tree,
            server: config.server,
            cache_control: config.cache_control_secs,
            individual_advertisement_count: config.individual_advertisement_count.max(1),
            boot_id: config.boot_id,
            config_id: config.config_id,
            locations,
        })
    }

    /// Runs until `cancellation_token` fires, at which point a final `ssdp:byebye` wave is sent
    /// for every advertised tuple before returning.
    pub async fn listen(&mut self, cancellation_token: CancellationToken, announce_interval: Duration) -> anyhow::Result<()> {
        self.announce_all().await?;

        let mut notify_interval = tokio::time::interval(announce_interval);
        notify_interval.tick().await;

        let mut buf = [0; 2048];
        loop {
            tokio::select! {
                Ok((read, sender)) = self.socket.recv_from(&mut buf) => {
                    let data = &buf[..read];
                    if let Err(e) = self.handle_message(data, sender) {
                        tracing::warn!("failed to handle ssdp message: {e}");
                    };
                }
                _ = cancellation_token.cancelled() => {
                    self.handle_shutdown().await?;
                    return Ok(())
                }
                _ = notify_interval.tick() => {
                    if let Err(e) = self.announce_all().await {
                        tracing::warn!("failed to send periodic announcement: {e}");
                    }
                }
            }
        }
    }

    fn targets(&self) -> Vec<(String, NotificationType, Usn)> {
        self.tree
            .roots()
            .filter_map(|root| {
                let location = self.locations.get(&root.udn)?.clone();
                Some(
                    advertisement_targets(&self.tree, root)
                        .into_iter()
                        .map(move |(nt, usn)| (location.clone(), nt, usn)),
                )
            })
            .flatten()
            .collect()
    }

    async fn announce_all(&self) -> anyhow::Result<()> {
        let targets = self.targets();
        let mut announcer =
            Announcer::<MulticastAnnounce>::new(self.socket.clone(), SSDP_ADDR, self.announce_template());
        for _ in 0..self.individual_advertisement_count {
            announcer.send_many(&targets).await?;
        }
        tracing::debug!(count = targets.len(), "sent presence announcements");
        Ok(())
    }

    fn announce_template(&self) -> AnnounceTemplate {
        AnnounceTemplate {
            cache_control: self.cache_control,
            server: self.server.clone(),
            boot_id: self.boot_id,
            config_id: self.config_id,
        }
    }

    fn handle_message(&self, data: &[u8], sender: SocketAddr) -> anyhow::Result<()> {
        let payload = str::from_utf8(data).context("construct string from bytes")?;
        let message = BroadcastMessage::parse_ssdp_payload(payload)?;
        match message {
            BroadcastMessage::Search(msg) => self.handle_search(msg, sender),
            BroadcastMessage::NotifyAlive(alive) => {
                tracing::trace!(nt = %alive.nt, "received alive message");
            }
            BroadcastMessage::NotifyByeBye(byebye) => {
                tracing::trace!(nt = %byebye.nt, "received byebye message");
            }
            BroadcastMessage::NotifyUpdate(update) => {
                tracing::trace!(nt = %update.nt, "received update message");
            }
        }
        Ok(())
    }

    fn handle_search(&self, msg: SearchMessage<'_>, sender: SocketAddr) {
        let targets = self.matching_targets(&msg.st);
        if targets.is_empty() {
            return;
        }
        tracing::debug!(
            user_agent = ?msg.user_agent,
            mx = ?msg.mx,
            st = %msg.st,
            addr = %sender,
            "search message"
        );
        let socket = self.socket.clone();
        let template = self.announce_template();
        let mx = msg.mx;
        tokio::spawn(async move {
            // GENA/SSDP delay unicast replies uniformly over [0, MX] seconds so a large swarm of
            // devices doesn't all answer a single control point in the same instant; MX is
            // clamped to [1, 5] per UDA §1.2.2.
            if let Some(mx) = mx {
                let mx = mx.clamp(1, 5) as u64;
                sleep_rand_millis_duration(&(0..mx * 1000)).await;
            }
            let mut announcer = Announcer::<UnicastAnnounce>::new(socket, sender, template);
            if let Err(err) = announcer.send_many(&targets).await {
                tracing::warn!(%sender, "failed to send search response: {err}");
            }
        });
    }

    fn matching_targets(&self, st: &NotificationType) -> Vec<(String, NotificationType, Usn)> {
        match st {
            NotificationType::All => self.targets(),
            NotificationType::RootDevice => self
                .targets()
                .into_iter()
                .filter(|(_, nt, _)| matches!(nt, NotificationType::RootDevice))
                .collect(),
            NotificationType::Uuid(udn) => self
                .targets()
                .into_iter()
                .filter(|(_, nt, _)| matches!(nt, NotificationType::Uuid(u) if u == udn))
                .collect(),
            NotificationType::Urn(queried) => self
                .targets()
                .into_iter()
                .filter(|(_, nt, _)| match nt {
                    NotificationType::Urn(hosted) => hosted.matches(queried, VersionMatch::AtLeast),
                    _ => false,
                })
                .collect(),
        }
    }

    async fn handle_shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("sending bye bye messages");
        for (_, nt, usn) in self.targets() {
            let byebye = NotifyByeByeMessage {
                host: SSDP_ADDR,
                usn,
                nt,
                nts: NotificationSubType::ByeBye,
                boot_id: self.boot_id,
                config_id: self.config_id,
            };
            self.socket
                .send_to(byebye.to_string().as_bytes(), SSDP_ADDR)
                .await?;
        }
        Ok(())
    }
}

struct Announcer<T: AnnounceHandler> {
    p: std::marker::PhantomData<T>,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    template: AnnounceTemplate,
    buf: Cursor<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct AnnounceTemplate {
    cache_control: usize,
    server: String,
    boot_id: usize,
    config_id: usize,
}

impl<T: AnnounceHandler> Announcer<T> {
    fn new(socket: Arc<UdpSocket>, dest: SocketAddr, template: AnnounceTemplate) -> Self {
        Self {
            p: std::marker::PhantomData,
            socket,
            dest,
            template,
            buf: Default::default(),
        }
    }

    async fn send(&mut self, location: &str, notification_type: NotificationType, usn: Usn) -> anyhow::Result<()> {
        let announce = Announce {
            cache_control: self.template.cache_control,
            location: location.to_string(),
            server: self.template.server.clone(),
            notification_type,
            usn,
            boot_id: self.template.boot_id,
            config_id: self.template.config_id,
            search_port: None,
        };
        T::handle_announce(&announce, &mut self.buf)?;
        let pos = self.buf.position() as usize;
        self.socket
            .send_to(&self.buf.get_ref()[..pos], self.dest)
            .await?;
        self.buf.set_position(0);
        self.buf.get_mut().clear();
        Ok(())
    }

    async fn send_many(&mut self, targets: &[(String, NotificationType, Usn)]) -> anyhow::Result<()> {
        for (location, nt, usn) in targets {
            self.send(location, nt.clone(), usn.clone()).await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum BroadcastMessage<'a> {
    Search(SearchMessage<'a>),
    NotifyAlive(NotifyAliveMessage<'a>),
    NotifyByeBye(NotifyByeByeMessage),
    NotifyUpdate(NotifyUpdateMessage<'a>),
}

#[derive(Debug, Clone)]
pub struct SearchMessage<'a> {
    /// For unicast requests, the field value shall be the domain name or IP address of the target device
    /// and either port 1900 or the SEARCHPORT provided by the target device.
    pub host: SocketAddr,
    pub st: NotificationType,
    /// Field value contains maximum wait time in seconds. shall be greater than or equal to 1 and should
    /// be less than 5 inclusive. Device responses should be delayed a random duration between 0 and this many
    /// seconds to balance load for the control point when it processes responses. This value is allowed to be
    /// increased if a large number of devices are expected to respond
    /// Missing in unicast search message
    pub mx: Option<usize>,
    /// Same as server in search messages
    pub user_agent: Option<&'a str>,
    /// A control point can request that a device replies to a TCP port on the control point
    /// Missing in unicast search message
    pub tcp_port: Option<u16>,
    /// Specifies the friendly name of the control point. The friendly name is vendor specific.
    /// Missing in unicast search message
    pub cp_fn: Option<&'a str>,
    /// Uuid of the control point.
    /// Missing in unicast search message
    /// Optional in multicast search message
    pub cp_uuid: Option<&'a str>,
}

impl SearchMessage<'_> {
    pub fn is_unicast(&self) -> bool {
        self.mx.is_none()
    }
}

impl Display for SearchMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "M-SEARCH * HTTP/1.1\r\n\
HOST: {host}\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: {search_target}\r\n",
            host = self.host,
            search_target = self.st,
        )?;
        if let Some(user_agent) = self.user_agent {
            write!(f, "USER-AGENT: {user_agent}\r\n")?;
        }
        if let Some(mx) = self.mx {
            write!(f, "MX: {mx}\r\n")?;
        }
        if let Some(tcp_port) = self.tcp_port {
            write!(f, "TCPPORT.UPNP.ORG: {tcp_port}\r\n")?;
        }
        if let Some(cp_fn) = self.cp_fn {
            write!(f, "CPFN.UPNP.ORG: {cp_fn}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

pub trait AnnounceHandler {
    fn handle_announce(announce: &Announce, f: impl Write) -> anyhow::Result<()>;
    fn parse_announce(announce: &str) -> anyhow::Result<Announce>;
}

/// Multicast announce aka notify with nts: ssdp:alive or advertisement
pub struct MulticastAnnounce;

impl AnnounceHandler for MulticastAnnounce {
    fn handle_announce(a: &Announce, mut f: impl Write) -> anyhow::Result<()> {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
CACHE-CONTROL: max-age={cache_control}\r\n\
LOCATION: {location}\r\n\
NT: {nt}\r\n\
NTS: ssdp:alive\r\n\
SERVER: {server}\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n",
            cache_control = a.cache_control,
            location = a.location,
            nt = a.notification_type,
            server = a.server,
            usn = a.usn,
            boot_id = a.boot_id,
            config_id = a.config_id,
        )?;
        if let Some(search_port) = a.search_port {
            write!(f, "SEARCHPORT.UPNP.ORG: {search_port}\r\n")?;
        }
        write!(f, "\r\n")?;
        Ok(())
    }

    fn parse_announce(announce: &str) -> anyhow::Result<Announce> {
        let mut cache_control = None;
        let mut location = None;
        let mut server = None;
        let mut notification_type = None;
        let mut usn = None;
        let mut boot_id = None;
        let mut config_id = None;
        let search_port = None;
        let mut lines = announce.lines();
        anyhow::ensure!(lines.next() == Some("NOTIFY * HTTP/1.1"));
        let headers = lines.filter_map(|l| l.split_once(':'));

        for (name, value) in headers {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "cache-control" => {
                    let (prefix, cache_duration) =
                        value.split_once('=').context("split cache control")?;
                    anyhow::ensure!(prefix.trim() == "max-age");
                    cache_control = Some(cache_duration.parse().context("parse duration seconds")?)
                }
                "location" => location = Some(value.to_owned()),
                "server" => server = Some(value.to_owned()),
                "nt" => notification_type = NotificationType::from_str(value).map(Some)?,
                "nts" => anyhow::ensure!(value == "ssdp:alive"),
                "usn" => usn = Usn::from_str(value).map(Some)?,
                "configid.upnp.org" => config_id = Some(value.parse().context("parse configid")?),
                "bootid.upnp.org" => boot_id = Some(value.parse().context("parse boot_id")?),
                _ => (),
            }
        }

        let cache_control = cache_control.context("parse cache_control")?;
        let location = location.context("parse location")?;
        let server = server.context("parse server")?;
        let notification_type = notification_type.context("parse notification_type")?;
        let usn = usn.context("parse usn")?;
        let boot_id = boot_id.unwrap_or_default();
        let config_id = config_id.unwrap_or_default();

        Ok(Announce {
            cache_control,
            location,
            server,
            notification_type,
            usn,
            boot_id,
            config_id,
            search_port,
        })
    }
}

/// Uniscast announce aka search response.
pub struct UnicastAnnounce;

impl AnnounceHandler for UnicastAnnounce {
    fn handle_announce(a: &Announce, mut f: impl Write) -> anyhow::Result<()> {
        let now = time::OffsetDateTime::now_utc();
        let format = time::format_description::parse_borrowed::<2>("[weekday repr:short], [day padding:zero] [month repr:short] [year] [hour]:[minute]:[second] GMT").expect("infallible");
        let formatted_date = now.format(&format).expect("infallible");
        write!(
            f,
            "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age={cache_control}\r\n\
LOCATION: {location}\r\n\
SERVER: {server}\r\n\
EXT:\r\n\
ST: {st}\r\n\
DATE: {date}\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n",
            cache_control = a.cache_control,
            location = a.location,
            server = a.server,
            st = a.notification_type,
            date = formatted_date,
            usn = a.usn,
            boot_id = a.boot_id,
            config_id = a.config_id,
        )?;
        if let Some(search_port) = a.search_port {
            write!(f, "SEARCHPORT.UPNP.ORG: {search_port}\r\n")?;
        }
        write!(f, "\r\n")?;
        Ok(())
    }

    fn parse_announce(announce: &str) -> anyhow::Result<Announce> {
        let mut cache_control = None;
        let mut location = None;
        let mut server = None;
        let mut notification_type = None;
        let mut usn = None;
        let mut boot_id = None;
        let mut config_id = None;
        let mut search_port = None;
        let mut lines = announce.lines();
        anyhow::ensure!(lines.next() == Some("HTTP/1.1 200 OK"));
        let headers = lines.filter_map(|l| l.split_once(':'));

        for (name, value) in headers {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "cache-control" => {
                    let (prefix, cache_duration) =
                        value.split_once('=').context("split cache control")?;
                    anyhow::ensure!(prefix.trim() == "max-age");
                    cache_control = Some(cache_duration.parse().context("parse duration seconds")?)
                }
                "location" => location = Some(value.to_owned()),
                "server" => server = Some(value.to_owned()),
                "st" => notification_type = NotificationType::from_str(value).map(Some)?,
                "usn" => usn = Usn::from_str(value).map(Some)?,
                "searchport.upnp.org" => {
                    search_port = Some(value.parse().context("parse searchport")?)
                }
                "configid.upnp.org" => config_id = Some(value.parse().context("parse configid")?),
                "bootid.upnp.org" => boot_id = Some(value.parse().context("parse boot_id")?),
                _ => (),
            }
        }

        let cache_control = cache_control.context("parse cache_control")?;
        let location = location.context("parse location")?;
        let server = server.context("parse server")?;
        let notification_type = notification_type.context("parse notification_type")?;
        let usn = usn.context("parse usn")?;
        let boot_id = boot_id.unwrap_or_default();
        let config_id = config_id.unwrap_or_default();

        Ok(Announce {
            cache_control,
            location,
            server,
            notification_type,
            usn,
            boot_id,
            config_id,
            search_port,
        })
    }
}

/// Responses to search requests are intentionally parallel to advertisements, and as such,
/// follow the same pattern as listed for NOTIFY with ssdp:alive (above) except that instead of the NT
/// header field in response is an ST header field in advertisement (notification_type).
#[derive(Debug, Clone)]
pub struct Announce {
    pub cache_control: usize,
    pub location: String,
    pub server: String,
    pub notification_type: NotificationType,
    pub usn: Usn,
    pub boot_id: usize,
    pub config_id: usize,
    pub search_port: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum NotificationType {
    /// `ssdp:all` A wildcard value that indicates the search is for all devices and services on the network. This is used to discover any UPnP device or service
    All,
    /// `upnp:rootdevice` A root device is a device that can be used to discover other UPnP devices and services.
    RootDevice,
    /// The UDN represents a unique identifier for a device.
    Uuid(Udn),
    Urn(ResourceType),
}

impl FromStr for NotificationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:all" => Self::All,
            "upnp:rootdevice" => Self::RootDevice,
            rest if rest.starts_with("urn:") => Self::Urn(ResourceType::from_str(rest)?),
            rest if rest.starts_with("uuid:") => Self::Uuid(Udn::from_str(rest)?),
            rest => Err(anyhow::anyhow!("Unknown notification type: {rest}"))?,
        })
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::All => write!(f, "ssdp:all"),
            NotificationType::RootDevice => write!(f, "upnp:rootdevice"),
            NotificationType::Uuid(udn) => write!(f, "{udn}"),
            NotificationType::Urn(urn) => write!(f, "{urn}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
/// Notification subtype. Specifies type of notification.
pub enum NotificationSubType {
    /// This is typically sent when a device is first powered on or joins the network, or to periodically reaffirm its presence
    Alive,
    /// Sent when a device is being removed from the network or shutting down.
    ByeBye,
    /// Used when there are changes in the device's details.
    Update,
}

impl Display for NotificationSubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            NotificationSubType::Alive => "alive",
            NotificationSubType::ByeBye => "byebye",
            NotificationSubType::Update => "update",
        };
        write!(f, "ssdp:{msg}")
    }
}

impl FromStr for NotificationSubType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:alive" => Self::Alive,
            "ssdp:byebye" => Self::ByeBye,
            "ssdp:update" => Self::Update,
            rest => Err(anyhow::anyhow!("Unknown notification sub type: {rest}"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NotifyByeByeMessage {
    pub host: SocketAddr,
    /// The Unique Service Name, which combines a unique identifier (UUID) with the device or service type.
    /// This allows clients to uniquely identify the device or service instance
    pub usn: Usn,
    /// Notification type. Specifies type of device/service.
    pub nt: NotificationType,
    /// Notification subtype. Specifies type of notification.
    pub nts: NotificationSubType,
    pub boot_id: usize,
    pub config_id: usize,
}

impl Display for NotifyByeByeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
NT: {nt}\r\n\
NTS: {nts}\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n\r\n",
            nt = self.nt,
            nts = self.nts,
            usn = self.usn,
            boot_id = self.boot_id,
            config_id = self.config_id,
        )
    }
}

#[derive(Debug, Clone)]
pub struct NotifyUpdateMessage<'a> {
    pub host: SocketAddr,
    /// The Unique Service Name, which combines a unique identifier (UUID) with the device or service type.
    /// This allows clients to uniquely identify the device or service instance
    pub usn: &'a str,
    /// Url of device description
    pub location: &'a str,
    /// Notification type. Specifies type of device/service.
    pub nt: NotificationType,
    /// Notification subtype. Specifies type of notification.
    pub nts: NotificationSubType,
    pub boot_id: usize,
    pub config_id: usize,
    pub next_boot_id: usize,
    pub search_port: Option<u16>,
}

impl Display for NotifyUpdateMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
LOCATION: {location}\r\n\
NT: {nt}\r\n\
NTS: {nts}\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n\
NEXTBOOTID.UPNP.ORG: {next_boot_id}\r\n",
            location = self.location,
            nt = self.nt,
            nts = self.nts,
            usn = self.usn,
            boot_id = self.boot_id,
            config_id = self.config_id,
            next_boot_id = self.next_boot_id,
        )?;
        if let Some(search_port) = self.search_port {
            write!(f, "SEARCHPORT.UPNP.ORG: {search_port}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

#[derive(Debug, Clone)]
pub struct NotifyAliveMessage<'a> {
    pub host: SocketAddr,
    /// Url of device description
    pub location: Cow<'a, str>,
    /// The Unique Service Name, which combines a unique identifier (UUID) with the device or service type.
    /// This allows clients to uniquely identify the device or service instance
    pub usn: Usn,
    /// Notification type. Specifies type of device/service.
    pub nt: NotificationType,
    /// Notification subtype. Specifies type of notification.
    pub nts: NotificationSubType,
    /// Cache life time in seconds
    pub cache_control: usize,
    /// Information about the software used by the origin server to handle the request
    pub server: &'a str,
    pub boot_id: usize,
    pub config_id: usize,
    pub search_port: Option<u16>,
}

impl Display for NotifyAliveMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
CACHE-CONTROL: max-age={cache_control}\r\n\
LOCATION: {location}\r\n\
NT: {nt}\r\n\
NTS: {nts}\r\n\
SERVER: {server}\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n",
            cache_control = self.cache_control,
            location = self.location,
            nt = self.nt,
            nts = self.nts,
            server = self.server,
            usn = self.usn,
            boot_id = self.boot_id,
            config_id = self.config_id,
        )?;
        if let Some(search_port) = self.search_port {
            write!(f, "SEARCHPORT.UPNP.ORG: {search_port}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

impl BroadcastMessage<'_> {
    pub fn parse_ssdp_payload(s: &str) -> anyhow::Result<BroadcastMessage<'_>> {
        let mut lines = s.lines();
        let request_line = lines.next().context("request line")?;
        let (method, _) = request_line.split_once(' ').context("split request line")?;
        let headers = lines.filter_map(|l| l.split_once(": "));
        match method {
            "M-SEARCH" => {
                let mut host = None;
                let mut st = None;
                let mut mx = None;
                let mut user_agent = None;
                let mut cp_fn = None;
                let mut cp_uuid = None;
                let mut tcp_port = None;
                for (name, value) in headers {
                    let value = value.trim();
                    match name.to_ascii_lowercase().as_str() {
                        "host" => {
                            host = Some(SocketAddr::V4(
                                SocketAddrV4::from_str(value).context("parse host address")?,
                            ));
                        }
                        "st" => st = Some(NotificationType::from_str(value)?),
                        "mx" => mx = Some(value.parse()?),
                        "user-agent" => user_agent = Some(value),
                        "cpfn.upnp.org" => cp_fn = Some(value),
                        "cpuuid.upnp.org" => cp_uuid = Some(value),
                        "tcpport.upnp.org" => {
                            tcp_port = Some(value.parse().context("parse tcp port")?)
                        }
                        _ => (),
                    }
                }
                let host = host.context("missing host")?;
                let st = st.context("missing st")?;
                // Compatibility with upnp 1.0
                let search_message = SearchMessage {
                    host,
                    st,
                    mx,
                    user_agent,
                    cp_fn,
                    cp_uuid,
                    tcp_port,
                };
                Ok(BroadcastMessage::Search(search_message))
            }
            "NOTIFY" => {
                let mut host = None;
                let mut nts = None;
                let mut location = None;
                let mut nt = None;
                let mut usn = None;
                let mut cache_control = None;
                let mut server = None;
                let mut boot_id = None;
                let mut config_id = None;
                let mut search_port = None;
                let mut next_boot_id = None;
                for (name, value) in headers {
                    let value = value.trim();
                    match name.to_ascii_lowercase().as_str() {
                        "host" => {
                            host = Some(SocketAddr::V4(
                                SocketAddrV4::from_str(value).context("parse host address")?,
                            ));
                        }
                        "location" => location = Some(value),
                        "usn" => usn = Some(value),
                        "nt" => nt = Some(NotificationType::from_str(value)?),
                        "nts" => nts = Some(NotificationSubType::from_str(value)?),
                        "server" => server = Some(value),
                        "cache-control" => {
                            let (prefix, cache_duration) =
                                value.split_once('=').context("split cache control")?;
                            anyhow::ensure!(prefix.trim() == "max-age");
                            cache_control =
                                Some(cache_duration.parse().context("parse duration seconds")?)
                        }
                        "bootid.upnp.org" => {
                            boot_id = Some(value.parse().context("parse boot id")?)
                        }
                        "configid.upnp.org" => {
                            config_id = Some(value.parse().context("parse config id")?)
                        }
                        "searchport.upnp.org" => {
                            search_port = Some(value.parse().context("parse search port")?)
                        }
                        "nextbootid.upnp.org" => {
                            next_boot_id = Some(value.parse().context("parse next boot id")?)
                        }
                        _ => (),
                    }
                }
                let nt = nt.context("missing nt")?;
                let nts = nts.context("missing nts")?;
                let host = host.context("missing host")?;
                let usn = usn.context("missing usn")?;
                let boot_id = boot_id.unwrap_or_default();
                let config_id = config_id.unwrap_or_default();
                match nts {
                    NotificationSubType::Alive => {
                        let location = location.context("missing location")?;
                        let cache_control = cache_control.context("missing cache control")?;
                        let server = server.context("missing server")?;
                        let notify_message = NotifyAliveMessage {
                            host,
                            location: Cow::Borrowed(location),
                            usn: Usn::from_str(usn)?,
                            nt,
                            nts,
                            cache_control,
                            server,
                            boot_id,
                            config_id,
                            search_port,
                        };
                        Ok(BroadcastMessage::NotifyAlive(notify_message))
                    }
                    NotificationSubType::ByeBye => {
                        let byebye_message = NotifyByeByeMessage {
                            host,
                            usn: Usn::from_str(usn)?,
                            nt,
                            nts,
                            boot_id,
                            config_id,
                        };
                        Ok(BroadcastMessage::NotifyByeBye(byebye_message))
                    }
                    NotificationSubType::Update => {
                        let next_boot_id = next_boot_id.context("missing next boot id")?;
                        let update_message = NotifyUpdateMessage {
                            location: location.context("missing location")?,
                            host,
                            usn,
                            nt,
                            nts,
                            boot_id,
                            config_id,
                            next_boot_id,
                            search_port,
                        };
                        Ok(BroadcastMessage::NotifyUpdate(update_message))
                    }
                }
            }
            _ => Err(anyhow::anyhow!("Unknown method encountered: {method}")),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::BroadcastMessage;

    #[test]
    fn prase_broadcast_message() {
        let notify = r#"NOTIFY * HTTP/1.1
HOST: 239.255.255.250:1900
CACHE-CONTROL: max-age=1800
LOCATION: http://192.168.1.1:49152/IGDdevicedesc.xml
OPT: "http://schemas.upnp.org/upnp/1/0/"; ns=01
01-NLS: 2c118d74-1dd2-11b2-888a-b21a12907e76
NT: urn:schemas-upnp-org:service:WANEthernetLinkConfig:1
NTS: ssdp:alive
SERVER: Linux/3.14.77, UPnP/1.0, Portable SDK for UPnP devices/1.6.19
X-User-Agent: redsonic
USN: uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::urn:schemas-upnp-org:service:WANEthernetLinkConfig:1"#;

        let notify_message = BroadcastMessage::parse_ssdp_payload(notify).unwrap();
        assert!(matches!(
            notify_message,
            BroadcastMessage::NotifyAlive { .. }
        ));
        let m_search = r#"M-SEARCH * HTTP/1.1
HOST: 239.255.255.250:1900
MAN: "ssdp:discover"
MX: 1
ST: urn:dial-multiscreen-org:service:dial:1
USER-AGENT: Microsoft Edge/128.0.2739.67 Windows"#;
        let m_search_message = BroadcastMessage::parse_ssdp_payload(m_search).unwrap();
        assert!(matches!(m_search_message, BroadcastMessage::Search { .. }));
    }
}
