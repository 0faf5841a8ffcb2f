//! Outbound proxy driver: SOCKS4 CONNECT, SOCKS5 CONNECT and UDP ASSOCIATE
//! (RFC 1928/1929) and plain HTTP CONNECT. Upstreams that did not opt out
//! request their sockets here instead of dialing directly.
//!
//! One UDP association is shared by every proxied UDP peer: the first peer
//! opens a control TCP connection and issues UDP_ASSOCIATE, later peers
//! reuse the relay endpoint, and closing the last peer tears the control
//! connection down. If the control connection dies first, every peer on it
//! is failed with `UDP_ASSOCIATION_TERMINATED`.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use base64::prelude::*;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::{OutboundProxyAuth, OutboundProxyProtocol, OutboundProxySettings};
use crate::errors::SocketError;

const SOCKS_VERSION_4: u8 = 0x04;
const SOCKS_VERSION_5: u8 = 0x05;

const S4CMD_CONNECT: u8 = 0x01;
const S4REPLY_GRANTED: u8 = 0x5A;

const S5AUTH_NONE: u8 = 0x00;
const S5AUTH_USER_PASS: u8 = 0x02;
const S5AUTH_VERSION: u8 = 0x01;
const S5AUTH_SUCCESS: u8 = 0x00;

const S5CMD_CONNECT: u8 = 0x01;
const S5CMD_UDP_ASSOCIATE: u8 = 0x03;

const S5ATYP_IPV4: u8 = 0x01;
const S5ATYP_IPV6: u8 = 0x04;

const S5REPLY_SUCCEEDED: u8 = 0x00;

// Userid sent in SOCKS4 requests, NUL included.
const SOCKS4_USERID: &[u8] = b"adguard\0";

pub struct OutboundProxy {
    settings: OutboundProxySettings,
    proxy_addr: SocketAddr,
    next_conn_id: AtomicU32,
    association: Mutex<Option<Arc<UdpAssociation>>>,
    // Serializes association setup so later peers park on the first one.
    association_setup: tokio::sync::Mutex<()>,
}

struct UdpAssociation {
    relay_addr: SocketAddr,
    peers: DashMap<u32, ()>,
    terminated_rx: watch::Receiver<Option<SocketError>>,
    control_task: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundProxy {
    pub fn new(settings: OutboundProxySettings) -> anyhow::Result<Self> {
        let ip: IpAddr = settings
            .address
            .parse()
            .map_err(|_| anyhow::anyhow!("outbound proxy address is not an IP literal: {}", settings.address))?;
        Ok(Self {
            proxy_addr: SocketAddr::new(ip, settings.port),
            settings,
            next_conn_id: AtomicU32::new(1),
            association: Mutex::new(None),
            association_setup: tokio::sync::Mutex::new(()),
        })
    }

    pub fn supports_udp(&self) -> bool {
        self.settings.protocol == OutboundProxyProtocol::Socks5Udp
    }

    pub fn protocol(&self) -> OutboundProxyProtocol {
        self.settings.protocol
    }

    /// Open a TCP stream to `dst` tunneled through the proxy. With
    /// `ignore_if_unavailable`, an unreachable proxy degrades to a direct
    /// connection.
    pub async fn connect_tcp(&self, dst: SocketAddr) -> Result<TcpStream, SocketError> {
        let mut stream = match TcpStream::connect(self.proxy_addr).await {
            Ok(stream) => stream,
            Err(err) if self.settings.ignore_if_unavailable => {
                debug!(proxy = %self.proxy_addr, error = %err, "proxy unreachable, connecting directly");
                return Ok(TcpStream::connect(dst).await?);
            }
            Err(err) => return Err(err.into()),
        };

        match self.settings.protocol {
            OutboundProxyProtocol::Socks4 => {
                socks4_connect(&mut stream, dst).await?;
            }
            OutboundProxyProtocol::Socks5 | OutboundProxyProtocol::Socks5Udp => {
                socks5_authenticate(&mut stream, self.settings.auth.as_ref()).await?;
                socks5_request(&mut stream, S5CMD_CONNECT, dst).await?;
            }
            OutboundProxyProtocol::HttpConnect => {
                http_connect(&mut stream, dst, self.settings.auth.as_ref()).await?;
            }
            OutboundProxyProtocol::HttpsConnect => {
                return Err(SocketError::Io("https proxies are not supported".into()));
            }
        }
        Ok(stream)
    }

    /// A UDP socket whose datagrams travel through the proxy's UDP relay.
    pub async fn udp_bind(self: Arc<Self>, dst: SocketAddr) -> Result<SocksUdpSocket, SocketError> {
        if !self.supports_udp() {
            return Err(SocketError::InvalidConnState(
                "outbound proxy protocol has no UDP support".into(),
            ));
        }

        let assoc = Self::ensure_association(&self).await?;

        let bind: SocketAddr = if assoc.relay_addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("bind addr")
        } else {
            "[::]:0".parse().expect("bind addr")
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(assoc.relay_addr).await?;

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if assoc.peers.insert(conn_id, ()).is_some() {
            return Err(SocketError::DuplicateId(conn_id));
        }
        trace!(conn_id, relay = %assoc.relay_addr, "udp peer joined association");

        Ok(SocksUdpSocket {
            socket,
            dst,
            conn_id,
            terminated: assoc.terminated_rx.clone(),
            assoc,
            proxy: self,
        })
    }

    async fn ensure_association(this: &Arc<Self>) -> Result<Arc<UdpAssociation>, SocketError> {
        if let Some(assoc) = this.live_association() {
            return Ok(assoc);
        }

        let _setup = this.association_setup.lock().await;
        // Another peer may have won the setup race while we parked.
        if let Some(assoc) = this.live_association() {
            return Ok(assoc);
        }

        let mut control = TcpStream::connect(this.proxy_addr).await?;
        socks5_authenticate(&mut control, this.settings.auth.as_ref()).await?;
        // The destination in UDP_ASSOCIATE is advisory; all-zeroes means
        // "datagrams will come from wherever this socket sends".
        let placeholder: SocketAddr = "0.0.0.0:0".parse().expect("addr");
        let mut relay_addr = socks5_request(&mut control, S5CMD_UDP_ASSOCIATE, placeholder).await?;
        if relay_addr.ip().is_unspecified() {
            relay_addr.set_ip(this.proxy_addr.ip());
        }
        debug!(relay = %relay_addr, "udp association established");

        let (terminated_tx, terminated_rx) = watch::channel(None);
        let assoc = Arc::new(UdpAssociation {
            relay_addr,
            peers: DashMap::new(),
            terminated_rx,
            control_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run_control(
            control,
            terminated_tx,
            Arc::downgrade(this),
            Arc::downgrade(&assoc),
        ));
        *assoc.control_task.lock().expect("control task lock") = Some(task);
        *this.association.lock().expect("association lock") = Some(assoc.clone());
        Ok(assoc)
    }

    fn live_association(&self) -> Option<Arc<UdpAssociation>> {
        let slot = self.association.lock().expect("association lock");
        slot.as_ref()
            .filter(|assoc| assoc.terminated_rx.borrow().is_none())
            .cloned()
    }

    /// Keep the control connection alive; any inbound byte or a close drops
    /// the whole association.
    async fn run_control(
        mut control: TcpStream,
        terminated_tx: watch::Sender<Option<SocketError>>,
        proxy: Weak<OutboundProxy>,
        assoc: Weak<UdpAssociation>,
    ) {
        let mut buf = [0u8; 256];
        let cause = match control.read(&mut buf).await {
            Ok(0) => SocketError::ConnectionClosed,
            Ok(n) => SocketError::UnexpectedData(n),
            Err(err) => SocketError::from(err),
        };
        debug!(error = %cause, "udp association control connection lost");
        let _ = terminated_tx.send(Some(SocketError::UdpAssociationTerminated(cause.to_string())));
        if let Some(assoc) = assoc.upgrade() {
            assoc.peers.clear();
            if let Some(proxy) = proxy.upgrade() {
                proxy.clear_association(&assoc);
            }
        }
    }

    fn clear_association(&self, assoc: &Arc<UdpAssociation>) {
        let mut slot = self.association.lock().expect("association lock");
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, assoc)) {
            *slot = None;
        }
    }

    fn release_udp_peer(&self, assoc: &Arc<UdpAssociation>, conn_id: u32) {
        assoc.peers.remove(&conn_id);
        if !assoc.peers.is_empty() {
            return;
        }
        // Last peer gone: the control connection must not outlive it.
        trace!(conn_id, "last udp peer closed, tearing association down");
        self.clear_association(assoc);
        if let Some(task) = assoc.control_task.lock().expect("control task lock").take() {
            task.abort();
        }
    }
}

/// UDP socket speaking through a SOCKS5 relay. Dropping the last one on an
/// association closes the association's control connection.
pub struct SocksUdpSocket {
    socket: UdpSocket,
    dst: SocketAddr,
    conn_id: u32,
    terminated: watch::Receiver<Option<SocketError>>,
    assoc: Arc<UdpAssociation>,
    proxy: Arc<OutboundProxy>,
}

impl SocksUdpSocket {
    pub async fn send(&self, payload: &[u8]) -> Result<(), SocketError> {
        if let Some(err) = self.terminated.borrow().clone() {
            return Err(err);
        }
        let datagram = encode_udp_datagram(self.dst, payload);
        self.socket.send(&datagram).await?;
        Ok(())
    }

    /// Receive one relayed datagram into `buf`, header stripped.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut relay_buf = vec![0u8; buf.len() + 32];
        loop {
            tokio::select! {
                changed = self.terminated.changed() => {
                    let _ = changed;
                    let err = self.terminated.borrow().clone();
                    return Err(err.unwrap_or(SocketError::ConnectionClosed));
                }
                received = self.socket.recv(&mut relay_buf) => {
                    let len = received?;
                    let Some((_, payload)) = decode_udp_datagram(&relay_buf[..len]) else {
                        debug!(len, "dropping malformed relay datagram");
                        continue;
                    };
                    let n = payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    return Ok(n);
                }
            }
        }
    }
}

impl Drop for SocksUdpSocket {
    fn drop(&mut self) {
        self.proxy.release_udp_peer(&self.assoc, self.conn_id);
    }
}

/// SOCKS5 RFC 1928 §7 header, frag always zero. Domain destinations are not
/// produced by this proxy.
fn encode_udp_datagram(dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(22 + payload.len());
    out.extend_from_slice(&[0, 0, 0]); // rsv, rsv, frag
    match dst.ip() {
        IpAddr::V4(ip) => {
            out.push(S5ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(S5ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&dst.port().to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_udp_datagram(buf: &[u8]) -> Option<(SocketAddr, &[u8])> {
    if buf.len() < 4 || buf[2] != 0 {
        return None;
    }
    let (addr, rest) = match buf[3] {
        S5ATYP_IPV4 => {
            if buf.len() < 10 {
                return None;
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[4..8]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            (SocketAddr::new(IpAddr::from(octets), port), &buf[10..])
        }
        S5ATYP_IPV6 => {
            if buf.len() < 22 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            let port = u16::from_be_bytes([buf[20], buf[21]]);
            (SocketAddr::new(IpAddr::from(octets), port), &buf[22..])
        }
        _ => return None,
    };
    Some((addr, rest))
}

async fn socks4_connect<S>(stream: &mut S, dst: SocketAddr) -> Result<(), SocketError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let IpAddr::V4(ip) = dst.ip() else {
        return Err(SocketError::Io("socks4 supports only ipv4 destinations".into()));
    };
    let mut request = Vec::with_capacity(8 + SOCKS4_USERID.len());
    request.push(SOCKS_VERSION_4);
    request.push(S4CMD_CONNECT);
    request.extend_from_slice(&dst.port().to_be_bytes());
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(SOCKS4_USERID);
    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x00 {
        return Err(SocketError::BadProxyReply(format!("socks4 version {}", reply[0])));
    }
    if reply[1] != S4REPLY_GRANTED {
        return Err(SocketError::BadProxyReply(format!("socks4 status {:#x}", reply[1])));
    }
    Ok(())
}

async fn socks5_authenticate<S>(
    stream: &mut S,
    auth: Option<&OutboundProxyAuth>,
) -> Result<(), SocketError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut greeting = vec![SOCKS_VERSION_5, 1, S5AUTH_NONE];
    if auth.is_some() {
        greeting[1] = 2;
        greeting.push(S5AUTH_USER_PASS);
    }
    stream.write_all(&greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION_5 {
        return Err(SocketError::BadProxyReply(format!("socks5 version {}", reply[0])));
    }

    match reply[1] {
        S5AUTH_NONE => Ok(()),
        S5AUTH_USER_PASS => {
            let Some(auth) = auth else {
                return Err(SocketError::BadProxyReply(
                    "proxy demands credentials we did not offer".into(),
                ));
            };
            let user = auth.username.as_bytes();
            let pass = auth.password.as_bytes();
            let mut frame = Vec::with_capacity(3 + user.len() + pass.len());
            frame.push(S5AUTH_VERSION);
            frame.push(user.len().min(255) as u8);
            frame.extend_from_slice(&user[..user.len().min(255)]);
            frame.push(pass.len().min(255) as u8);
            frame.extend_from_slice(&pass[..pass.len().min(255)]);
            stream.write_all(&frame).await?;

            let mut auth_reply = [0u8; 2];
            stream.read_exact(&mut auth_reply).await?;
            if auth_reply[0] != S5AUTH_VERSION {
                return Err(SocketError::BadProxyReply(format!(
                    "auth version {}",
                    auth_reply[0]
                )));
            }
            if auth_reply[1] != S5AUTH_SUCCESS {
                return Err(SocketError::BadProxyReply(format!(
                    "auth status {}",
                    auth_reply[1]
                )));
            }
            Ok(())
        }
        method => Err(SocketError::BadProxyReply(format!("auth method {method:#x}"))),
    }
}

/// Issue CONNECT or UDP_ASSOCIATE and return the server-bound address.
async fn socks5_request<S>(stream: &mut S, cmd: u8, dst: SocketAddr) -> Result<SocketAddr, SocketError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[SOCKS_VERSION_5, cmd, 0]);
    match dst.ip() {
        IpAddr::V4(ip) => {
            request.push(S5ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.push(S5ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&dst.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION_5 {
        return Err(SocketError::BadProxyReply(format!("socks5 version {}", head[0])));
    }
    if head[1] != S5REPLY_SUCCEEDED {
        return Err(SocketError::BadProxyReply(format!("socks5 status {:#x}", head[1])));
    }

    let bound = match head[3] {
        S5ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            IpAddr::from(addr)
        }
        S5ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            IpAddr::from(addr)
        }
        atyp => {
            return Err(SocketError::BadProxyReply(format!("address type {atyp:#x}")));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(bound, u16::from_be_bytes(port)))
}

async fn http_connect<S>(
    stream: &mut S,
    dst: SocketAddr,
    auth: Option<&OutboundProxyAuth>,
) -> Result<(), SocketError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut request = format!("CONNECT {dst} HTTP/1.1\r\nHost: {dst}\r\n");
    if let Some(auth) = auth {
        let token = BASE64_STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read up to the blank line terminating the response head.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            return Err(SocketError::BadProxyReply("oversized connect response".into()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let granted = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'));
    if !granted {
        return Err(SocketError::BadProxyReply(status_line.to_string()));
    }
    Ok(())
}
