//! Upstream resolvers: the `exchange` contract plus the plain UDP/TCP
//! transport. Encrypted transports plug in behind the same trait.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::config::UpstreamSettings;
use crate::errors::DnsError;
use crate::message;
use crate::socks::OutboundProxy;

pub const TCP_SCHEME: &str = "tcp://";
pub const UDP_SCHEME: &str = "udp://";

#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub id: i32,
    pub address: String,
    pub timeout: Duration,
    pub ignore_outbound_proxy: bool,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    fn options(&self) -> &UpstreamOptions;

    /// Latest round-trip estimate; `None` until the first completed attempt.
    fn rtt_estimate(&self) -> Option<Duration>;

    /// Fold a completed attempt (successful or penalized) into the estimate.
    fn update_rtt_estimate(&self, rtt: Duration);

    async fn exchange(&self, request: &Message) -> Result<Message, DnsError>;
}

/// Split an address descriptor into a socket address and a TCP-only flag.
/// Encrypted schemes belong to other transports and are rejected here.
pub fn parse_address_descriptor(address: &str) -> anyhow::Result<(SocketAddr, bool)> {
    let (rest, tcp_only) = if let Some(rest) = address.strip_prefix(TCP_SCHEME) {
        (rest, true)
    } else if let Some(rest) = address.strip_prefix(UDP_SCHEME) {
        (rest, false)
    } else {
        for scheme in ["tls://", "https://", "quic://", "h3://", "sdns://"] {
            if address.starts_with(scheme) {
                bail!("unsupported upstream scheme: {address}");
            }
        }
        (address, false)
    };

    if let Ok(addr) = rest.parse::<SocketAddr>() {
        return Ok((addr, tcp_only));
    }
    // Bare address: default DNS port.
    if let Ok(ip) = rest.parse::<std::net::IpAddr>() {
        return Ok((SocketAddr::new(ip, 53), tcp_only));
    }
    // Bracketless IPv6 with no port also lands here.
    bail!("invalid upstream address: {address}")
}

pub fn create_upstream(
    settings: &UpstreamSettings,
    timeout: Duration,
    proxy: Option<Arc<OutboundProxy>>,
) -> anyhow::Result<Arc<dyn Upstream>> {
    let (addr, tcp_only) = parse_address_descriptor(&settings.address)
        .with_context(|| format!("upstream {}", settings.address))?;
    let options = UpstreamOptions {
        id: settings.id,
        address: settings.address.clone(),
        timeout,
        ignore_outbound_proxy: settings.ignore_outbound_proxy,
    };
    let proxy = if settings.ignore_outbound_proxy { None } else { proxy };
    Ok(Arc::new(PlainUpstream::new(options, addr, tcp_only, proxy)))
}

/// Plain DNS over UDP with a TCP retry on truncation; `tcp://` descriptors
/// skip UDP entirely.
pub struct PlainUpstream {
    options: UpstreamOptions,
    addr: SocketAddr,
    tcp_only: bool,
    proxy: Option<Arc<OutboundProxy>>,
    rtt: Mutex<Option<Duration>>,
}

impl PlainUpstream {
    pub fn new(
        options: UpstreamOptions,
        addr: SocketAddr,
        tcp_only: bool,
        proxy: Option<Arc<OutboundProxy>>,
    ) -> Self {
        Self {
            options,
            addr,
            tcp_only,
            proxy,
            rtt: Mutex::new(None),
        }
    }

    async fn exchange_udp(&self, wire: &[u8], request_id: u16) -> Result<Message, DnsError> {
        if let Some(proxy) = self.proxy.as_ref().filter(|p| p.supports_udp()) {
            let mut socket = proxy.clone().udp_bind(self.addr).await?;
            socket.send(wire).await?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let len = socket.recv(&mut buf).await?;
                if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == request_id {
                    return decode_response(&buf[..len]);
                }
            }
        }

        let bind: SocketAddr = if self.addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("bind addr")
        } else {
            "[::]:0".parse().expect("bind addr")
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.addr).await?;
        socket.send(wire).await?;

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let len = socket.recv(&mut buf).await?;
            // The socket is connected, so any datagram came from the
            // upstream; still require the id to match ours.
            if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == request_id {
                return decode_response(&buf[..len]);
            }
        }
    }

    async fn exchange_tcp(&self, wire: &[u8], request_id: u16) -> Result<Message, DnsError> {
        let mut stream = match self.proxy.as_ref() {
            Some(proxy) => proxy.connect_tcp(self.addr).await?,
            None => TcpStream::connect(self.addr).await?,
        };
        send_dns_packet(&mut stream, wire).await?;
        let reply = receive_dns_packet(&mut stream).await?;
        if reply.len() >= 2 && u16::from_be_bytes([reply[0], reply[1]]) != request_id {
            return Err(DnsError::ExchangeError("response id mismatch".into()));
        }
        decode_response(&reply)
    }

    async fn exchange_inner(&self, request: &Message) -> Result<Message, DnsError> {
        let wire = message::encode(request)?;
        if self.tcp_only {
            return self.exchange_tcp(&wire, request.id()).await;
        }
        let response = self.exchange_udp(&wire, request.id()).await?;
        if response.truncated() {
            debug!(upstream = %self.options.address, "truncated UDP response, retrying over TCP");
            return self.exchange_tcp(&wire, request.id()).await;
        }
        Ok(response)
    }
}

#[async_trait]
impl Upstream for PlainUpstream {
    fn options(&self) -> &UpstreamOptions {
        &self.options
    }

    fn rtt_estimate(&self) -> Option<Duration> {
        *self.rtt.lock().expect("rtt lock")
    }

    fn update_rtt_estimate(&self, rtt: Duration) {
        let mut guard = self.rtt.lock().expect("rtt lock");
        // Equal-weight smoothing over the previous estimate.
        *guard = Some(match *guard {
            Some(prev) => (prev + rtt) / 2,
            None => rtt,
        });
    }

    async fn exchange(&self, request: &Message) -> Result<Message, DnsError> {
        match timeout(self.options.timeout, self.exchange_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::TimedOut),
        }
    }
}

fn decode_response(wire: &[u8]) -> Result<Message, DnsError> {
    Message::from_bytes(wire).map_err(|e| DnsError::DecodeError(e.to_string()))
}

/// Write one DNS message with the RFC 1035 two-byte length prefix.
pub async fn send_dns_packet<S>(stream: &mut S, wire: &[u8]) -> Result<(), DnsError>
where
    S: AsyncWrite + Unpin + Send,
{
    if wire.len() > u16::MAX as usize {
        return Err(DnsError::InternalError("dns message too large for tcp".into()));
    }
    let mut framed = Vec::with_capacity(2 + wire.len());
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(wire);
    stream.write_all(&framed).await?;
    Ok(())
}

/// Read one complete length-prefixed DNS message.
pub async fn receive_dns_packet<S>(stream: &mut S) -> Result<Vec<u8>, DnsError>
where
    S: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
