//! Public proxy surface: lifecycle, listeners, and the message entry point
//! used by embedders.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ProxySettings;
use crate::errors::InitError;
use crate::events::DnsProxyEvents;
use crate::forwarder::{DnsForwarder, PeerInfo, Transport};

pub struct DnsProxy {
    forwarder: Arc<DnsForwarder>,
    tasks: Vec<JoinHandle<()>>,
}

impl DnsProxy {
    /// Validate settings, build the forwarder, and bring up every
    /// configured listener (UDP and TCP on each address).
    pub async fn init(settings: ProxySettings, events: DnsProxyEvents) -> Result<Self, InitError> {
        let forwarder = DnsForwarder::init(settings, events)?;
        let mut tasks = Vec::new();

        let listeners = forwarder.settings().listeners.clone();
        for listener in &listeners {
            let addr: SocketAddr = listener
                .address
                .parse()
                .map_err(|_| InitError::ListenerInitError(format!("bad address: {}", listener.address)))?;

            let udp_workers = num_cpus::get().max(1);
            #[cfg(unix)]
            for worker_id in 0..udp_workers {
                let socket = create_reuseport_udp_socket(addr)
                    .and_then(|s| UdpSocket::from_std(s).map_err(Into::into))
                    .map_err(|e| InitError::ListenerInitError(e.to_string()))?;
                let forwarder = forwarder.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(err) = run_udp_worker(Arc::new(socket), forwarder).await {
                        error!(worker_id, error = %err, "udp worker exited");
                    }
                }));
            }
            #[cfg(not(unix))]
            {
                let socket = Arc::new(
                    UdpSocket::bind(addr)
                        .await
                        .map_err(|e| InitError::ListenerInitError(e.to_string()))?,
                );
                for worker_id in 0..udp_workers {
                    let socket = socket.clone();
                    let forwarder = forwarder.clone();
                    tasks.push(tokio::spawn(async move {
                        if let Err(err) = run_udp_worker(socket, forwarder).await {
                            error!(worker_id, error = %err, "udp worker exited");
                        }
                    }));
                }
            }

            let tcp_listener = TcpListener::bind(addr)
                .await
                .map_err(|e| InitError::ListenerInitError(e.to_string()))?;
            let tcp_forwarder = forwarder.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = run_tcp(tcp_listener, tcp_forwarder).await {
                    error!(error = %err, "tcp listener exited");
                }
            }));

            info!(address = %addr, udp_workers, "listener started");
        }

        Ok(Self { forwarder, tasks })
    }

    /// Direct entry point for embedders running their own listeners.
    pub async fn handle_message(&self, raw: &[u8], peer_info: Option<PeerInfo>) -> Bytes {
        self.forwarder.handle_message(raw, peer_info).await
    }

    pub fn settings(&self) -> Arc<ProxySettings> {
        self.forwarder.settings()
    }

    /// Stop listeners and tear the forwarder down. Idempotent.
    pub fn deinit(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.forwarder.deinit();
    }
}

impl Drop for DnsProxy {
    fn drop(&mut self) {
        self.deinit();
    }
}

// SO_REUSEPORT lets the kernel spread datagrams across worker sockets.
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        // Keep going without reuseport; a single worker still serves.
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn run_udp_worker(socket: Arc<UdpSocket>, forwarder: Arc<DnsForwarder>) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => continue,
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);
        let socket = socket.clone();
        let forwarder = forwarder.clone();
        tokio::spawn(async move {
            let info = PeerInfo { peer, transport: Transport::Udp };
            let response = forwarder.handle_message(&packet, Some(info)).await;
            if !response.is_empty() {
                let _ = socket.send_to(&response, peer).await;
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, forwarder: Arc<DnsForwarder>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let forwarder = forwarder.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, forwarder).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    forwarder: Arc<DnsForwarder>,
) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let info = PeerInfo { peer, transport: Transport::Tcp };
        let response = forwarder.handle_message(&buf, Some(info)).await;
        if response.is_empty() || response.len() > u16::MAX as usize {
            continue;
        }
        let len_bytes = (response.len() as u16).to_be_bytes();
        if stream.write_all(&len_bytes).await.is_err() {
            return Ok(());
        }
        if stream.write_all(&response).await.is_err() {
            return Ok(());
        }
    }
}
