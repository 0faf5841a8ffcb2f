use thiserror::Error;

/// Errors produced while resolving a query.
#[derive(Debug, Error, Clone)]
pub enum DnsError {
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("exchange error: {0}")]
    ExchangeError(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    CurlError(String),
    #[error("timed out")]
    TimedOut,
    #[error("shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

impl DnsError {
    /// A single retry is granted after these: servers are known to drop
    /// idle connections right before a request lands.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DnsError::ConnectionClosed | DnsError::CurlError(_))
    }
}

/// Socket-layer errors, including the outbound proxy driver's.
#[derive(Debug, Error, Clone)]
pub enum SocketError {
    #[error("operation already in progress")]
    InProgress,
    #[error("failed to arm timeout")]
    SetTimeoutError,
    #[error("connection id not found: {0}")]
    ConnectionIdNotFound(u32),
    #[error("duplicate connection id: {0}")]
    DuplicateId(u32),
    #[error("invalid connection state: {0}")]
    InvalidConnState(String),
    #[error("bad proxy reply: {0}")]
    BadProxyReply(String),
    #[error("unexpected data on control connection ({0} bytes)")]
    UnexpectedData(usize),
    #[error("udp association not found")]
    UdpAssociationNotFound,
    #[error("udp association terminated: {0}")]
    UdpAssociationTerminated(String),
    #[error("timed out")]
    TimedOut,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => SocketError::TimedOut,
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                SocketError::ConnectionClosed
            }
            _ => SocketError::Io(err.to_string()),
        }
    }
}

impl From<std::io::Error> for DnsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DnsError::TimedOut,
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                DnsError::ConnectionClosed
            }
            _ => DnsError::ExchangeError(err.to_string()),
        }
    }
}

/// Errors raised by `DnsProxy::init`.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid custom blocking ipv4: {0}")]
    InvalidIpv4(String),
    #[error("invalid custom blocking ipv6: {0}")]
    InvalidIpv6(String),
    #[error("no usable upstreams")]
    UpstreamInitError,
    #[error("fallback filter failed to compile: {0}")]
    FallbackFilterInitError(String),
    #[error("filter load error: {0}")]
    FilterLoadError(String),
    #[error("listener init error: {0}")]
    ListenerInitError(String),
}
