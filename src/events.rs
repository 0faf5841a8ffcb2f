use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::rr::Record;

/// Snapshot of a fully processed query, delivered to the embedder exactly
/// once per inbound message.
#[derive(Debug, Clone, Default)]
pub struct DnsRequestProcessedEvent {
    /// Queried domain, as sent by the client.
    pub domain: String,
    /// Query type ("A", "AAAA", ...).
    pub r#type: String,
    /// Unix time of query arrival, milliseconds.
    pub start_time: u64,
    /// Processing time, milliseconds.
    pub elapsed: u64,
    /// Response rcode ("NOERROR", "NXDOMAIN", ...), empty if none was built.
    pub status: String,
    /// Answer section of the response handed to the client.
    pub answer: String,
    /// Answer section of the upstream response that got replaced by filtering.
    pub original_answer: String,
    pub upstream_id: Option<i32>,
    pub bytes_sent: usize,
    pub bytes_received: usize,
    /// Matched rule texts, most recent first, deduplicated.
    pub rules: Vec<String>,
    /// Filter list ids aligned with `rules`.
    pub filter_list_ids: Vec<i32>,
    /// True when the governing rule is an exception.
    pub whitelist: bool,
    pub error: Option<String>,
    pub cache_hit: bool,
    /// True when the upstream returned RRSIGs for this query.
    pub dnssec: bool,
}

impl DnsRequestProcessedEvent {
    pub fn started_now() -> Self {
        Self {
            start_time: unix_millis(),
            ..Default::default()
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// "A, 1.2.3.4" per record, newline separated. Mirrors what log scrapers
/// downstream already parse.
pub fn records_to_string(records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        let Some(data) = record.data() else { continue };
        let _ = write!(out, "{}, {}\n", record.record_type(), data);
    }
    out
}

pub type RequestProcessedCallback = Arc<dyn Fn(DnsRequestProcessedEvent) + Send + Sync>;

/// Callbacks the embedder may install.
#[derive(Clone, Default)]
pub struct DnsProxyEvents {
    pub on_request_processed: Option<RequestProcessedCallback>,
}

impl DnsProxyEvents {
    pub fn fire(&self, event: DnsRequestProcessedEvent) {
        if let Some(callback) = &self.on_request_processed {
            callback(event);
        }
    }
}
