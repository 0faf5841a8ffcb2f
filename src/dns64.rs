//! DNS64: Pref64 discovery through `ipv4only.arpa` (RFC 7050) and AAAA
//! synthesis for IPv6-only networks.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tracing::{debug, info};

use crate::upstream::Upstream;

const WELL_KNOWN_NAME: &str = "ipv4only.arpa.";
const WELL_KNOWN_V4: [Ipv4Addr; 2] =
    [Ipv4Addr::new(192, 0, 0, 170), Ipv4Addr::new(192, 0, 0, 171)];

/// A /96 NAT64 prefix: the first 12 bytes of a synthesized IPv6 address.
pub type Prefix = [u8; 12];

/// Discovered prefixes, shared between the forwarder and the discovery task.
/// Filled at most once; empty until discovery succeeds.
#[derive(Default)]
pub struct Dns64State {
    prefixes: ArcSwap<Vec<Prefix>>,
}

impl Dns64State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefixes(&self) -> Arc<Vec<Prefix>> {
        self.prefixes.load_full()
    }

    pub fn has_prefixes(&self) -> bool {
        !self.prefixes.load().is_empty()
    }

    pub fn set_prefixes(&self, prefixes: Vec<Prefix>) {
        self.prefixes.store(Arc::new(prefixes));
    }
}

/// Embed an IPv4 address into a /96 prefix.
pub fn synthesize_address(prefix: &Prefix, v4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[..12].copy_from_slice(prefix);
    octets[12..].copy_from_slice(&v4.octets());
    Ipv6Addr::from(octets)
}

/// Pull NAT64 prefixes out of an `ipv4only.arpa` AAAA response: any AAAA
/// whose tail is one of the well-known IPv4 addresses reveals its prefix.
pub fn extract_prefixes(response: &Message) -> Vec<Prefix> {
    let mut prefixes = Vec::new();
    for record in response.answers() {
        let Some(RData::AAAA(aaaa)) = record.data() else { continue };
        let octets = aaaa.0.octets();
        let mut tail = [0u8; 4];
        tail.copy_from_slice(&octets[12..]);
        let embedded = Ipv4Addr::from(tail);
        if !WELL_KNOWN_V4.contains(&embedded) {
            continue;
        }
        let mut prefix = [0u8; 12];
        prefix.copy_from_slice(&octets[..12]);
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }
    prefixes
}

/// Background discovery: wait, then cycle the configured upstreams until one
/// of them reveals prefixes or the budget runs out.
pub async fn discover(
    state: Arc<Dns64State>,
    upstreams: Vec<Arc<dyn Upstream>>,
    max_tries: u32,
    wait_time: Duration,
    shutdown: Weak<()>,
) {
    let well_known = Name::from_str(WELL_KNOWN_NAME).expect("well-known name");
    for _ in 0..max_tries {
        tokio::time::sleep(wait_time).await;
        if shutdown.upgrade().is_none() {
            return;
        }
        for upstream in &upstreams {
            let request = crate::message::new_query(
                well_known.clone(),
                RecordType::AAAA,
                DNSClass::IN,
                true,
                false,
            );
            let response = match upstream.exchange(&request).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(upstream = %upstream.options().address, error = %err, "dns64 discovery query failed");
                    continue;
                }
            };
            if shutdown.upgrade().is_none() {
                return;
            }
            let prefixes = extract_prefixes(&response);
            if prefixes.is_empty() {
                debug!(upstream = %upstream.options().address, "no dns64 prefixes discovered, retrying");
                continue;
            }
            info!(count = prefixes.len(), "dns64 prefixes discovered");
            state.set_prefixes(prefixes);
            return;
        }
    }
    debug!("failed to discover any dns64 prefixes");
}

/// Re-ask `upstream` for A records and synthesize an AAAA response from
/// them. `None` when no prefixes are known, the A lookup fails, or nothing
/// could be synthesized.
pub async fn try_synthesize(
    state: &Dns64State,
    upstream: &Arc<dyn Upstream>,
    request: &Message,
) -> Option<Message> {
    let prefixes = state.prefixes();
    if prefixes.is_empty() {
        return None;
    }

    let question = request.queries().first()?;
    let request_a = crate::message::new_query(
        question.name().clone(),
        RecordType::A,
        question.query_class(),
        request.recursion_desired(),
        request.checking_disabled(),
    );

    let response_a = match upstream.exchange(&request_a).await {
        Ok(response) => response,
        Err(err) => {
            debug!(error = %err, "dns64: A lookup for synthesis failed");
            return None;
        }
    };
    if response_a.answers().is_empty() {
        debug!("dns64: upstream returned no A records for synthesis");
        return None;
    }

    let mut answers = Vec::new();
    let mut synthesized = 0usize;
    for record in response_a.answers() {
        match record.data() {
            Some(RData::A(a)) => {
                for prefix in prefixes.iter() {
                    let ip6 = synthesize_address(prefix, a.0);
                    answers.push(Record::from_rdata(
                        record.name().clone(),
                        record.ttl(),
                        RData::AAAA(AAAA(ip6)),
                    ));
                    synthesized += 1;
                }
            }
            _ => answers.push(record.clone()),
        }
    }
    if synthesized == 0 {
        return None;
    }

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(response_a.recursion_available());
    response.set_checking_disabled(response_a.checking_disabled());
    response.add_queries(request.queries().to_vec());
    response.add_answers(answers);
    Some(response)
}
