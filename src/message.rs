//! DNS message helpers: a cheap question parse for the hot path and the
//! synthetic response builders used by the pipeline.

use std::str::from_utf8;
use std::str::FromStr;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, SOA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

use crate::config::{BlockingMode, ProxySettings};
use crate::errors::DnsError;

pub const DNS_HEADER_LEN: usize = 12;

/// TTL of the empty-SOA answer produced when AAAA queries are suppressed by
/// `block_ipv6` without a matching rule.
pub const SOA_RETRY_IPV6_BLOCK: u32 = 60;

/// First question of a wire-format message, parsed without a full decode.
pub struct QuickQuery<'a> {
    pub tx_id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
    pub checking_disabled: bool,
}

/// Parse the header and first question only. `buf` receives the normalized
/// (lowercased) owner name and should hold at least 256 bytes.
pub fn parse_quick<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<QuickQuery<'a>> {
    if packet.len() < DNS_HEADER_LEN {
        return None;
    }

    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    let checking_disabled = packet[3] & 0x10 != 0;
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let mut pos = DNS_HEADER_LEN;
    let mut buf_pos = 0;
    let mut jumped = false;
    let mut max_jumps = 5;
    let mut current = pos;
    let len_total = packet.len();

    loop {
        if current >= len_total {
            return None;
        }
        let len = packet[current];

        if len == 0 {
            if !jumped {
                pos = current + 1;
            }
            break;
        }

        if (len & 0xC0) == 0xC0 {
            if len_total < current + 2 {
                return None;
            }
            if !jumped {
                pos = current + 2;
                jumped = true;
            }
            let offset = (((len as u16) & 0x3F) << 8) | (packet[current + 1] as u16);
            current = offset as usize;
            max_jumps -= 1;
            if max_jumps == 0 {
                return None;
            }
            continue;
        }

        let label_len = len as usize;
        current += 1;
        if len_total < current + label_len {
            return None;
        }

        if buf_pos > 0 {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b'.';
            buf_pos += 1;
        }

        for &b in &packet[current..current + label_len] {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b.to_ascii_lowercase();
            buf_pos += 1;
        }

        current += label_len;
    }

    if packet.len() < pos + 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
    let qclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);

    let qname = from_utf8(&buf[..buf_pos]).ok()?;

    Some(QuickQuery {
        tx_id,
        qname,
        qtype,
        qclass,
        checking_disabled,
    })
}

/// Lowercased owner name without the trailing dot.
pub fn normalize_domain(name: &Name) -> String {
    let mut domain = name.to_lowercase().to_string();
    if domain.ends_with('.') && domain.len() > 1 {
        domain.pop();
    }
    domain
}

pub fn encode(msg: &Message) -> Result<Bytes, DnsError> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)
            .map_err(|e| DnsError::InternalError(format!("encode response: {e}")))?;
    }
    Ok(Bytes::from(out))
}

/// Response skeleton mirroring the request id, question and RD flag.
pub fn build_response(req: &Message, rcode: ResponseCode, answers: Vec<Record>) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_checking_disabled(req.checking_disabled());
    msg.set_response_code(rcode);

    let queries: Vec<Query> = req.queries().to_vec();
    msg.add_queries(queries);
    for ans in answers {
        msg.add_answer(ans);
    }
    msg
}

/// FORMERR for a message whose body never parsed; only the id is known.
pub fn formerr_response(tx_id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(tx_id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::FormErr);
    msg
}

pub fn servfail_response(req: &Message) -> Message {
    build_response(req, ResponseCode::ServFail, Vec::new())
}

/// Negative-caching SOA attached to NXDOMAIN and empty-NOERROR responses.
fn soa_record(req: &Message, ttl: u32) -> Option<Record> {
    let question = req.queries().first()?;
    let owner = question.name().clone();
    let mname = Name::from_str("fake-for-negative-caching.invalid.").ok()?;
    let rname = Name::from_str("hostmaster.").ok()?.append_domain(&owner).ok()?;
    let serial = crate::events::unix_millis() as u32;
    let soa = SOA::new(mname, rname, serial, 10800, 3600, 604_800, 86400);
    Some(Record::from_rdata(owner, ttl, RData::SOA(soa)))
}

pub fn nxdomain_response(req: &Message, settings: &ProxySettings) -> Message {
    let mut msg = build_response(req, ResponseCode::NXDomain, Vec::new());
    if let Some(soa) = soa_record(req, settings.blocked_response_ttl_secs) {
        msg.add_name_server(soa);
    }
    msg
}

/// NOERROR with no answers and an SOA in authority.
pub fn soa_response(req: &Message, ttl: u32) -> Message {
    let mut msg = build_response(req, ResponseCode::NoError, Vec::new());
    if let Some(soa) = soa_record(req, ttl) {
        msg.add_name_server(soa);
    }
    msg
}

/// ADDRESS-mode blocking: A/AAAA answers get the blocking address, anything
/// else gets an empty SOA.
pub fn address_blocking_response(req: &Message, settings: &ProxySettings) -> Message {
    let Some(question) = req.queries().first() else {
        return servfail_response(req);
    };
    let owner = question.name().clone();
    let ttl = settings.blocked_response_ttl_secs;
    match question.query_type() {
        RecordType::A => {
            let record = Record::from_rdata(owner, ttl, RData::A(A(settings.blocking_ipv4())));
            build_response(req, ResponseCode::NoError, vec![record])
        }
        RecordType::AAAA => {
            let record = Record::from_rdata(owner, ttl, RData::AAAA(AAAA(settings.blocking_ipv6())));
            build_response(req, ResponseCode::NoError, vec![record])
        }
        _ => soa_response(req, ttl),
    }
}

/// Blocking response for the given mode.
pub fn blocking_response(req: &Message, settings: &ProxySettings, mode: BlockingMode) -> Message {
    match mode {
        BlockingMode::Refused => build_response(req, ResponseCode::Refused, Vec::new()),
        BlockingMode::Nxdomain => nxdomain_response(req, settings),
        BlockingMode::Address => address_blocking_response(req, settings),
    }
}

/// Fresh query for an internally-issued request; never reuses the client id.
pub fn new_query(name: Name, qtype: RecordType, qclass: DNSClass, rd: bool, cd: bool) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(rd);
    msg.set_checking_disabled(cd);
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(qtype);
    query.set_query_class(qclass);
    msg.add_query(query);
    msg
}

/// Minimum TTL across every section; drives the cache entry lifetime.
pub fn min_ttl(msg: &Message) -> Option<u32> {
    msg.answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals())
        .filter(|r| r.record_type() != RecordType::OPT)
        .map(|r| r.ttl())
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(domain: &str, qtype: RecordType) -> Message {
        new_query(
            Name::from_str(domain).unwrap(),
            qtype,
            DNSClass::IN,
            true,
            false,
        )
    }

    #[test]
    fn parse_quick_reads_first_question() {
        let msg = query("Example.COM.", RecordType::A);
        let wire = encode(&msg).unwrap();
        let mut buf = [0u8; 256];
        let q = parse_quick(&wire, &mut buf).expect("quick parse");
        assert_eq!(q.tx_id, msg.id());
        assert_eq!(q.qname, "example.com");
        assert_eq!(q.qtype, u16::from(RecordType::A));
        assert_eq!(q.qclass, u16::from(DNSClass::IN));
    }

    #[test]
    fn parse_quick_rejects_short_and_empty_question() {
        let mut buf = [0u8; 256];
        assert!(parse_quick(&[0u8; 4], &mut buf).is_none());
        // Valid header, zero questions
        let mut hdr = [0u8; 12];
        hdr[0] = 0xAB;
        assert!(parse_quick(&hdr, &mut buf).is_none());
    }

    #[test]
    fn normalize_strips_trailing_dot_and_case() {
        let name = Name::from_str("FOO.Example.COM.").unwrap();
        assert_eq!(normalize_domain(&name), "foo.example.com");
    }

    #[test]
    fn blocking_response_modes() {
        let settings = ProxySettings::default();
        let req = query("ads.example.", RecordType::A);

        let refused = blocking_response(&req, &settings, BlockingMode::Refused);
        assert_eq!(refused.response_code(), ResponseCode::Refused);

        let nx = blocking_response(&req, &settings, BlockingMode::Nxdomain);
        assert_eq!(nx.response_code(), ResponseCode::NXDomain);
        assert_eq!(nx.name_servers().len(), 1);

        let addr = blocking_response(&req, &settings, BlockingMode::Address);
        assert_eq!(addr.response_code(), ResponseCode::NoError);
        assert_eq!(addr.answers().len(), 1);
        match addr.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, std::net::Ipv4Addr::UNSPECIFIED),
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn address_blocking_for_txt_is_empty_soa() {
        let settings = ProxySettings::default();
        let req = query("ads.example.", RecordType::TXT);
        let resp = blocking_response(&req, &settings, BlockingMode::Address);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.answers().is_empty());
        assert_eq!(resp.name_servers().len(), 1);
        assert_eq!(resp.name_servers()[0].record_type(), RecordType::SOA);
    }

    #[test]
    fn min_ttl_spans_all_sections() {
        let req = query("example.com.", RecordType::A);
        let mut resp = build_response(&req, ResponseCode::NoError, Vec::new());
        let name = Name::from_str("example.com.").unwrap();
        resp.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::A(A("1.2.3.4".parse().unwrap())),
        ));
        if let Some(soa) = soa_record(&req, 60) {
            resp.add_name_server(soa);
        }
        assert_eq!(min_ttl(&resp), Some(60));
    }

    #[test]
    fn internal_queries_get_fresh_ids() {
        let a = query("example.com.", RecordType::A);
        let b = query("example.com.", RecordType::A);
        // Random ids; a collision across two draws is vanishingly unlikely,
        // retry once to avoid a flaky test.
        if a.id() == b.id() {
            let c = query("example.com.", RecordType::A);
            assert_ne!(a.id(), c.id());
        }
    }
}
