//! DNSSEC-OK plumbing: set the DO bit on outgoing requests and scrub
//! DNSSEC records from responses the client never asked for.

use hickory_proto::op::Message;
use hickory_proto::rr::{Record, RecordType};

const TYPE_DS: u16 = 43;
const TYPE_RRSIG: u16 = 46;
const TYPE_NSEC: u16 = 47;
const TYPE_DNSKEY: u16 = 48;
const TYPE_NSEC3: u16 = 50;

fn is_dnssec_type(rt: RecordType) -> bool {
    matches!(
        u16::from(rt),
        TYPE_DS | TYPE_RRSIG | TYPE_NSEC | TYPE_DNSKEY | TYPE_NSEC3
    )
}

/// Set DO on the request. Returns true if the bit was ours to set, false
/// when the client already asked for DNSSEC.
pub fn set_do_bit(request: &mut Message) -> bool {
    if request.edns().map_or(false, |e| e.dnssec_ok()) {
        return false;
    }
    let edns = request.edns_mut();
    if edns.max_payload() < 512 {
        edns.set_max_payload(4096);
    }
    edns.set_dnssec_ok(true);
    true
}

pub fn has_rrsigs(response: &Message) -> bool {
    response
        .answers()
        .iter()
        .chain(response.name_servers())
        .chain(response.additionals())
        .any(|r| u16::from(r.record_type()) == TYPE_RRSIG)
}

/// Remove DNSSEC RRs from every section, except records of the type the
/// client explicitly queried. Clears the DO bit. Returns whether anything
/// was removed.
pub fn scrub_dnssec_rrs(response: &mut Message) -> bool {
    let asked_type = response.queries().first().map(|q| q.query_type());
    let keep = |r: &Record| !is_dnssec_type(r.record_type()) || Some(r.record_type()) == asked_type;

    let before =
        response.answers().len() + response.name_servers().len() + response.additionals().len();

    let answers: Vec<Record> = response.take_answers().into_iter().filter(|r| keep(r)).collect();
    let name_servers: Vec<Record> =
        response.take_name_servers().into_iter().filter(|r| keep(r)).collect();
    let additionals: Vec<Record> =
        response.take_additionals().into_iter().filter(|r| keep(r)).collect();

    let removed = answers.len() + name_servers.len() + additionals.len() != before;

    response.add_answers(answers);
    response.add_name_servers(name_servers);
    response.add_additionals(additionals);

    if response.edns().is_some() {
        response.edns_mut().set_dnssec_ok(false);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_response, new_query};
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::null::NULL;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record};
    use std::str::FromStr;

    fn name() -> Name {
        Name::from_str("signed.example.").unwrap()
    }

    // A stand-in for an RRSIG; only the record type matters for the scrub.
    fn pseudo_record(rt: u16) -> Record {
        let rdata = RData::Unknown { code: RecordType::from(rt), rdata: NULL::with(b"sig".to_vec()) };
        Record::from_rdata(name(), 300, rdata)
    }

    #[test]
    fn do_bit_set_only_when_absent() {
        let mut req = new_query(name(), RecordType::A, DNSClass::IN, true, false);
        assert!(set_do_bit(&mut req));
        assert!(req.edns().map_or(false, |e| e.dnssec_ok()));
        // Second call observes the client bit and declines.
        assert!(!set_do_bit(&mut req));
    }

    #[test]
    fn scrub_removes_dnssec_records() {
        let req = new_query(name(), RecordType::A, DNSClass::IN, true, false);
        let mut resp = build_response(
            &req,
            ResponseCode::NoError,
            vec![Record::from_rdata(name(), 300, RData::A(A("1.2.3.4".parse().unwrap())))],
        );
        resp.add_answer(pseudo_record(TYPE_RRSIG));
        resp.add_name_server(pseudo_record(TYPE_NSEC));

        assert!(has_rrsigs(&resp));
        assert!(scrub_dnssec_rrs(&mut resp));
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].record_type(), RecordType::A);
        assert!(resp.name_servers().is_empty());
        assert!(!has_rrsigs(&resp));
    }

    #[test]
    fn scrub_keeps_explicitly_queried_type() {
        let req = new_query(name(), RecordType::from(TYPE_DNSKEY), DNSClass::IN, true, false);
        let mut resp = build_response(&req, ResponseCode::NoError, vec![pseudo_record(TYPE_DNSKEY)]);
        resp.add_answer(pseudo_record(TYPE_RRSIG));
        scrub_dnssec_rrs(&mut resp);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(u16::from(resp.answers()[0].record_type()), TYPE_DNSKEY);
    }
}
