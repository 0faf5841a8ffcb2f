//! Removal of Encrypted ClientHello parameters from SVCB/HTTPS answers.

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::svcb::SVCB;
use hickory_proto::rr::{RData, Record};

// SvcParamKey "ech", RFC 9460 §14.3.2.
const SVC_PARAM_ECH: u16 = 5;

fn strip_svcb(svcb: &SVCB) -> Option<SVCB> {
    if !svcb.svc_params().iter().any(|(k, _)| u16::from(*k) == SVC_PARAM_ECH) {
        return None;
    }
    let params = svcb
        .svc_params()
        .iter()
        .filter(|(k, _)| u16::from(*k) != SVC_PARAM_ECH)
        .cloned()
        .collect();
    Some(SVCB::new(svcb.svc_priority(), svcb.target_name().clone(), params))
}

/// Drop the `ech` SvcParam from every SVCB/HTTPS answer RR. Returns whether
/// any parameter was removed.
pub fn remove_ech_svcparam(response: &mut Message) -> bool {
    let mut removed = false;
    let answers: Vec<Record> = response
        .take_answers()
        .into_iter()
        .map(|record| {
            let new_data = match record.data() {
                Some(RData::HTTPS(https)) => strip_svcb(&https.0)
                    .map(|svcb| RData::HTTPS(hickory_proto::rr::rdata::HTTPS(svcb))),
                Some(RData::SVCB(svcb)) => strip_svcb(svcb).map(RData::SVCB),
                _ => None,
            };
            match new_data {
                Some(data) => {
                    removed = true;
                    Record::from_rdata(record.name().clone(), record.ttl(), data)
                }
                None => record,
            }
        })
        .collect();
    response.add_answers(answers);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_response, new_query};
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::svcb::{SvcParamKey, SvcParamValue};
    use hickory_proto::rr::rdata::HTTPS;
    use hickory_proto::rr::{DNSClass, Name, RecordType};
    use std::str::FromStr;

    fn https_record(with_ech: bool) -> Record {
        let name = Name::from_str("svc.example.").unwrap();
        let mut params = vec![(
            SvcParamKey::Alpn,
            SvcParamValue::Alpn(hickory_proto::rr::rdata::svcb::Alpn(vec!["h2".into()])),
        )];
        if with_ech {
            params.push((
                SvcParamKey::from(SVC_PARAM_ECH),
                SvcParamValue::Unknown(hickory_proto::rr::rdata::svcb::Unknown(vec![1, 2, 3])),
            ));
        }
        let svcb = SVCB::new(1, name.clone(), params);
        Record::from_rdata(name, 300, RData::HTTPS(HTTPS(svcb)))
    }

    fn response(record: Record) -> Message {
        let req = new_query(
            Name::from_str("svc.example.").unwrap(),
            RecordType::HTTPS,
            DNSClass::IN,
            true,
            false,
        );
        build_response(&req, ResponseCode::NoError, vec![record])
    }

    #[test]
    fn strips_ech_and_keeps_other_params() {
        let mut resp = response(https_record(true));
        assert!(remove_ech_svcparam(&mut resp));
        let Some(RData::HTTPS(https)) = resp.answers()[0].data() else {
            panic!("expected HTTPS rdata");
        };
        assert_eq!(https.0.svc_params().len(), 1);
        assert!(https.0.svc_params().iter().all(|(k, _)| u16::from(*k) != SVC_PARAM_ECH));
    }

    #[test]
    fn response_without_ech_is_untouched() {
        let mut resp = response(https_record(false));
        assert!(!remove_ech_svcparam(&mut resp));
        let Some(RData::HTTPS(https)) = resp.answers()[0].data() else {
            panic!("expected HTTPS rdata");
        };
        assert_eq!(https.0.svc_params().len(), 1);
    }
}
