//! The per-query pipeline: decode, cache, pre-resolution filtering,
//! upstream exchange, post-resolution (CNAME/IP) filtering, DNS64
//! synthesis, ECH stripping, truncation, caching and event emission.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use std::str::FromStr;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::Balancer;
use crate::cache::ResponseCache;
use crate::config::ProxySettings;
use crate::dns64::Dns64State;
use crate::dnssec;
use crate::ech;
use crate::errors::{DnsError, InitError};
use crate::events::{records_to_string, DnsProxyEvents, DnsRequestProcessedEvent};
use crate::filter::{self, FilterEngine, RewriteInfo, Rule};
use crate::message::{self, DNS_HEADER_LEN, SOA_RETRY_IPV6_BLOCK};
use crate::retransmit::RetransmissionDetector;
use crate::socks::OutboundProxy;
use crate::truncate::truncate;
use crate::upstream::{self, Upstream};

const MOZILLA_DOH_HOST: &str = "use-application-dns.net";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Where a message came from. Absent for internal re-entries.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub peer: SocketAddr,
    pub transport: Transport,
}

pub struct DnsForwarder {
    settings: Arc<ProxySettings>,
    events: DnsProxyEvents,
    balancer: Arc<Balancer>,
    filter: Arc<FilterEngine>,
    cache: ResponseCache,
    dns64: Arc<Dns64State>,
    retransmissions: RetransmissionDetector,
    // Holder of the shutdown sentinel; tasks keep weak references and bail
    // out once it is gone.
    shutdown_guard: Mutex<Option<Arc<()>>>,
    dns64_task: Mutex<Option<JoinHandle<()>>>,
}

impl DnsForwarder {
    pub fn init(settings: ProxySettings, events: DnsProxyEvents) -> Result<Arc<Self>, InitError> {
        info!("initializing forwarder");
        let settings = Arc::new(settings);

        if let Some(ip) = settings.custom_blocking_ipv4.as_deref() {
            if ip.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(InitError::InvalidIpv4(ip.to_string()));
            }
        }
        if let Some(ip) = settings.custom_blocking_ipv6.as_deref() {
            if ip.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(InitError::InvalidIpv6(ip.to_string()));
            }
        }

        let proxy = match settings.outbound_proxy.clone() {
            Some(proxy_settings) => Some(Arc::new(
                OutboundProxy::new(proxy_settings)
                    .map_err(|e| InitError::ListenerInitError(e.to_string()))?,
            )),
            None => None,
        };

        let timeout = settings.upstream_timeout();
        let mut upstreams: Vec<Arc<dyn Upstream>> = Vec::with_capacity(settings.upstreams.len());
        for us in &settings.upstreams {
            match upstream::create_upstream(us, timeout, proxy.clone()) {
                Ok(upstream) => {
                    info!(address = %us.address, id = us.id, "upstream created");
                    upstreams.push(upstream);
                }
                Err(err) => warn!(address = %us.address, error = %err, "failed to create upstream"),
            }
        }
        let mut fallbacks: Vec<Arc<dyn Upstream>> = Vec::with_capacity(settings.fallbacks.len());
        for us in &settings.fallbacks {
            match upstream::create_upstream(us, timeout, proxy.clone()) {
                Ok(upstream) => fallbacks.push(upstream),
                Err(err) => {
                    warn!(address = %us.address, error = %err, "failed to create fallback upstream")
                }
            }
        }
        if upstreams.is_empty()
            && (fallbacks.is_empty() || !settings.enable_fallback_on_upstreams_failure)
        {
            return Err(InitError::UpstreamInitError);
        }

        let filter = FilterEngine::load(&settings.filter_params)
            .map_err(InitError::FilterLoadError)?;
        // The fallback filter steers connectivity-critical names; it must
        // compile cleanly or init fails.
        let fallback_filter = filter::compile_fallback_filter(&settings.fallback_domains)
            .map_err(InitError::FallbackFilterInitError)?;

        let shutdown_guard = Arc::new(());
        let balancer = Arc::new(Balancer::new(
            upstreams,
            fallbacks,
            fallback_filter,
            settings.enable_parallel_upstream_queries,
            settings.enable_fallback_on_upstreams_failure,
            Arc::downgrade(&shutdown_guard),
        ));

        let dns64 = Arc::new(Dns64State::new());
        let forwarder = Arc::new(Self {
            cache: ResponseCache::new(settings.dns_cache_size),
            settings: settings.clone(),
            events,
            balancer,
            filter: Arc::new(filter),
            dns64: dns64.clone(),
            retransmissions: RetransmissionDetector::new(),
            shutdown_guard: Mutex::new(Some(shutdown_guard.clone())),
            dns64_task: Mutex::new(None),
        });

        if let Some(dns64_settings) = settings.dns64.as_ref() {
            info!("dns64 discovery is enabled");
            let mut discovery_upstreams: Vec<Arc<dyn Upstream>> = Vec::new();
            for us in &dns64_settings.upstreams {
                match upstream::create_upstream(us, timeout, proxy.clone()) {
                    Ok(upstream) => discovery_upstreams.push(upstream),
                    Err(err) => {
                        warn!(address = %us.address, error = %err, "failed to create dns64 upstream")
                    }
                }
            }
            let task = tokio::spawn(crate::dns64::discover(
                dns64,
                discovery_upstreams,
                dns64_settings.max_tries,
                dns64_settings.wait_time(),
                Arc::downgrade(&shutdown_guard),
            ));
            *forwarder.dns64_task.lock().expect("dns64 task lock") = Some(task);
        }

        info!("forwarder initialized");
        Ok(forwarder)
    }

    pub fn settings(&self) -> Arc<ProxySettings> {
        self.settings.clone()
    }

    /// Drop the shutdown sentinel; in-flight coroutines observing the weak
    /// guard return empty-handed from their next suspension point.
    pub fn deinit(&self) {
        info!("deinitializing forwarder");
        *self.shutdown_guard.lock().expect("shutdown lock") = None;
        if let Some(task) = self.dns64_task.lock().expect("dns64 task lock").take() {
            task.abort();
        }
        self.cache.clear();
    }

    fn guard(&self) -> Weak<()> {
        match self.shutdown_guard.lock().expect("shutdown lock").as_ref() {
            Some(guard) => Arc::downgrade(guard),
            None => Weak::new(),
        }
    }

    /// Process one client message. An empty return means "send nothing".
    pub async fn handle_message(&self, raw: &[u8], peer_info: Option<PeerInfo>) -> Bytes {
        let guard = self.guard();
        if guard.upgrade().is_none() {
            return Bytes::new();
        }

        if raw.len() < DNS_HEADER_LEN {
            debug!(len = raw.len(), "not responding to malformed message");
            let mut event = DnsRequestProcessedEvent::started_now();
            self.finalize_event(
                &mut event,
                None,
                None,
                None,
                None,
                Some(DnsError::DecodeError("message shorter than a DNS header".into())),
            );
            return Bytes::new();
        }

        let pkt_id = u16::from_be_bytes([raw[0], raw[1]]);

        let retransmission_handling = self.settings.enable_retransmission_handling
            && peer_info.map_or(false, |info| info.transport == Transport::Udp);
        let mut fallback_only = false;
        if retransmission_handling {
            let peer = peer_info.expect("peer info present").peer;
            if self.retransmissions.register(pkt_id, peer) > 1 {
                debug!(pkt_id, %peer, "detected retransmitted request");
                fallback_only = true;
            }
        }

        let result = self
            .handle_message_inner(raw, peer_info, fallback_only, pkt_id, &guard)
            .await;

        if retransmission_handling {
            let peer = peer_info.expect("peer info present").peer;
            self.retransmissions.deregister(pkt_id, peer);
        }

        result
    }

    async fn handle_message_inner(
        &self,
        raw: &[u8],
        peer_info: Option<PeerInfo>,
        fallback_only: bool,
        pkt_id: u16,
        guard: &Weak<()>,
    ) -> Bytes {
        let mut event = DnsRequestProcessedEvent::started_now();

        // Cache fast path: a hit is served off the quick question parse
        // alone, skipping the full decode. Oversized hits on plain UDP fall
        // through so truncation can see the request's EDNS budget.
        let mut qname_buf = [0u8; 256];
        if let Some(q) = message::parse_quick(raw, &mut qname_buf) {
            if let Some(hit) = self.cache.lookup(q.qname, q.qtype, q.qclass, q.checking_disabled) {
                if !hit.expired || self.settings.optimistic_cache {
                    let mut response = hit.response;
                    response.set_id(q.tx_id);
                    if let Ok(bytes) = message::encode(&response) {
                        let is_udp =
                            peer_info.map_or(false, |info| info.transport == Transport::Udp);
                        if !is_udp || bytes.len() <= 512 {
                            event.domain = q.qname.to_string();
                            event.r#type = RecordType::from(q.qtype).to_string();
                            event.cache_hit = true;
                            event.bytes_sent = raw.len();
                            event.bytes_received = bytes.len();
                            self.finalize_event(
                                &mut event,
                                None,
                                Some(&response),
                                None,
                                hit.upstream_id,
                                None,
                            );
                            if hit.expired {
                                let balancer = self.balancer.clone();
                                let cache = self.cache.clone();
                                let refresh_guard = guard.clone();
                                let raw_copy = raw.to_vec();
                                let refresh_domain = q.qname.to_string();
                                tokio::spawn(async move {
                                    // Full parse happens off the hot path.
                                    if let Ok(request) = Message::from_bytes(&raw_copy) {
                                        refresh_cached_entry(
                                            balancer,
                                            cache,
                                            refresh_guard,
                                            request,
                                            refresh_domain,
                                        )
                                        .await;
                                    }
                                });
                            }
                            return bytes;
                        }
                    }
                }
            }
        }

        let request = match Message::from_bytes(raw) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "failed to parse payload");
                let response = message::formerr_response(pkt_id);
                let bytes = message::encode(&response).unwrap_or_default();
                self.finalize_event(
                    &mut event,
                    None,
                    Some(&response),
                    None,
                    None,
                    Some(DnsError::DecodeError(err.to_string())),
                );
                return bytes;
            }
        };

        let Some(question) = request.queries().first().cloned() else {
            let response = message::servfail_response(&request);
            let bytes = message::encode(&response).unwrap_or_default();
            self.finalize_event(
                &mut event,
                None,
                Some(&response),
                None,
                None,
                Some(DnsError::DecodeError("no question section".into())),
            );
            return bytes;
        };

        let normalized_domain = message::normalize_domain(question.name());
        event.domain = question.name().to_string();
        let qtype = question.query_type();

        // Mozilla DoH canary: keep the client on system DNS.
        if matches!(qtype, RecordType::A | RecordType::AAAA)
            && normalized_domain == MOZILLA_DOH_HOST
        {
            let response = message::nxdomain_response(&request, &self.settings);
            let bytes = message::encode(&response).unwrap_or_default();
            self.finalize_event(&mut event, Some(&request), Some(&response), None, None, None);
            return bytes;
        }

        if let Some(hit) = self.cache.get(&request) {
            if !hit.expired || self.settings.optimistic_cache {
                let mut response = hit.response;
                self.truncate_response(&mut response, &request, peer_info);
                event.cache_hit = true;
                event.bytes_sent = raw.len();
                let bytes = message::encode(&response).unwrap_or_default();
                event.bytes_received = bytes.len();
                self.finalize_event(
                    &mut event,
                    Some(&request),
                    Some(&response),
                    None,
                    hit.upstream_id,
                    None,
                );
                if hit.expired {
                    let balancer = self.balancer.clone();
                    let cache = self.cache.clone();
                    let refresh_guard = guard.clone();
                    let refresh_request = request.clone();
                    let refresh_domain = normalized_domain.clone();
                    tokio::spawn(async move {
                        refresh_cached_entry(
                            balancer,
                            cache,
                            refresh_guard,
                            refresh_request,
                            refresh_domain,
                        )
                        .await;
                    });
                }
                return bytes;
            }
        }

        let mut effective_rules: Vec<Arc<Rule>> = Vec::new();

        // IPv6 suppression: AAAA queries answer with an empty SOA unless a
        // filter rule takes precedence.
        if self.settings.block_ipv6 && qtype == RecordType::AAAA {
            let outcome = self
                .apply_filter(
                    &normalized_domain,
                    &request,
                    None,
                    &mut event,
                    &mut effective_rules,
                    fallback_only,
                    false,
                )
                .await;
            if guard.upgrade().is_none() {
                return Bytes::new();
            }
            match outcome {
                Some((response, rcode)) if rcode != ResponseCode::NoError => {
                    let bytes = message::encode(&response).unwrap_or_default();
                    self.finalize_event(&mut event, Some(&request), Some(&response), None, None, None);
                    return bytes;
                }
                _ => {
                    debug!(domain = %normalized_domain, "AAAA query suppressed, ipv6 blocking is enabled");
                    let response = message::soa_response(&request, SOA_RETRY_IPV6_BLOCK);
                    let bytes = message::encode(&response).unwrap_or_default();
                    self.finalize_event(&mut event, Some(&request), Some(&response), None, None, None);
                    return bytes;
                }
            }
        }

        if let Some((response, _)) = self
            .apply_filter(
                &normalized_domain,
                &request,
                None,
                &mut event,
                &mut effective_rules,
                fallback_only,
                true,
            )
            .await
        {
            return message::encode(&response).unwrap_or_default();
        }
        if guard.upgrade().is_none() {
            return Bytes::new();
        }

        let mut outgoing = request.clone();
        let is_our_do_bit = self.settings.enable_dnssec_ok && dnssec::set_do_bit(&mut outgoing);

        let outcome = self
            .balancer
            .resolve(&normalized_domain, Arc::new(outgoing), fallback_only)
            .await;
        if guard.upgrade().is_none() {
            return Bytes::new();
        }

        let upstream_id = outcome.upstream.as_ref().map(|u| u.options().id);
        let mut response = match outcome.response {
            Ok(response) => response,
            Err(err) => {
                if !self.settings.enable_servfail_on_upstreams_failure {
                    debug!(error = %err, "not responding, upstreams exchange failed");
                    self.finalize_event(&mut event, Some(&request), None, None, upstream_id, Some(err));
                    return Bytes::new();
                }
                let response = message::servfail_response(&request);
                let bytes = message::encode(&response).unwrap_or_default();
                self.finalize_event(
                    &mut event,
                    Some(&request),
                    Some(&response),
                    None,
                    upstream_id,
                    Some(DnsError::ExchangeError(err.to_string())),
                );
                return bytes;
            }
        };
        let selected_upstream = outcome.upstream.expect("upstream set on success");

        if self.settings.enable_dnssec_ok {
            event.dnssec = dnssec::has_rrsigs(&response);
            if is_our_do_bit {
                dnssec::scrub_dnssec_rrs(&mut response);
            }
        }

        if response.response_code() == ResponseCode::NoError {
            // CNAME and IP blocking, in answer order.
            let answers: Vec<(RecordType, String)> = response
                .answers()
                .iter()
                .filter_map(|rr| match rr.data() {
                    Some(RData::CNAME(cname)) => {
                        Some((RecordType::CNAME, message::normalize_domain(&cname.0)))
                    }
                    Some(RData::A(a)) => Some((RecordType::A, a.0.to_string())),
                    Some(RData::AAAA(aaaa)) => Some((RecordType::AAAA, aaaa.0.to_string())),
                    _ => None,
                })
                .collect();
            for (_rr_type, target) in answers {
                if let Some((blocked, _)) = self
                    .apply_filter(
                        &target,
                        &request,
                        Some(&response),
                        &mut event,
                        &mut effective_rules,
                        fallback_only,
                        true,
                    )
                    .await
                {
                    return message::encode(&blocked).unwrap_or_default();
                }
                if guard.upgrade().is_none() {
                    return Bytes::new();
                }
            }

            if self.settings.dns64.is_some() && qtype == RecordType::AAAA {
                let has_aaaa = response
                    .answers()
                    .iter()
                    .any(|rr| rr.record_type() == RecordType::AAAA);
                if !has_aaaa {
                    if let Some(synthesized) =
                        crate::dns64::try_synthesize(&self.dns64, &selected_upstream, &request).await
                    {
                        debug!(domain = %normalized_domain, "dns64 synthesized response");
                        response = synthesized;
                    }
                    if guard.upgrade().is_none() {
                        return Bytes::new();
                    }
                }
            }

            if self.settings.block_ech && ech::remove_ech_svcparam(&mut response) {
                debug!(domain = %normalized_domain, "removed ECH parameters from SVCB/HTTPS RR");
            }
        }

        self.truncate_response(&mut response, &request, peer_info);
        let bytes = message::encode(&response).unwrap_or_default();
        event.bytes_sent = raw.len();
        event.bytes_received = bytes.len();
        self.finalize_event(
            &mut event,
            Some(&request),
            Some(&response),
            None,
            Some(selected_upstream.options().id),
            None,
        );
        self.cache.put(&request, response, Some(selected_upstream.options().id));
        bytes
    }

    /// Match `domain` and build a blocking or rewritten response when the
    /// effective rules demand one. Accumulated rules flow across pre/CNAME/IP
    /// phases through `effective_rules_so_far`.
    #[allow(clippy::too_many_arguments)]
    async fn apply_filter(
        &self,
        domain: &str,
        request: &Message,
        original_response: Option<&Message>,
        event: &mut DnsRequestProcessedEvent,
        effective_rules_so_far: &mut Vec<Arc<Rule>>,
        fallback_only: bool,
        fire_event: bool,
    ) -> Option<(Message, ResponseCode)> {
        let mut matched = self.filter.match_domain(domain);
        for rule in matched.iter() {
            debug!(domain = %domain, rule = %rule.text, "matched rule");
        }
        matched.append(effective_rules_so_far);

        let effective = filter::get_effective_rules(matched);

        let (used_rewrites, rewrite) = if effective.dnsrewrite.is_empty() {
            (Vec::new(), None)
        } else {
            let (used, info) = filter::apply_dnsrewrite(&effective.dnsrewrite);
            (used, Some(info))
        };

        *effective_rules_so_far = used_rewrites
            .iter()
            .chain(effective.leftovers.iter())
            .cloned()
            .collect();

        append_event_rules(event, &used_rewrites);
        if rewrite.is_none() {
            append_event_rules(event, &effective.leftovers);
        }

        if rewrite.is_none() && effective.leftovers_allow() {
            return None;
        }

        let response = match rewrite {
            Some(info) => {
                self.build_rewritten_response(request, info, fallback_only).await
            }
            None => {
                let governing = effective.leftovers[0].clone();
                debug!(rule = %governing.text, "query blocked by rule");
                self.build_rule_blocking_response(request, &governing)
            }
        };

        let rcode = response.response_code();
        if fire_event {
            let mut finalized = std::mem::take(event);
            self.finalize_event(
                &mut finalized,
                Some(request),
                Some(&response),
                original_response,
                None,
                None,
            );
        }
        Some((response, rcode))
    }

    fn build_rule_blocking_response(&self, request: &Message, governing: &Rule) -> Message {
        if let Some(address) = governing.hosts_address() {
            // A hosts rule carrying a concrete address answers with it.
            let unspecified = match address {
                std::net::IpAddr::V4(v4) => v4.is_unspecified(),
                std::net::IpAddr::V6(v6) => v6.is_unspecified(),
            };
            if !unspecified {
                if let Some(response) = self.address_answer(request, address) {
                    return response;
                }
            }
            return message::blocking_response(
                request,
                &self.settings,
                self.settings.hosts_rules_blocking_mode,
            );
        }
        message::blocking_response(
            request,
            &self.settings,
            self.settings.adblock_rules_blocking_mode,
        )
    }

    fn address_answer(&self, request: &Message, address: std::net::IpAddr) -> Option<Message> {
        let question = request.queries().first()?;
        let qtype = question.query_type();
        let record = match (qtype, address) {
            (RecordType::A, std::net::IpAddr::V4(v4)) => hickory_proto::rr::Record::from_rdata(
                question.name().clone(),
                self.settings.blocked_response_ttl_secs,
                RData::A(hickory_proto::rr::rdata::A(v4)),
            ),
            (RecordType::AAAA, std::net::IpAddr::V6(v6)) => hickory_proto::rr::Record::from_rdata(
                question.name().clone(),
                self.settings.blocked_response_ttl_secs,
                RData::AAAA(hickory_proto::rr::rdata::AAAA(v6)),
            ),
            _ => return None,
        };
        Some(message::build_response(request, ResponseCode::NoError, vec![record]))
    }

    /// Build the `$dnsrewrite` response: rewritten rcode, literal answers,
    /// and a resolved CNAME chain when one was rewritten in.
    async fn build_rewritten_response(
        &self,
        request: &Message,
        info: RewriteInfo,
        fallback_only: bool,
    ) -> Message {
        let Some(question) = request.queries().first() else {
            return message::servfail_response(request);
        };
        let qtype = question.query_type();
        let owner = question.name().clone();
        let ttl = self.settings.blocked_response_ttl_secs;

        if let Some(rcode) = info.rcode {
            if rcode != ResponseCode::NoError {
                return message::build_response(request, rcode, Vec::new());
            }
        }

        let mut answers = Vec::new();
        for address in &info.addresses {
            match (qtype, address) {
                (RecordType::A, std::net::IpAddr::V4(v4)) => {
                    answers.push(hickory_proto::rr::Record::from_rdata(
                        owner.clone(),
                        ttl,
                        RData::A(hickory_proto::rr::rdata::A(*v4)),
                    ));
                }
                (RecordType::AAAA, std::net::IpAddr::V6(v6)) => {
                    answers.push(hickory_proto::rr::Record::from_rdata(
                        owner.clone(),
                        ttl,
                        RData::AAAA(hickory_proto::rr::rdata::AAAA(*v6)),
                    ));
                }
                _ => {}
            }
        }

        if let Some(cname) = &info.cname {
            if let Ok(target) = Name::from_str(&format!("{cname}.")) {
                answers.push(hickory_proto::rr::Record::from_rdata(
                    owner.clone(),
                    ttl,
                    RData::CNAME(hickory_proto::rr::rdata::CNAME(target.clone())),
                ));
                // Resolve the rewritten name with a fresh internal query and
                // graft the matching records onto the answer.
                let rewritten = message::new_query(
                    target,
                    qtype,
                    question.query_class(),
                    request.recursion_desired(),
                    request.checking_disabled(),
                );
                let outcome = self
                    .balancer
                    .resolve(cname, Arc::new(rewritten), fallback_only)
                    .await;
                match outcome.response {
                    Ok(resolved) => {
                        for rr in resolved.answers() {
                            if rr.record_type() == qtype {
                                answers.push(rr.clone());
                            }
                        }
                    }
                    Err(err) => {
                        debug!(cname = %cname, error = %err, "failed to resolve rewritten cname");
                    }
                }
            }
        }

        message::build_response(request, ResponseCode::NoError, answers)
    }

    fn truncate_response(&self, response: &mut Message, request: &Message, peer_info: Option<PeerInfo>) {
        if peer_info.map_or(false, |info| info.transport == Transport::Udp) {
            let max_size = request
                .edns()
                .map(|edns| edns.max_payload() as usize)
                .unwrap_or(512)
                .max(512);
            if truncate(response, max_size) {
                debug!(max_size, "truncated response");
            }
        }
    }

    /// Every terminal path funnels through here exactly once.
    fn finalize_event(
        &self,
        event: &mut DnsRequestProcessedEvent,
        request: Option<&Message>,
        response: Option<&Message>,
        original_response: Option<&Message>,
        upstream_id: Option<i32>,
        error: Option<DnsError>,
    ) {
        if let Some(request) = request {
            if let Some(question) = request.queries().first() {
                event.r#type = question.query_type().to_string();
            }
        }
        if let Some(response) = response {
            event.status = response.response_code().to_string();
            event.answer = records_to_string(response.answers());
        }
        if let Some(original) = original_response {
            event.original_answer = records_to_string(original.answers());
        }
        event.upstream_id = upstream_id;
        event.error = error.as_ref().map(|e| e.to_string());
        event.elapsed = crate::events::unix_millis().saturating_sub(event.start_time);

        info!(
            event = "dns_response",
            domain = %event.domain,
            qtype = %event.r#type,
            status = %event.status,
            elapsed_ms = event.elapsed,
            upstream_id = ?event.upstream_id,
            cache = event.cache_hit,
            rules = event.rules.len(),
            error = ?event.error,
            "request processed"
        );
        self.events.fire(std::mem::take(event));
    }
}

/// Optimistic refresh: re-resolve an expired entry off the hot path and
/// either replace it or evict it.
async fn refresh_cached_entry(
    balancer: Arc<Balancer>,
    cache: ResponseCache,
    guard: Weak<()>,
    request: Message,
    normalized_domain: String,
) {
    debug!(domain = %normalized_domain, "starting background refresh of expired cache entry");
    let outcome = balancer
        .resolve(&normalized_domain, Arc::new(request.clone()), false)
        .await;
    if guard.upgrade().is_none() {
        return;
    }
    match outcome.response {
        Ok(response) => {
            let upstream_id = outcome.upstream.map(|u| u.options().id);
            cache.put(&request, response, upstream_id);
        }
        Err(err) => {
            debug!(domain = %normalized_domain, error = %err, "background refresh failed, evicting entry");
            cache.erase(&request);
        }
    }
}

/// Merge matched rules into the event: unique by text, most recent first,
/// filter list ids kept aligned. Whitelist reflects the governing rule.
fn append_event_rules(event: &mut DnsRequestProcessedEvent, rules: &[Arc<Rule>]) {
    if rules.is_empty() {
        return;
    }
    for rule in rules.iter().rev() {
        if event.rules.contains(&rule.text) {
            continue;
        }
        event.rules.insert(0, rule.text.clone());
        event.filter_list_ids.insert(0, rule.filter_id);
    }
    event.whitelist = rules[0].is_exception();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestProcessedCallback;
    use hickory_proto::rr::rdata::{A, CNAME};
    use hickory_proto::rr::{DNSClass, Record};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Upstream double with scripted responses keyed by query name.
    struct ScriptedUpstream {
        options: crate::upstream::UpstreamOptions,
        responses: StdMutex<Vec<(String, Result<Message, DnsError>)>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Upstream for ScriptedUpstream {
        fn options(&self) -> &crate::upstream::UpstreamOptions {
            &self.options
        }
        fn rtt_estimate(&self) -> Option<Duration> {
            None
        }
        fn update_rtt_estimate(&self, _rtt: Duration) {}
        async fn exchange(&self, request: &Message) -> Result<Message, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let qname = request.queries()[0].name().to_lowercase().to_string();
            let reply = {
                let scripts = self.responses.lock().unwrap();
                scripts.iter().find(|(name, _)| *name == qname).map(|(_, r)| r.clone())
            };
            match reply {
                // Responses must mirror the live request id.
                Some(Ok(mut msg)) => {
                    msg.set_id(request.id());
                    msg.add_queries(request.queries().to_vec());
                    Ok(msg)
                }
                Some(Err(e)) => Err(e),
                None => Err(DnsError::ExchangeError(format!("no script for {qname}"))),
            }
        }
    }

    fn scripted_with(
        id: i32,
        delay: Duration,
        responses: Vec<(&str, Result<Message, DnsError>)>,
    ) -> Arc<ScriptedUpstream> {
        Arc::new(ScriptedUpstream {
            options: crate::upstream::UpstreamOptions {
                id,
                address: format!("scripted-{id}"),
                timeout: Duration::from_secs(1),
                ignore_outbound_proxy: false,
            },
            responses: StdMutex::new(
                responses.into_iter().map(|(n, r)| (n.to_string(), r)).collect(),
            ),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn scripted(responses: Vec<(&str, Result<Message, DnsError>)>) -> Arc<ScriptedUpstream> {
        scripted_with(42, Duration::ZERO, responses)
    }

    fn noerror_with(answers: Vec<Record>) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(hickory_proto::op::MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        msg.set_recursion_available(true);
        msg.add_answers(answers);
        msg
    }

    struct TestHarness {
        forwarder: Arc<DnsForwarder>,
        events: Arc<StdMutex<Vec<DnsRequestProcessedEvent>>>,
    }

    fn harness_with(
        settings_json: serde_json::Value,
        upstream: Arc<ScriptedUpstream>,
    ) -> TestHarness {
        harness_with_fallbacks(settings_json, upstream, None)
    }

    fn harness_with_fallbacks(
        settings_json: serde_json::Value,
        upstream: Arc<ScriptedUpstream>,
        fallback: Option<Arc<ScriptedUpstream>>,
    ) -> TestHarness {
        let settings: ProxySettings = serde_json::from_value(settings_json).unwrap();
        let settings = Arc::new(settings);
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let callback: RequestProcessedCallback =
            Arc::new(move |event| sink.lock().unwrap().push(event));

        let filter_engine = FilterEngine::load(&settings.filter_params).expect("filter");
        let guard = Arc::new(());
        let balancer = Arc::new(Balancer::new(
            vec![upstream as Arc<dyn Upstream>],
            fallback.into_iter().map(|f| f as Arc<dyn Upstream>).collect(),
            filter::compile_fallback_filter(&settings.fallback_domains).expect("fallback filter"),
            false,
            false,
            Arc::downgrade(&guard),
        ));
        let forwarder = Arc::new(DnsForwarder {
            cache: ResponseCache::new(settings.dns_cache_size),
            settings,
            events: DnsProxyEvents { on_request_processed: Some(callback) },
            balancer,
            filter: Arc::new(filter_engine),
            dns64: Arc::new(Dns64State::new()),
            retransmissions: RetransmissionDetector::new(),
            shutdown_guard: StdMutex::new(Some(guard)),
            dns64_task: StdMutex::new(None),
        });
        TestHarness { forwarder, events }
    }

    #[tokio::test]
    async fn init_rejects_bad_custom_blocking_address() {
        let settings: ProxySettings = serde_json::from_value(serde_json::json!({
            "custom_blocking_ipv4": "not-an-ip",
        }))
        .unwrap();
        match DnsForwarder::init(settings, DnsProxyEvents::default()) {
            Err(InitError::InvalidIpv4(_)) => {}
            other => panic!("expected invalid ipv4 error, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn init_rejects_unusable_fallback_domain_pattern() {
        let settings: ProxySettings = serde_json::from_value(serde_json::json!({
            "fallback_domains": ["ok.example", "broken pattern"],
        }))
        .unwrap();
        match DnsForwarder::init(settings, DnsProxyEvents::default()) {
            Err(InitError::FallbackFilterInitError(reason)) => {
                assert!(reason.contains("broken pattern"));
            }
            other => panic!("expected fallback filter init error, got {:?}", other.is_ok()),
        }
    }

    fn query_bytes(domain: &str, qtype: RecordType) -> (Vec<u8>, Message) {
        let msg = message::new_query(
            Name::from_str(domain).unwrap(),
            qtype,
            DNSClass::IN,
            true,
            false,
        );
        (message::encode(&msg).unwrap().to_vec(), msg)
    }

    fn udp_peer() -> Option<PeerInfo> {
        Some(PeerInfo { peer: "127.0.0.1:53535".parse().unwrap(), transport: Transport::Udp })
    }

    fn filter_settings(rules: &str) -> serde_json::Value {
        serde_json::json!({
            "upstreams": [{"address": "127.0.0.1:1", "id": 1}],
            "filter_params": { "filters": [{ "id": 15, "rules": rules }] },
        })
    }

    #[tokio::test]
    async fn short_messages_are_dropped_with_an_event() {
        let harness = harness_with(filter_settings(""), scripted(vec![]));
        let out = harness.forwarder.handle_message(&[0u8; 4], udp_peer()).await;
        assert!(out.is_empty());
        let events = harness.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].error.as_deref().unwrap_or_default().contains("decode"));
    }

    #[tokio::test]
    async fn blocked_query_gets_refused_and_event_rules() {
        let harness = harness_with(filter_settings("||ads.example^"), scripted(vec![]));
        let (raw, _) = query_bytes("ads.example.", RecordType::AAAA);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        let response = Message::from_bytes(&out).unwrap();
        assert_eq!(response.response_code(), ResponseCode::Refused);

        let events = harness.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rules, vec!["||ads.example^".to_string()]);
        assert_eq!(events[0].filter_list_ids, vec![15]);
        assert!(!events[0].whitelist);
    }

    #[tokio::test]
    async fn hosts_rule_answers_with_its_address() {
        let harness = harness_with(filter_settings("1.2.3.4 pinned.example"), scripted(vec![]));
        let (raw, _) = query_bytes("pinned.example.", RecordType::A);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        let response = Message::from_bytes(&out).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, "1.2.3.4".parse::<std::net::Ipv4Addr>().unwrap()),
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwarded_query_is_cached_and_served_from_cache() {
        let name = Name::from_str("example.com.").unwrap();
        let upstream = scripted(vec![(
            "example.com.",
            Ok(noerror_with(vec![Record::from_rdata(
                name.clone(),
                300,
                RData::A(A("93.184.216.34".parse().unwrap())),
            )])),
        )]);
        let harness = harness_with(filter_settings(""), upstream.clone());

        let (raw, _) = query_bytes("example.com.", RecordType::A);
        let first = harness.forwarder.handle_message(&raw, udp_peer()).await;
        assert!(!first.is_empty());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        let (raw2, msg2) = query_bytes("example.com.", RecordType::A);
        let second = harness.forwarder.handle_message(&raw2, udp_peer()).await;
        let response = Message::from_bytes(&second).unwrap();
        assert_eq!(response.id(), msg2.id());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1, "served from cache");

        let events = harness.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events[0].cache_hit);
        assert!(events[1].cache_hit);
        assert_eq!(events[1].upstream_id, Some(42));
        // The hit came off the quick parse: the domain is the normalized
        // form, not the dotted FQDN the full decode reports.
        assert_eq!(events[1].domain, "example.com");
        assert_eq!(events[1].r#type, "A");
    }

    #[tokio::test]
    async fn cname_in_answer_is_blocked_post_resolution() {
        let name = Name::from_str("foo.example.").unwrap();
        let tracker = Name::from_str("tracker.bad.").unwrap();
        let upstream = scripted(vec![(
            "foo.example.",
            Ok(noerror_with(vec![
                Record::from_rdata(name.clone(), 300, RData::CNAME(CNAME(tracker.clone()))),
                Record::from_rdata(tracker.clone(), 300, RData::A(A("5.6.7.8".parse().unwrap()))),
            ])),
        )]);
        let harness = harness_with(filter_settings("||tracker.bad^"), upstream);

        let (raw, _) = query_bytes("foo.example.", RecordType::A);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        let response = Message::from_bytes(&out).unwrap();
        assert_eq!(response.response_code(), ResponseCode::Refused);

        let events = harness.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        // The original upstream answer is preserved in the event.
        assert!(events[0].original_answer.contains("tracker.bad"));
        assert_eq!(events[0].rules, vec!["||tracker.bad^".to_string()]);
    }

    #[tokio::test]
    async fn upstream_failure_is_silent_when_servfail_disabled() {
        let upstream = scripted(vec![(
            "example.com.",
            Err(DnsError::ExchangeError("unreachable".into())),
        )]);
        let settings = serde_json::json!({
            "upstreams": [{"address": "127.0.0.1:1", "id": 1}],
            "enable_servfail_on_upstreams_failure": false,
        });
        let harness = harness_with(settings, upstream);
        let (raw, _) = query_bytes("example.com.", RecordType::A);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        assert!(out.is_empty());
        let events = harness.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].error.is_some());
    }

    #[tokio::test]
    async fn upstream_failure_returns_servfail_by_default() {
        let upstream = scripted(vec![(
            "example.com.",
            Err(DnsError::ExchangeError("unreachable".into())),
        )]);
        let harness = harness_with(filter_settings(""), upstream);
        let (raw, _) = query_bytes("example.com.", RecordType::A);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        let response = Message::from_bytes(&out).unwrap();
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn mozilla_canary_is_nxdomain_without_touching_upstreams() {
        let upstream = scripted(vec![]);
        let harness = harness_with(filter_settings(""), upstream.clone());
        let (raw, _) = query_bytes("use-application-dns.net.", RecordType::A);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        let response = Message::from_bytes(&out).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn block_ipv6_returns_empty_soa_with_short_ttl() {
        let name = Name::from_str("example.com.").unwrap();
        let upstream = scripted(vec![(
            "example.com.",
            Ok(noerror_with(vec![Record::from_rdata(
                name,
                300,
                RData::A(A("1.1.1.1".parse().unwrap())),
            )])),
        )]);
        let settings = serde_json::json!({
            "upstreams": [{"address": "127.0.0.1:1", "id": 1}],
            "block_ipv6": true,
        });
        let harness = harness_with(settings, upstream.clone());
        let (raw, _) = query_bytes("example.com.", RecordType::AAAA);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        let response = Message::from_bytes(&out).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers().len(), 1);
        assert_eq!(response.name_servers()[0].ttl(), SOA_RETRY_IPV6_BLOCK);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dnsrewrite_address_short_circuits_resolution() {
        let harness = harness_with(
            filter_settings("||pinned.example^$dnsrewrite=10.0.0.1"),
            scripted(vec![]),
        );
        let (raw, _) = query_bytes("pinned.example.", RecordType::A);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        let response = Message::from_bytes(&out).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, "10.0.0.1".parse::<std::net::Ipv4Addr>().unwrap()),
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    #[tokio::test]
    async fn exception_rule_lets_query_through() {
        let name = Name::from_str("good.ads.example.").unwrap();
        let upstream = scripted(vec![(
            "good.ads.example.",
            Ok(noerror_with(vec![Record::from_rdata(
                name,
                300,
                RData::A(A("9.9.9.9".parse().unwrap())),
            )])),
        )]);
        let harness =
            harness_with(filter_settings("||ads.example^\n@@||good.ads.example^"), upstream);
        let (raw, _) = query_bytes("good.ads.example.", RecordType::A);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        let response = Message::from_bytes(&out).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);

        let events = harness.events.lock().unwrap();
        assert!(events[0].whitelist);
    }

    #[tokio::test]
    async fn every_path_fires_exactly_one_event() {
        let harness = harness_with(filter_settings("||blocked.example^"), scripted(vec![]));
        let inputs: Vec<Vec<u8>> = vec![
            vec![0u8; 3],
            query_bytes("blocked.example.", RecordType::A).0,
            query_bytes("use-application-dns.net.", RecordType::A).0,
            query_bytes("unresolvable.example.", RecordType::A).0,
        ];
        for (i, raw) in inputs.iter().enumerate() {
            let before = harness.events.lock().unwrap().len();
            let _ = harness.forwarder.handle_message(raw, udp_peer()).await;
            let after = harness.events.lock().unwrap().len();
            assert_eq!(after, before + 1, "input {i} fired {} events", after - before);
        }
    }

    #[tokio::test]
    async fn udp_responses_are_truncated_to_512_without_edns() {
        let name = Name::from_str("big.example.").unwrap();
        let answers: Vec<Record> = (0..80)
            .map(|i| {
                Record::from_rdata(
                    name.clone(),
                    300,
                    RData::A(A(format!("10.1.{}.{}", i / 256, i % 256).parse().unwrap())),
                )
            })
            .collect();
        let upstream = scripted(vec![("big.example.", Ok(noerror_with(answers)))]);
        let harness = harness_with(filter_settings(""), upstream);
        let (raw, _) = query_bytes("big.example.", RecordType::A);
        let out = harness.forwarder.handle_message(&raw, udp_peer()).await;
        assert!(out.len() <= 512, "udp response was {} bytes", out.len());
        let response = Message::from_bytes(&out).unwrap();
        assert!(response.truncated());
    }

    #[tokio::test]
    async fn retransmitted_query_is_steered_to_fallbacks() {
        let name = Name::from_str("slow.example.").unwrap();
        let slow = scripted_with(
            1,
            Duration::from_millis(300),
            vec![(
                "slow.example.",
                Ok(noerror_with(vec![Record::from_rdata(
                    name.clone(),
                    300,
                    RData::A(A("7.7.7.7".parse().unwrap())),
                )])),
            )],
        );
        let fallback = scripted_with(
            77,
            Duration::ZERO,
            vec![(
                "slow.example.",
                Ok(noerror_with(vec![Record::from_rdata(
                    name,
                    300,
                    RData::A(A("8.8.8.8".parse().unwrap())),
                )])),
            )],
        );
        let settings = serde_json::json!({
            "upstreams": [{"address": "127.0.0.1:1", "id": 1}],
            "enable_retransmission_handling": true,
            "dns_cache_size": 0,
        });
        let harness = harness_with_fallbacks(settings, slow, Some(fallback));

        let (raw, _) = query_bytes("slow.example.", RecordType::A);
        let forwarder = harness.forwarder.clone();
        let raw_first = raw.clone();
        let first = tokio::spawn(async move {
            forwarder.handle_message(&raw_first, udp_peer()).await
        });
        // Let the first copy get in flight before resending the same id.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = harness.forwarder.handle_message(&raw, udp_peer()).await;

        let second_msg = Message::from_bytes(&second).unwrap();
        match second_msg.answers()[0].data() {
            Some(RData::A(a)) => {
                assert_eq!(a.0, "8.8.8.8".parse::<std::net::Ipv4Addr>().unwrap(), "fallback answered")
            }
            other => panic!("unexpected rdata {other:?}"),
        }
        let first = first.await.unwrap();
        assert!(!first.is_empty());
    }
}
