//! Upstream selection: weighted-random serial balancing, parallel racing
//! and fallback handling.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::{Message, ResponseCode};
use rand::distributions::{Distribution, WeightedIndex};
use tracing::{debug, warn};

use crate::errors::DnsError;
use crate::filter::FilterEngine;
use crate::upstream::Upstream;

pub struct ExchangeOutcome {
    pub response: Result<Message, DnsError>,
    pub upstream: Option<Arc<dyn Upstream>>,
}

impl ExchangeOutcome {
    fn err(error: DnsError) -> Self {
        Self { response: Err(error), upstream: None }
    }
}

pub struct Balancer {
    upstreams: Vec<Arc<dyn Upstream>>,
    fallbacks: Vec<Arc<dyn Upstream>>,
    fallback_filter: FilterEngine,
    parallel_queries: bool,
    fallback_on_failure: bool,
    shutdown: Weak<()>,
}

fn max_rtt(upstreams: &[Arc<dyn Upstream>]) -> Duration {
    upstreams
        .iter()
        .filter_map(|u| u.rtt_estimate())
        .max()
        .unwrap_or(Duration::ZERO)
}

/// Rank for wait-all races; higher wins. Non-error beats error, NOERROR
/// beats other rcodes, more answers beat fewer.
fn rank(result: &Result<Message, DnsError>) -> (u8, u8, usize) {
    match result {
        Err(_) => (0, 0, 0),
        Ok(msg) => {
            let noerror = (msg.response_code() == ResponseCode::NoError) as u8;
            (1, noerror, msg.answers().len())
        }
    }
}

/// One attempt against one upstream: a single silent retry after a dropped
/// connection, and an RTT update before the result propagates.
async fn exchange_once(
    upstream: Arc<dyn Upstream>,
    request: Arc<Message>,
    error_rtt: Duration,
) -> (Result<Message, DnsError>, Arc<dyn Upstream>) {
    let mut started = Instant::now();
    let mut result = upstream.exchange(&request).await;

    if result.as_ref().err().map_or(false, |e| e.is_retryable()) {
        debug!(upstream = %upstream.options().address, "retrying exchange after dropped connection");
        started = Instant::now();
        result = upstream.exchange(&request).await;
    }

    match &result {
        Ok(_) => upstream.update_rtt_estimate(started.elapsed()),
        Err(_) => upstream.update_rtt_estimate(error_rtt),
    }
    (result, upstream)
}

impl Balancer {
    pub fn new(
        upstreams: Vec<Arc<dyn Upstream>>,
        fallbacks: Vec<Arc<dyn Upstream>>,
        fallback_filter: FilterEngine,
        parallel_queries: bool,
        fallback_on_failure: bool,
        shutdown: Weak<()>,
    ) -> Self {
        Self {
            upstreams,
            fallbacks,
            fallback_filter,
            parallel_queries,
            fallback_on_failure,
            shutdown,
        }
    }

    pub fn upstreams(&self) -> &[Arc<dyn Upstream>] {
        &self.upstreams
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.upgrade().is_none()
    }

    /// Resolve `request` against the configured upstreams. Retransmitted
    /// queries and fallback-filter domains go straight to the fallbacks.
    pub async fn resolve(
        &self,
        normalized_domain: &str,
        request: Arc<Message>,
        force_fallback: bool,
    ) -> ExchangeOutcome {
        let use_fallbacks = !self.fallbacks.is_empty()
            && (force_fallback || !self.fallback_filter.match_domain(normalized_domain).is_empty());

        let set: Vec<Arc<dyn Upstream>> = if use_fallbacks {
            self.fallbacks.clone()
        } else {
            self.upstreams.clone()
        };
        if set.is_empty() {
            return ExchangeOutcome::err(DnsError::InternalError("no upstreams have been asked".into()));
        }
        let error_rtt = 2 * max_rtt(&set);

        if use_fallbacks {
            // Fallbacks always race with wait-all.
            return self.race_wait_all(set, request, error_rtt).await;
        }
        if self.parallel_queries {
            return self.race_first_ok(set, request, error_rtt).await;
        }
        self.serial_weighted(set, request, error_rtt).await
    }

    /// Launch every exchange, await them all, return the best-ranked result.
    async fn race_wait_all(
        &self,
        set: Vec<Arc<dyn Upstream>>,
        request: Arc<Message>,
        error_rtt: Duration,
    ) -> ExchangeOutcome {
        let attempts = set
            .into_iter()
            .map(|upstream| exchange_once(upstream, request.clone(), error_rtt));
        let mut results = join_all(attempts).await;
        if self.shutting_down() {
            return ExchangeOutcome::err(DnsError::ShuttingDown);
        }
        results.sort_by_key(|(result, _)| rank(result));
        match results.pop() {
            Some((response, upstream)) => ExchangeOutcome { response, upstream: Some(upstream) },
            None => ExchangeOutcome::err(DnsError::InternalError("no upstreams have been asked".into())),
        }
    }

    /// Launch every exchange, return the first usable answer. A SERVFAIL is
    /// held back in the hope that a slower upstream still has a real one.
    /// Losing attempts are left running detached; the shared request keeps
    /// their memory valid.
    async fn race_first_ok(
        &self,
        set: Vec<Arc<dyn Upstream>>,
        request: Arc<Message>,
        error_rtt: Duration,
    ) -> ExchangeOutcome {
        let mut attempts = FuturesUnordered::new();
        for upstream in set {
            let request = request.clone();
            attempts.push(tokio::spawn(exchange_once(upstream, request, error_rtt)));
        }

        let mut best: Option<ExchangeOutcome> = None;
        while let Some(joined) = attempts.next().await {
            if self.shutting_down() {
                return ExchangeOutcome::err(DnsError::ShuttingDown);
            }
            let Ok((result, upstream)) = joined else { continue };
            let winning = matches!(&result, Ok(response) if response.response_code() != ResponseCode::ServFail);
            if winning {
                return ExchangeOutcome { response: result, upstream: Some(upstream) };
            }
            if best.as_ref().map_or(true, |held| rank(&result) >= rank(&held.response)) {
                best = Some(ExchangeOutcome { response: result, upstream: Some(upstream) });
            }
        }
        best.unwrap_or_else(|| {
            ExchangeOutcome::err(DnsError::InternalError("no upstreams have been asked".into()))
        })
    }

    /// Weighted-random selection by inverse RTT; upstreams without an
    /// estimate get queried first.
    async fn serial_weighted(
        &self,
        mut set: Vec<Arc<dyn Upstream>>,
        request: Arc<Message>,
        error_rtt: Duration,
    ) -> ExchangeOutcome {
        let mut last: Option<ExchangeOutcome> = None;
        while !set.is_empty() {
            let cold = set.iter().position(|u| u.rtt_estimate().is_none());
            let selected = match cold {
                Some(idx) => idx,
                None => {
                    let weights: Vec<f64> = set
                        .iter()
                        .map(|u| {
                            let ms = u.rtt_estimate().unwrap_or_default().as_millis().max(1);
                            1.0 / ms as f64
                        })
                        .collect();
                    match WeightedIndex::new(&weights) {
                        Ok(distribution) => distribution.sample(&mut rand::thread_rng()),
                        Err(_) => 0,
                    }
                }
            };

            let upstream = set[selected].clone();
            let (result, upstream) = exchange_once(upstream, request.clone(), error_rtt).await;
            if self.shutting_down() {
                return ExchangeOutcome::err(DnsError::ShuttingDown);
            }

            let timed_out = matches!(result, Err(DnsError::TimedOut));
            if result.is_ok() || timed_out {
                // A timed-out client has likely stopped waiting; cascading
                // to other upstreams would only waste their budget.
                return ExchangeOutcome { response: result, upstream: Some(upstream) };
            }

            warn!(upstream = %upstream.options().address,
                  error = %result.as_ref().err().map(|e| e.to_string()).unwrap_or_default(),
                  "disqualifying upstream for this query");
            last = Some(ExchangeOutcome { response: result, upstream: Some(upstream) });
            set.swap_remove(selected);
        }

        if self.fallback_on_failure && !self.fallbacks.is_empty() {
            let fallbacks = self.fallbacks.clone();
            let error_rtt = 2 * max_rtt(&fallbacks);
            return self.race_wait_all(fallbacks, request, error_rtt).await;
        }

        last.unwrap_or_else(|| ExchangeOutcome::err(DnsError::InternalError("no upstreams have been asked".into())))
    }
}
