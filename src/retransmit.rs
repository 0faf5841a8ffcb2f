use std::net::SocketAddr;

use dashmap::DashMap;

/// Counts in-flight UDP requests per `(transaction id, peer)`. A count above
/// one means the client resent the query while the first copy was still
/// being resolved; such queries are steered to the fallback upstreams.
#[derive(Default)]
pub struct RetransmissionDetector {
    counts: DashMap<(u16, SocketAddr), u32>,
}

impl RetransmissionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight packet and return the post-increment count.
    pub fn register(&self, tx_id: u16, peer: SocketAddr) -> u32 {
        let mut entry = self.counts.entry((tx_id, peer)).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Drop one registration; the entry disappears when the count reaches zero.
    pub fn deregister(&self, tx_id: u16, peer: SocketAddr) {
        let remove = match self.counts.get_mut(&(tx_id, peer)) {
            Some(mut entry) => {
                *entry = entry.saturating_sub(1);
                *entry == 0
            }
            None => false,
        };
        if remove {
            self.counts.remove_if(&(tx_id, peer), |_, count| *count == 0);
        }
    }
}
