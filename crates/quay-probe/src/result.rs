//! Result of a probing round and latency ranking.

use std::collections::HashMap;
use std::time::Duration;

use quay_types::PeerId;

/// Round-trip times for the peers that answered a probing round.
///
/// Peers that timed out or errored are absent: absence means "unknown",
/// not "down".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingManyResult {
    rtts: HashMap<PeerId, Duration>,
}

impl PingManyResult {
    /// Create an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's RTT, replacing any previous measurement.
    pub fn insert(&mut self, peer: PeerId, rtt: Duration) {
        self.rtts.insert(peer, rtt);
    }

    /// RTT measured for `peer`, if it answered.
    pub fn get(&self, peer: &PeerId) -> Option<Duration> {
        self.rtts.get(peer).copied()
    }

    /// Whether `peer` answered.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.rtts.contains_key(peer)
    }

    /// Number of peers that answered.
    pub fn len(&self) -> usize {
        self.rtts.len()
    }

    /// Whether no peer answered.
    pub fn is_empty(&self) -> bool {
        self.rtts.is_empty()
    }

    /// Iterate over `(peer, rtt)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Duration)> {
        self.rtts.iter()
    }

    /// All answering peers ordered by ascending RTT, ties broken by peer id.
    pub fn ranked(&self) -> Vec<(PeerId, Duration)> {
        let mut ranked: Vec<(PeerId, Duration)> =
            self.rtts.iter().map(|(p, rtt)| (*p, *rtt)).collect();
        ranked.sort_by(|(pa, ra), (pb, rb)| ra.cmp(rb).then_with(|| pa.cmp(pb)));
        ranked
    }

    /// The `n` lowest-latency peers, fastest first.
    ///
    /// `n` is clamped to the number of answering peers, so asking for more
    /// peers than answered returns all of them instead of failing.
    pub fn top_peers(&self, n: usize) -> Vec<PeerId> {
        let n = n.min(self.rtts.len());
        self.ranked().into_iter().take(n).map(|(p, _)| p).collect()
    }
}

impl FromIterator<(PeerId, Duration)> for PingManyResult {
    fn from_iter<I: IntoIterator<Item = (PeerId, Duration)>>(iter: I) -> Self {
        Self {
            rtts: iter.into_iter().collect(),
        }
    }
}
