//! Dedup state of the gossip transport.
//!
//! Computor sets and ticks are throttled, not deduplicated forever: each
//! channel remembers when it last carried a given announcement, and the
//! announcement goes out again once the minimum interval has passed. When
//! a message is forwarded, every channel it goes to is stamped with the
//! same instant, so a burst of copies from different neighbours collapses
//! into one send per channel.
//!
//! Transactions are deduplicated through a Bloom filter. It never forgets
//! and can report false positives at the configured rate, which only means
//! an occasional transaction is not relayed by this node.

use bitvec::prelude::*;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::GossipConfig;
use crate::crypto::short_digest;

/// Last send per channel. `None` means never, which is always eligible.
type Stamps = Vec<Option<Instant>>;

pub struct Dejavu {
    computors: Stamps,
    ticks: HashMap<(u16, u32), Stamps>,
    transactions: TransactionFilter,
    config: GossipConfig,
}

impl Dejavu {
    pub fn new(config: &GossipConfig) -> Self {
        Self {
            computors: vec![None; config.number_of_channels],
            ticks: HashMap::new(),
            transactions: TransactionFilter::new(
                config.transaction_filter_capacity,
                config.transaction_filter_false_positive_rate,
            ),
            config: config.clone(),
        }
    }

    /// Channels a computor set from `source` should go to. `open[j]` says
    /// whether channel `j` can send right now.
    pub fn computors_targets(&mut self, source: Option<usize>, open: &[bool], now: Instant) -> Vec<usize> {
        throttle(
            &mut self.computors,
            source,
            open,
            now,
            self.config.min_computors_propagation(),
            1.0,
        )
    }

    /// Channels the tick `(computor_index, tick)` from `source` should go to.
    pub fn tick_targets(
        &mut self,
        computor_index: u16,
        tick: u32,
        source: Option<usize>,
        open: &[bool],
        now: Instant,
    ) -> Vec<usize> {
        let channels = self.config.number_of_channels;
        let stamps = self
            .ticks
            .entry((computor_index, tick))
            .or_insert_with(|| vec![None; channels]);
        throttle(
            stamps,
            source,
            open,
            now,
            self.config.min_tick_propagation(),
            self.config.tick_propagation_probability,
        )
    }

    /// Records a transaction payload. `true` the first time it is seen.
    pub fn mark_transaction(&mut self, payload: &[u8]) -> bool {
        self.transactions.mark_if_unseen(payload)
    }

    /// Forgets tick throttles below `tick`. Nothing below a finalized tick
    /// is worth forwarding again.
    pub fn prune_ticks_below(&mut self, tick: u32) {
        let before = self.ticks.len();
        self.ticks.retain(|&(_, number), _| number >= tick);
        let pruned = before - self.ticks.len();
        if pruned > 0 {
            debug!(tick, pruned, "pruned tick dedup entries");
        }
    }

    pub fn tracked_ticks(&self) -> usize {
        self.ticks.len()
    }
}

fn throttle(
    stamps: &mut [Option<Instant>],
    source: Option<usize>,
    open: &[bool],
    now: Instant,
    min_interval: std::time::Duration,
    probability: f64,
) -> Vec<usize> {
    if let Some(stamp) = source.and_then(|s| stamps.get_mut(s)) {
        *stamp = Some(now);
    }
    let mut targets = Vec::new();
    for (j, stamp) in stamps.iter_mut().enumerate() {
        if Some(j) == source || !open.get(j).copied().unwrap_or(false) {
            continue;
        }
        let due = stamp.map_or(true, |last| now.saturating_duration_since(last) > min_interval);
        if due && (probability >= 1.0 || rand::random::<f64>() < probability) {
            *stamp = Some(now);
            targets.push(j);
        }
    }
    targets
}

// ---------------------------------------------------------------------------
// Transaction filter
// ---------------------------------------------------------------------------

/// Bloom filter over transaction payloads.
///
/// Bit positions come from a chain of 8-byte digests: the first over the
/// payload, each next one over the previous digest. A digest `v` maps to
/// bit `(v * m) >> 64`, which spreads evenly over `m` bits without a modulo.
pub struct TransactionFilter {
    bits: BitVec<u8, Lsb0>,
    hashes: usize,
}

impl TransactionFilter {
    /// Sizes the filter for `capacity` entries at false-positive rate `fpr`.
    pub fn new(capacity: usize, fpr: f64) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let fpr = fpr.clamp(f64::MIN_POSITIVE, 0.5);
        let bits = (-(capacity.max(1) as f64) * fpr.ln() / (ln2 * ln2)).ceil() as usize;
        let hashes = (-fpr.ln() / ln2).round().max(1.0) as usize;
        Self {
            bits: bitvec![u8, Lsb0; 0; bits.max(8)],
            hashes,
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    pub fn hashes(&self) -> usize {
        self.hashes
    }

    fn positions(&self, data: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let m = self.bits.len() as u128;
        let mut value = short_digest(data);
        (0..self.hashes).map(move |i| {
            if i > 0 {
                value = short_digest(&value.to_le_bytes());
            }
            ((u128::from(value) * m) >> 64) as usize
        })
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        self.positions(data).all(|bit| self.bits[bit])
    }

    /// Sets every bit of `data`. Returns `false` if all were already set.
    pub fn mark_if_unseen(&mut self, data: &[u8]) -> bool {
        if self.contains(data) {
            return false;
        }
        let positions: Vec<usize> = self.positions(data).collect();
        for bit in positions {
            self.bits.set(bit, true);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(channels: usize) -> GossipConfig {
        GossipConfig {
            number_of_channels: channels,
            transaction_filter_capacity: 10_000,
            ..GossipConfig::default()
        }
    }

    #[test]
    fn computor_sets_skip_the_source_and_closed_channels() {
        let mut dejavu = Dejavu::new(&config(4));
        let now = Instant::now();
        let targets = dejavu.computors_targets(Some(1), &[true, true, false, true], now);
        assert_eq!(targets, vec![0, 3]);
    }

    #[test]
    fn computor_sets_are_throttled_per_channel() {
        let cfg = config(3);
        let mut dejavu = Dejavu::new(&cfg);
        let open = [true; 3];
        let start = Instant::now();
        assert_eq!(dejavu.computors_targets(None, &open, start), vec![0, 1, 2]);

        let soon = start + Duration::from_secs(1);
        assert!(dejavu.computors_targets(None, &open, soon).is_empty());

        let later = start + cfg.min_computors_propagation() + Duration::from_millis(1);
        assert_eq!(dejavu.computors_targets(Some(0), &open, later), vec![1, 2]);
    }

    #[test]
    fn arrival_stamps_the_source_channel() {
        let cfg = config(2);
        let mut dejavu = Dejavu::new(&cfg);
        let start = Instant::now();
        dejavu.tick_targets(7, 100, Some(0), &[true, true], start);

        // Channel 0 just delivered this tick, so a local copy skips it.
        let soon = start + Duration::from_millis(10);
        assert!(dejavu.tick_targets(7, 100, None, &[true, true], soon).is_empty());
    }

    #[test]
    fn ticks_are_keyed_by_computor_and_number() {
        let mut dejavu = Dejavu::new(&config(2));
        let now = Instant::now();
        let open = [true, true];
        assert_eq!(dejavu.tick_targets(1, 10, None, &open, now), vec![0, 1]);
        assert_eq!(dejavu.tick_targets(2, 10, None, &open, now), vec![0, 1]);
        assert_eq!(dejavu.tick_targets(1, 11, None, &open, now), vec![0, 1]);
        assert!(dejavu.tick_targets(1, 10, None, &open, now).is_empty());
    }

    #[test]
    fn zero_probability_never_propagates_ticks() {
        let mut cfg = config(2);
        cfg.tick_propagation_probability = 0.0;
        let mut dejavu = Dejavu::new(&cfg);
        assert!(dejavu
            .tick_targets(1, 1, None, &[true, true], Instant::now())
            .is_empty());
    }

    #[test]
    fn pruning_drops_ticks_below_the_floor() {
        let mut dejavu = Dejavu::new(&config(2));
        let now = Instant::now();
        for tick in 10..20 {
            dejavu.tick_targets(0, tick, None, &[true, true], now);
        }
        dejavu.prune_ticks_below(15);
        assert_eq!(dejavu.tracked_ticks(), 5);
    }

    #[test]
    fn transaction_filter_marks_once() {
        let mut dejavu = Dejavu::new(&config(2));
        assert!(dejavu.mark_transaction(b"tx one"));
        assert!(!dejavu.mark_transaction(b"tx one"));
        assert!(dejavu.mark_transaction(b"tx two"));
    }

    #[test]
    fn filter_sizing_follows_the_bloom_formulas() {
        let filter = TransactionFilter::new(1_000, 0.01);
        // m = -n ln p / ln^2 2 ~ 9.59 n, k = -ln p / ln 2 ~ 6.64.
        assert_eq!(filter.bit_len(), 9_586);
        assert_eq!(filter.hashes(), 7);
    }

    #[test]
    fn filter_false_positive_rate_is_sane() {
        let mut filter = TransactionFilter::new(1_000, 0.01);
        for i in 0u32..1_000 {
            filter.mark_if_unseen(&i.to_le_bytes());
        }
        let false_positives = (1_000u32..11_000)
            .filter(|i| filter.contains(&i.to_le_bytes()))
            .count();
        assert!(false_positives < 300, "{false_positives} false positives");
    }
}
