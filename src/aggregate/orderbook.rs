//! Local-orderbook diff bootstrap and maintenance.
//!
//! One [`OrderBookDiffMachine`] per symbol, owned by its shard. Sequencing
//! follows the vendor's `U`/`u` (first/last update id) convention: a diff is
//! acceptable in the `Synced` state only when `U == last_u + 1`.

use std::collections::BTreeMap;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

/// Minimum time between REST snapshot fetch requests for the same symbol.
pub const RESYNC_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Uninit,
    Bootstrapping,
    Synced,
    Resyncing,
}

/// A single raw diff frame as it arrives off the wire, before it has been
/// folded into the book.
#[derive(Debug, Clone)]
pub struct RawDiff {
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub ts_event_ns: u64,
    pub ts_recv_ns: u64,
}

/// Outcome of feeding a diff (or a snapshot) into the machine.
#[derive(Debug)]
pub enum DiffOutcome {
    /// Cached while bootstrapping; nothing to publish yet.
    Buffered,
    /// Dropped: stale relative to the current `last_u` (protocol-level drop,
    /// not an error).
    Stale,
    /// Applied in sequence. `(sequence, prev_sequence)` to stamp onto the
    /// canonical `OrderBookDiffEvent`, plus whether each side changed — an
    /// L1 event is re-derived whenever the bid side or ask side changes.
    Applied {
        sequence: u64,
        prev_sequence: u64,
        bid_side_changed: bool,
        ask_side_changed: bool,
    },
    /// A sequence gap was detected; the book was cleared and a resync is
    /// now pending.
    GapDetected,
}

/// Per-symbol orderbook diff state machine.
pub struct OrderBookDiffMachine {
    state: BookState,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_u: u64,
    pending: Vec<RawDiff>,
    last_resync_request_ns: Option<u64>,
}

impl Default for OrderBookDiffMachine {
    fn default() -> Self {
        Self {
            state: BookState::Uninit,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_u: 0,
            pending: Vec::new(),
            last_resync_request_ns: None,
        }
    }
}

impl OrderBookDiffMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn last_u(&self) -> u64 {
        self.last_u
    }

    /// Whether a REST snapshot should be (re-)requested right now, honoring
    /// the per-symbol cooldown.
    pub fn snapshot_due(&self, now_ns: u64) -> bool {
        match self.state {
            BookState::Uninit | BookState::Resyncing => match self.last_resync_request_ns {
                None => true,
                Some(last) => now_ns.saturating_sub(last) >= RESYNC_COOLDOWN.as_nanos() as u64,
            },
            _ => false,
        }
    }

    pub fn mark_snapshot_requested(&mut self, now_ns: u64) {
        self.last_resync_request_ns = Some(now_ns);
        if self.state == BookState::Uninit {
            self.state = BookState::Bootstrapping;
        }
    }

    pub fn feed_diff(&mut self, diff: RawDiff) -> DiffOutcome {
        match self.state {
            BookState::Uninit => {
                self.state = BookState::Bootstrapping;
                self.pending.push(diff);
                DiffOutcome::Buffered
            }
            BookState::Bootstrapping | BookState::Resyncing => {
                self.pending.push(diff);
                DiffOutcome::Buffered
            }
            BookState::Synced => self.apply_synced(diff),
        }
    }

    fn apply_synced(&mut self, diff: RawDiff) -> DiffOutcome {
        if diff.last_update_id <= self.last_u {
            return DiffOutcome::Stale;
        }
        if diff.first_update_id != self.last_u + 1 {
            warn!(
                expected = self.last_u + 1,
                got = diff.first_update_id,
                "orderbook sequence gap, clearing book and scheduling resync"
            );
            self.bids.clear();
            self.asks.clear();
            self.state = BookState::Resyncing;
            return DiffOutcome::GapDetected;
        }

        let prev_sequence = self.last_u;
        let (bid_changed, ask_changed) = self.apply_levels(&diff);
        self.last_u = diff.last_update_id;

        DiffOutcome::Applied {
            sequence: diff.last_update_id,
            prev_sequence,
            bid_side_changed: bid_changed,
            ask_side_changed: ask_changed,
        }
    }

    fn apply_levels(&mut self, diff: &RawDiff) -> (bool, bool) {
        let bid_changed = !diff.bids.is_empty();
        let ask_changed = !diff.asks.is_empty();
        for (price, qty) in &diff.bids {
            if qty.is_zero() {
                self.bids.remove(price);
            } else {
                self.bids.insert(*price, *qty);
            }
        }
        for (price, qty) in &diff.asks {
            if qty.is_zero() {
                self.asks.remove(price);
            } else {
                self.asks.insert(*price, *qty);
            }
        }
        (bid_changed, ask_changed)
    }

    /// Integrate a REST snapshot's `lastUpdateId`, discarding cached diffs
    /// that are entirely behind it (`u <= L`) and then applying the first
    /// diff that straddles the snapshot point (`U <= L+1 <= u`) — that diff
    /// typically has `U` at or before `L+1`, not exactly equal to it, since
    /// the snapshot is taken mid-stream. Every diff after that first one
    /// goes through the normal `U == last_u + 1` contiguity check.
    pub fn integrate_snapshot(
        &mut self,
        snapshot_bids: Vec<(Decimal, Decimal)>,
        snapshot_asks: Vec<(Decimal, Decimal)>,
        snapshot_last_update_id: u64,
    ) -> Vec<DiffOutcome> {
        self.bids = snapshot_bids.into_iter().collect();
        self.asks = snapshot_asks.into_iter().collect();
        self.last_u = snapshot_last_update_id;
        self.state = BookState::Synced;

        let pending = std::mem::take(&mut self.pending);
        let mut outcomes = Vec::new();
        let mut bootstrapped = false;
        for diff in pending {
            if !bootstrapped {
                if diff.last_update_id <= snapshot_last_update_id {
                    continue; // entirely behind the snapshot, discard
                }
                outcomes.push(self.apply_bootstrap_diff(diff, snapshot_last_update_id));
                bootstrapped = true;
            } else {
                outcomes.push(self.apply_synced(diff));
            }
        }
        outcomes
    }

    /// Accept the first post-snapshot diff whenever it straddles the
    /// snapshot's `last_update_id` (`U <= L+1 <= u`, already guaranteed on
    /// the `u` side by the caller's discard filter). A `U` past `L+1` is a
    /// genuine gap at bootstrap, not a contiguity mismatch to tolerate.
    fn apply_bootstrap_diff(&mut self, diff: RawDiff, snapshot_last_update_id: u64) -> DiffOutcome {
        if diff.first_update_id > snapshot_last_update_id + 1 {
            warn!(
                expected_at_most = snapshot_last_update_id + 1,
                got = diff.first_update_id,
                "orderbook gap at bootstrap, clearing book and scheduling resync"
            );
            self.bids.clear();
            self.asks.clear();
            self.state = BookState::Resyncing;
            return DiffOutcome::GapDetected;
        }

        let prev_sequence = self.last_u;
        let (bid_changed, ask_changed) = self.apply_levels(&diff);
        self.last_u = diff.last_update_id;

        DiffOutcome::Applied {
            sequence: diff.last_update_id,
            prev_sequence,
            bid_side_changed: bid_changed,
            ask_side_changed: ask_changed,
        }
    }

    /// Best bid/ask and their quantities, or `None` if the relevant side is
    /// empty.
    pub fn l1(&self) -> (Option<(Decimal, Decimal)>, Option<(Decimal, Decimal)>) {
        let best_bid = self.bids.iter().next_back().map(|(p, q)| (*p, *q));
        let best_ask = self.asks.iter().next().map(|(p, q)| (*p, *q));
        (best_bid, best_ask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn diff(u_first: u64, u_last: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> RawDiff {
        RawDiff {
            first_update_id: u_first,
            last_update_id: u_last,
            bids: bids.iter().map(|(p, q)| (dec(p), dec(q))).collect(),
            asks: asks.iter().map(|(p, q)| (dec(p), dec(q))).collect(),
            ts_event_ns: 0,
            ts_recv_ns: 0,
        }
    }

    #[test]
    fn bootstrap_then_apply_sequential_diffs() {
        let mut book = OrderBookDiffMachine::new();
        assert!(matches!(
            book.feed_diff(diff(990, 995, &[("100", "1")], &[])),
            DiffOutcome::Buffered
        ));

        let outcomes = book.integrate_snapshot(vec![(dec("100"), dec("1"))], vec![], 995);
        assert_eq!(book.state(), BookState::Synced);
        assert!(outcomes.is_empty(), "the only cached diff was <= snapshot last_u, discarded");

        match book.feed_diff(diff(996, 1000, &[("101", "2")], &[])) {
            DiffOutcome::Applied { sequence, prev_sequence, .. } => {
                assert_eq!(sequence, 1000);
                assert_eq!(prev_sequence, 995);
            }
            other => panic!("expected Applied, got {other:?}"),
        }
        assert_eq!(book.last_u(), 1000);
    }

    /// The normal bootstrap case: the first post-snapshot diff straddles
    /// `last_update_id` (`U < L+1 <= u`) rather than starting exactly at
    /// `L+1`. It must be accepted, not misread as a sequence gap.
    #[test]
    fn straddling_first_diff_after_snapshot_is_applied_not_gapped() {
        let mut book = OrderBookDiffMachine::new();
        assert!(matches!(
            book.feed_diff(diff(990, 1005, &[("101", "2")], &[])),
            DiffOutcome::Buffered
        ));

        let outcomes = book.integrate_snapshot(vec![(dec("100"), dec("1"))], vec![], 1000);
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            DiffOutcome::Applied { sequence, prev_sequence, .. } => {
                assert_eq!(*sequence, 1005);
                assert_eq!(*prev_sequence, 1000);
            }
            other => panic!("expected Applied, got {other:?}"),
        }
        assert_eq!(book.state(), BookState::Synced);
        assert_eq!(book.last_u(), 1005);

        match book.feed_diff(diff(1006, 1010, &[("102", "3")], &[])) {
            DiffOutcome::Applied { sequence, .. } => assert_eq!(sequence, 1010),
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    /// Scenario S3: a gap forces a resync.
    #[test]
    fn gap_triggers_resync_and_clears_book() {
        let mut book = OrderBookDiffMachine::new();
        book.integrate_snapshot(vec![(dec("100"), dec("1"))], vec![(dec("101"), dec("1"))], 1000);
        assert_eq!(book.last_u(), 1000);

        let outcome = book.feed_diff(diff(1005, 1010, &[("102", "3")], &[]));
        assert!(matches!(outcome, DiffOutcome::GapDetected));
        assert_eq!(book.state(), BookState::Resyncing);
        assert_eq!(book.l1(), (None, None));
    }

    #[test]
    fn stale_diff_is_dropped() {
        let mut book = OrderBookDiffMachine::new();
        book.integrate_snapshot(vec![], vec![], 1000);
        let outcome = book.feed_diff(diff(990, 999, &[("1", "1")], &[]));
        assert!(matches!(outcome, DiffOutcome::Stale));
    }

    #[test]
    fn qty_zero_deletes_level() {
        let mut book = OrderBookDiffMachine::new();
        book.integrate_snapshot(vec![(dec("100"), dec("1"))], vec![], 1000);
        book.feed_diff(diff(1001, 1001, &[("100", "0")], &[]));
        assert_eq!(book.l1().0, None);
    }

    #[test]
    fn resync_cooldown_blocks_immediate_refetch() {
        let mut book = OrderBookDiffMachine::new();
        assert!(book.snapshot_due(0));
        book.mark_snapshot_requested(0);
        assert!(!book.snapshot_due(1));
        assert!(book.snapshot_due(RESYNC_COOLDOWN.as_nanos() as u64));
    }
}
