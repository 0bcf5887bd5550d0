// =============================================================================
// CandleBuffer — ordered, deduplicated bars with an explicit per-bar state
// =============================================================================
//
// Invariants after every mutation:
//   - entries are sorted ascending by start_time, no duplicates;
//   - the tail is the only `Provisional` entry;
//   - every other entry is `Finalized`, and a finalized bar accepts at most one
//     scheduled correction.
// =============================================================================

use std::cmp::Ordering;

use serde::Serialize;

use crate::types::{Bar, BarUpdate};

/// Lifecycle of a bar inside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BarState {
    /// Newest bar; further updates with the same start time overwrite it.
    Provisional,
    /// A later bar exists. `corrected` is set once authoritative values have
    /// been applied.
    Finalized { corrected: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedBar {
    pub bar: Bar,
    pub state: BarState,
}

/// What a single update did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The tail was overwritten in place.
    Updated,
    /// A new tail was appended. `finalized` is the previous tail, now due for
    /// correction.
    Appended { finalized: Option<i64> },
    /// Older than the tail; dropped.
    Stale,
}

/// Result of merging a batch of authoritative bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Number of fetched bars merged.
    pub merged: usize,
    /// Former live tail that newer fetched bars pushed out of `Provisional`.
    /// It still carries stream values and is due for correction.
    pub demoted: Option<i64>,
}

/// How a correction is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionMode {
    /// Result of the automatic post-close fetch; applies once per bar.
    Scheduled,
    /// Explicit request (backfill, tests); always overwrites.
    Forced,
}

#[derive(Debug, Default, Clone)]
pub struct CandleBuffer {
    entries: Vec<BufferedBar>,
}

impl CandleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn last(&self) -> Option<&BufferedBar> {
        self.entries.last()
    }

    pub fn get(&self, start_time: i64) -> Option<&BufferedBar> {
        self.position(start_time).map(|i| &self.entries[i])
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[BufferedBar] {
        &self.entries
    }

    /// Owned copy of the bars, oldest first.
    pub fn bars(&self) -> Vec<Bar> {
        self.entries.iter().map(|e| e.bar).collect()
    }

    /// Union authoritative `fetched` bars into the buffer. Fetched values win
    /// on equal start times; bars only known from the live stream survive.
    pub fn merge_authoritative(&mut self, fetched: Vec<Bar>) -> MergeOutcome {
        let merged = fetched.len();
        let old_tail = self.entries.last().map(|e| e.bar.start_time);

        self.entries.extend(fetched.into_iter().map(|bar| BufferedBar {
            bar,
            state: BarState::Finalized { corrected: true },
        }));
        self.normalize();

        let demoted = old_tail.filter(|start| {
            self.get(*start).map(|e| e.state) == Some(BarState::Finalized { corrected: false })
        });
        MergeOutcome { merged, demoted }
    }

    /// Apply one streamed update.
    pub fn apply(&mut self, update: &BarUpdate) -> IngestOutcome {
        let incoming = Bar::from(update);

        let outcome = match self.entries.last_mut() {
            None => {
                self.entries.push(BufferedBar {
                    bar: incoming,
                    state: BarState::Provisional,
                });
                IngestOutcome::Appended { finalized: None }
            }
            Some(last) => match incoming.start_time.cmp(&last.bar.start_time) {
                Ordering::Equal => {
                    last.bar = incoming;
                    IngestOutcome::Updated
                }
                Ordering::Greater => {
                    let previous = last.bar.start_time;
                    last.state = BarState::Finalized { corrected: false };
                    self.entries.push(BufferedBar {
                        bar: incoming,
                        state: BarState::Provisional,
                    });
                    IngestOutcome::Appended {
                        finalized: Some(previous),
                    }
                }
                Ordering::Less => return IngestOutcome::Stale,
            },
        };

        self.normalize();
        outcome
    }

    /// Overwrite the OHLCV fields of the entry at `bar.start_time`.
    ///
    /// Returns `false` when the entry is absent, or when a scheduled correction
    /// targets a bar that is still provisional or already corrected.
    pub fn apply_correction(&mut self, bar: &Bar, mode: CorrectionMode) -> bool {
        let Some(idx) = self.position(bar.start_time) else {
            return false;
        };
        let entry = &mut self.entries[idx];

        match (mode, entry.state) {
            (CorrectionMode::Scheduled, BarState::Finalized { corrected: false }) => {}
            (CorrectionMode::Scheduled, _) => return false,
            (CorrectionMode::Forced, _) => {}
        }

        entry.bar.overwrite_prices(bar);
        if let BarState::Finalized { .. } = entry.state {
            entry.state = BarState::Finalized { corrected: true };
        }
        true
    }

    fn position(&self, start_time: i64) -> Option<usize> {
        self.entries
            .binary_search_by_key(&start_time, |e| e.bar.start_time)
            .ok()
    }

    /// Stable sort, keep the last entry per start time, then re-derive the
    /// tail state.
    fn normalize(&mut self) {
        self.entries.sort_by_key(|e| e.bar.start_time);

        let mut deduped: Vec<BufferedBar> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            match deduped.last_mut() {
                Some(prev) if prev.bar.start_time == entry.bar.start_time => *prev = entry,
                _ => deduped.push(entry),
            }
        }
        self.entries = deduped;

        let len = self.entries.len();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if i + 1 == len {
                entry.state = BarState::Provisional;
            } else if entry.state == BarState::Provisional {
                entry.state = BarState::Finalized { corrected: false };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bar, update};

    fn assert_sorted_unique(buf: &CandleBuffer) {
        let starts: Vec<i64> = buf.entries().iter().map(|e| e.bar.start_time).collect();
        assert!(starts.windows(2).all(|w| w[0] < w[1]), "not strictly ascending: {starts:?}");
    }

    #[test]
    fn first_update_becomes_provisional_tail() {
        let mut buf = CandleBuffer::new();
        assert_eq!(buf.apply(&update(0, 10.0, false)), IngestOutcome::Appended { finalized: None });
        assert_eq!(buf.last().unwrap().state, BarState::Provisional);
    }

    #[test]
    fn same_start_overwrites_in_place() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(0, 10.0, false));
        assert_eq!(buf.apply(&update(0, 11.0, false)), IngestOutcome::Updated);
        assert_eq!(buf.apply(&update(0, 12.0, true)), IngestOutcome::Updated);

        assert_eq!(buf.len(), 1);
        assert!((buf.last().unwrap().bar.close - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn identical_updates_are_idempotent() {
        let mut buf = CandleBuffer::new();
        buf.merge_authoritative(vec![bar(0, 9.0)]);
        buf.apply(&update(60_000, 10.0, false));
        let before = buf.bars();

        for _ in 0..3 {
            buf.apply(&update(60_000, 10.0, false));
        }
        assert_eq!(buf.bars(), before);
    }

    #[test]
    fn later_start_appends_and_finalizes_previous() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(0, 10.0, true));
        let outcome = buf.apply(&update(60_000, 20.0, false));

        assert_eq!(outcome, IngestOutcome::Appended { finalized: Some(0) });
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.get(0).unwrap().state, BarState::Finalized { corrected: false });
        assert_eq!(buf.get(60_000).unwrap().state, BarState::Provisional);
    }

    #[test]
    fn stale_update_is_dropped() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(0, 10.0, true));
        buf.apply(&update(60_000, 20.0, false));
        let before = buf.bars();

        assert_eq!(buf.apply(&update(0, 99.0, true)), IngestOutcome::Stale);
        assert_eq!(buf.apply(&update(-60_000, 1.0, true)), IngestOutcome::Stale);
        assert_eq!(buf.bars(), before);
    }

    #[test]
    fn ordering_holds_for_mixed_sequence() {
        let mut buf = CandleBuffer::new();
        let starts = [0, 0, 60_000, 30_000, 120_000, 120_000, 60_000, 180_000, 0];
        for (i, s) in starts.iter().enumerate() {
            buf.apply(&update(*s, i as f64, false));
            assert_sorted_unique(&buf);
        }
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn merge_into_empty_sorts_and_dedups_last_wins() {
        let mut buf = CandleBuffer::new();
        let added = buf.merge_authoritative(vec![bar(60_000, 2.0), bar(0, 1.0), bar(60_000, 3.0)]);

        assert_eq!(added, MergeOutcome { merged: 3, demoted: None });
        assert_sorted_unique(&buf);
        assert_eq!(buf.len(), 2);
        assert!((buf.get(60_000).unwrap().bar.close - 3.0).abs() < f64::EPSILON);
        assert_eq!(buf.get(0).unwrap().state, BarState::Finalized { corrected: true });
        assert_eq!(buf.last().unwrap().state, BarState::Provisional);
    }

    #[test]
    fn merge_preserves_live_only_bars() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(120_000, 30.0, false));

        buf.merge_authoritative(vec![bar(0, 10.0), bar(60_000, 20.0)]);

        let starts: Vec<i64> = buf.bars().iter().map(|b| b.start_time).collect();
        assert_eq!(starts, vec![0, 60_000, 120_000]);
        assert_eq!(buf.last().unwrap().state, BarState::Provisional);
        assert!((buf.last().unwrap().bar.close - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_reports_live_tail_pushed_out_by_newer_history() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(0, 10.0, true));

        let outcome = buf.merge_authoritative(vec![bar(60_000, 20.0), bar(120_000, 30.0)]);

        assert_eq!(outcome, MergeOutcome { merged: 2, demoted: Some(0) });
        assert_eq!(buf.get(0).unwrap().state, BarState::Finalized { corrected: false });
        assert_eq!(buf.last().unwrap().state, BarState::Provisional);
    }

    #[test]
    fn merge_over_live_tail_is_not_a_demotion() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(0, 10.0, true));
        buf.apply(&update(60_000, 20.0, false));

        // Tail overwritten by history, and a live-only tail that stays last.
        let outcome = buf.merge_authoritative(vec![bar(0, 10.5), bar(60_000, 20.5)]);
        assert_eq!(outcome.demoted, None);
        let outcome = buf.merge_authoritative(vec![bar(0, 10.5)]);
        assert_eq!(outcome.demoted, None);
    }

    #[test]
    fn merge_prefers_fetched_values() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(0, 10.0, true));
        buf.apply(&update(60_000, 20.0, false));

        buf.merge_authoritative(vec![bar(0, 10.25)]);

        assert!((buf.get(0).unwrap().bar.close - 10.25).abs() < f64::EPSILON);
        assert_eq!(buf.get(0).unwrap().state, BarState::Finalized { corrected: true });
    }

    #[test]
    fn scheduled_correction_applies_once() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(0, 10.0, true));
        buf.apply(&update(60_000, 20.0, false));

        assert!(buf.apply_correction(&bar(0, 10.5), CorrectionMode::Scheduled));
        assert!(!buf.apply_correction(&bar(0, 11.0), CorrectionMode::Scheduled));

        let b0 = buf.get(0).unwrap();
        assert!((b0.bar.close - 10.5).abs() < f64::EPSILON);
        assert_eq!(b0.state, BarState::Finalized { corrected: true });
        assert!((buf.get(60_000).unwrap().bar.close - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn scheduled_correction_skips_provisional_tail() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(0, 10.0, false));
        assert!(!buf.apply_correction(&bar(0, 10.5), CorrectionMode::Scheduled));
        assert!(buf.apply_correction(&bar(0, 10.5), CorrectionMode::Forced));
        assert_eq!(buf.last().unwrap().state, BarState::Provisional);
    }

    #[test]
    fn correction_for_absent_bar_is_noop() {
        let mut buf = CandleBuffer::new();
        buf.apply(&update(60_000, 20.0, false));
        let before = buf.bars();
        assert!(!buf.apply_correction(&bar(0, 1.0), CorrectionMode::Forced));
        assert_eq!(buf.bars(), before);
    }
}
