//! Motion-Sample Deduplication
//!
//! Converts a stream of possibly overlapping, possibly retried step-count
//! samples into a monotonic step award with no double counting.
//!
//! ## Per-sample decision
//!
//! ```text
//!   progress[id] >= end ──────────────► Duplicate  (already awarded)
//!   end <= last_processed_end ────────► Superseded (covered by watermark)
//!   end < start or steps < 0 ─────────► Rejected   (malformed)
//!   otherwise ────────────────────────► award round(steps × correction)
//! ```
//!
//! The global watermark only advances once the whole batch is decided, so
//! the order of samples inside a batch does not matter. Batches are staged
//! first and committed after the ledger accepted the award; a failed sensor
//! query or a rejected credit never touches the dedup state.

use std::collections::BTreeMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::core::amount::{Amount, DEFAULT_STEP_CORRECTION, round_steps};

// =============================================================================
// SAMPLES
// =============================================================================

/// Unique sensor sample identifier.
pub type SampleId = Uuid;

/// One sensor-reported step-count observation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Sample id assigned by the sensor store.
    pub sample_id: SampleId,
    /// Start of the covered interval.
    pub start_time: DateTime<Utc>,
    /// End of the covered interval.
    pub end_time: DateTime<Utc>,
    /// Raw step count reported for the interval.
    pub step_value: Amount,
}

impl MotionSample {
    /// Create a sample.
    pub fn new(
        sample_id: SampleId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step_value: Amount,
    ) -> Self {
        Self { sample_id, start_time, end_time, step_value }
    }

    fn is_well_formed(&self) -> bool {
        self.end_time >= self.start_time && !self.step_value.is_sign_negative()
    }
}

// =============================================================================
// SENSOR
// =============================================================================

/// Motion input failures. Recoverable: step income stops, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    /// No motion hardware or data store on this device.
    #[error("Motion sensor unavailable")]
    Unavailable,

    /// User declined motion/fitness access.
    #[error("Motion sensor access denied")]
    AuthDenied,

    /// The query itself failed.
    #[error("Motion query failed: {0}")]
    QueryFailed(String),
}

impl SensorError {
    /// User-facing guidance for the UI.
    pub fn guidance(&self) -> &'static str {
        match self {
            SensorError::Unavailable => {
                "Step tracking isn't available on this device. Steps won't earn coins."
            }
            SensorError::AuthDenied => {
                "Allow motion & fitness access in Settings to earn coins from your steps."
            }
            SensorError::QueryFailed(_) => {
                "Couldn't read your steps right now. We'll try again shortly."
            }
        }
    }
}

/// External step-count provider.
#[async_trait]
pub trait MotionSource: Send + Sync {
    /// Fetch samples ending after `since` (all samples when `None`).
    async fn query(&self, since: Option<DateTime<Utc>>) -> Result<Vec<MotionSample>, SensorError>;
}

// =============================================================================
// DEDUP STATE
// =============================================================================

/// Persisted dedup watermarks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionDedupState {
    /// Global watermark: samples ending at or before it are done.
    pub last_processed_end: Option<DateTime<Utc>>,
    /// Per-sample high-water mark: `sample_id → last awarded end_time`.
    pub sample_progress: BTreeMap<SampleId, DateTime<Utc>>,
}

/// Per-batch award summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAward {
    /// Corrected steps awarded.
    pub steps: u64,
    /// Samples that produced an award.
    pub accepted: usize,
    /// Samples already awarded under the same id.
    pub duplicates: usize,
    /// Samples at or behind the global watermark.
    pub superseded: usize,
    /// Malformed samples.
    pub rejected: usize,
}

/// A decided batch waiting to be committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedBatch {
    /// What the batch awards.
    pub award: StepAward,
    next: MotionDedupState,
}

/// Motion-sample deduplicator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MotionDeduplicator {
    state: MotionDedupState,
    correction_factor: Amount,
}

impl Default for MotionDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_CORRECTION)
    }
}

impl MotionDeduplicator {
    /// Fresh deduplicator.
    pub fn new(correction_factor: Amount) -> Self {
        Self::with_state(MotionDedupState::default(), correction_factor)
    }

    /// Restore from persisted watermarks.
    pub fn with_state(state: MotionDedupState, correction_factor: Amount) -> Self {
        Self { state, correction_factor }
    }

    /// Current watermarks.
    pub fn state(&self) -> &MotionDedupState {
        &self.state
    }

    /// Global watermark.
    pub fn last_processed_end(&self) -> Option<DateTime<Utc>> {
        self.state.last_processed_end
    }

    /// Decide a batch without changing any state.
    pub fn stage(&self, samples: &[MotionSample]) -> StagedBatch {
        let mut next = self.state.clone();
        let mut award = StepAward::default();
        let watermark = self.state.last_processed_end;
        let mut batch_max_end: Option<DateTime<Utc>> = None;

        for sample in samples {
            if let Some(&awarded_end) = next.sample_progress.get(&sample.sample_id) {
                if awarded_end >= sample.end_time {
                    award.duplicates += 1;
                    continue;
                }
            }
            if watermark.is_some_and(|w| sample.end_time <= w) {
                award.superseded += 1;
                continue;
            }
            if !sample.is_well_formed() {
                award.rejected += 1;
                continue;
            }

            let corrected = sample
                .step_value
                .checked_mul(self.correction_factor)
                .unwrap_or(Decimal::MAX);
            award.steps = award.steps.saturating_add(round_steps(corrected));
            award.accepted += 1;

            next.sample_progress.insert(sample.sample_id, sample.end_time);
            batch_max_end = Some(match batch_max_end {
                Some(end) if end >= sample.end_time => end,
                _ => sample.end_time,
            });
        }

        if let Some(end) = batch_max_end {
            if watermark.map_or(true, |w| end > w) {
                next.last_processed_end = Some(end);
            }
        }

        // Entries behind the global watermark are covered by it.
        if let Some(w) = next.last_processed_end {
            next.sample_progress.retain(|_, end| *end >= w);
        }

        StagedBatch { award, next }
    }

    /// Adopt a staged batch's watermarks.
    pub fn commit(&mut self, staged: StagedBatch) -> StepAward {
        self.state = staged.next;
        staged.award
    }

    /// Stage and commit in one step.
    pub fn process_batch(&mut self, samples: &[MotionSample]) -> StepAward {
        let staged = self.stage(samples);
        self.commit(staged)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn t(s: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + s, 0).unwrap()
    }

    fn sample(id: u128, start: i64, end: i64, steps: i64) -> MotionSample {
        MotionSample::new(Uuid::from_u128(id), t(start), t(end), Decimal::from(steps))
    }

    #[test]
    fn test_correction_applied() {
        let mut dedup = MotionDeduplicator::default();
        let award = dedup.process_batch(&[sample(1, 0, 60, 100)]);
        assert_eq!(award.steps, 60);
        assert_eq!(award.accepted, 1);
        assert_eq!(dedup.last_processed_end(), Some(t(60)));
    }

    #[test]
    fn test_same_sample_twice_awards_once() {
        let mut dedup = MotionDeduplicator::default();
        let s = sample(1, 0, 60, 100);

        let first = dedup.process_batch(&[s.clone()]);
        let second = dedup.process_batch(&[s.clone()]);
        assert_eq!(first.steps, 60);
        assert_eq!(second.steps, 0);

        // Duplicate inside one batch.
        let mut fresh = MotionDeduplicator::default();
        let award = fresh.process_batch(&[s.clone(), s]);
        assert_eq!(award.steps, 60);
        assert_eq!(award.duplicates, 1);
    }

    #[test]
    fn test_novel_id_behind_watermark_discarded() {
        let mut dedup = MotionDeduplicator::default();
        dedup.process_batch(&[sample(1, 0, 100, 50)]);

        let award = dedup.process_batch(&[sample(2, 40, 100, 80), sample(3, 0, 90, 80)]);
        assert_eq!(award.steps, 0);
        assert_eq!(award.superseded, 2);
    }

    #[test]
    fn test_extension_of_known_sample_awarded() {
        let mut dedup = MotionDeduplicator::default();
        dedup.process_batch(&[sample(1, 0, 60, 10)]);

        let award = dedup.process_batch(&[sample(1, 0, 120, 20)]);
        assert_eq!(award.steps, 12);
        assert_eq!(dedup.last_processed_end(), Some(t(120)));
    }

    #[test]
    fn test_watermark_advances_after_batch_only() {
        let mut dedup = MotionDeduplicator::default();
        dedup.process_batch(&[sample(1, 0, 10, 10)]);

        // Late sample (end 50) listed after an early one (end 200): both count
        // because the watermark is still 10 while the batch is decided.
        let award = dedup.process_batch(&[sample(2, 100, 200, 10), sample(3, 20, 50, 10)]);
        assert_eq!(award.accepted, 2);
        assert_eq!(dedup.last_processed_end(), Some(t(200)));
    }

    #[test]
    fn test_malformed_samples_rejected() {
        let mut dedup = MotionDeduplicator::default();
        let award = dedup.process_batch(&[sample(1, 50, 10, 100), sample(2, 0, 10, -5)]);
        assert_eq!(award.steps, 0);
        assert_eq!(award.rejected, 2);
        assert_eq!(dedup.last_processed_end(), None);
    }

    #[test]
    fn test_stage_does_not_mutate() {
        let dedup = MotionDeduplicator::default();
        let staged = dedup.stage(&[sample(1, 0, 60, 100)]);
        assert_eq!(staged.award.steps, 60);
        assert_eq!(dedup.state(), &MotionDedupState::default());
    }

    #[test]
    fn test_progress_pruned_behind_watermark() {
        let mut dedup = MotionDeduplicator::default();
        dedup.process_batch(&[sample(1, 0, 10, 10), sample(2, 0, 20, 10)]);
        dedup.process_batch(&[sample(3, 20, 30, 10)]);

        let progress = &dedup.state().sample_progress;
        assert!(!progress.contains_key(&Uuid::from_u128(1)));
        assert!(!progress.contains_key(&Uuid::from_u128(2)));
        assert!(progress.contains_key(&Uuid::from_u128(3)));
    }

    #[test]
    fn test_restart_from_persisted_state() {
        let mut dedup = MotionDeduplicator::default();
        let batch = vec![sample(1, 0, 60, 100), sample(2, 60, 120, 50)];
        dedup.process_batch(&batch);

        let json = serde_json::to_string(dedup.state()).unwrap();
        let restored: MotionDedupState = serde_json::from_str(&json).unwrap();
        let mut reborn = MotionDeduplicator::with_state(restored, DEFAULT_STEP_CORRECTION);

        assert_eq!(reborn.process_batch(&batch).steps, 0);
    }

    #[test]
    fn test_batch_order_does_not_change_award() {
        let batch: Vec<MotionSample> = (0..20)
            .map(|i| {
                let start = i * 30;
                sample(i as u128 + 1, start, start + 30 + (i % 3) * 5, 7 + i)
            })
            .collect();

        let expected = MotionDeduplicator::default().stage(&batch).award.steps;
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for _ in 0..10 {
            let mut shuffled = batch.clone();
            shuffled.shuffle(&mut rng);
            let award = MotionDeduplicator::default().stage(&shuffled).award;
            assert_eq!(award.steps, expected);
            assert_eq!(award.accepted, batch.len());
        }
    }
}
