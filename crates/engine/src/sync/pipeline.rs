//! Cache-then-feedback step every claim update goes through

use crate::feedback::FeedbackManager;
use claimsync_core::{CachedClaim, ClaimId, ClaimRow, ClaimStatus, ClaimUpdate};
use claimsync_persistence::{ApplyOutcome, StateCache};
use std::sync::Arc;
use tracing::debug;

const NO_REASON: &str = "No reason provided";

/// Applies updates to the cache and derives user feedback from real transitions
#[derive(Clone)]
pub struct UpdatePipeline {
    cache: Arc<StateCache>,
    feedback: FeedbackManager,
}

impl UpdatePipeline {
    pub fn new(cache: Arc<StateCache>, feedback: FeedbackManager) -> Self {
        Self { cache, feedback }
    }

    /// Apply `update`; feedback fires only when the status actually moved
    pub fn process(&self, update: &ClaimUpdate) -> ApplyOutcome {
        let outcome = self.cache.apply_update(update);
        self.react(
            outcome,
            &update.claim_id,
            update.status,
            update.rejection_reason.as_deref(),
        );
        outcome
    }

    /// Apply a full row; a claim missing from the cache is inserted
    ///
    /// An inserted claim that is already redeemed or rejected counts as a
    /// transition, since the user has not seen that outcome yet.
    pub fn process_row(&self, row: &ClaimRow) -> ApplyOutcome {
        let outcome = self.cache.apply_row(CachedClaim::from(row.clone()));
        self.react(outcome, &row.id, row.status, row.rejection_reason.as_deref());
        outcome
    }

    fn react(
        &self,
        outcome: ApplyOutcome,
        claim_id: &ClaimId,
        status: ClaimStatus,
        rejection_reason: Option<&str>,
    ) {
        let moved = match outcome {
            ApplyOutcome::Applied { previous } => previous != status,
            ApplyOutcome::Inserted => true,
            other => {
                debug!("Update for claim {} not applied: {:?}", claim_id, other);
                false
            }
        };
        if !moved {
            return;
        }
        match status {
            ClaimStatus::Redeemed => self.feedback.show_accepted_feedback(claim_id),
            ClaimStatus::Rejected => self
                .feedback
                .show_rejected_feedback(claim_id, rejection_reason.unwrap_or(NO_REASON)),
            ClaimStatus::Pending | ClaimStatus::Expired => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{claim_row, RecordingSink};
    use claimsync_core::FeedbackConfig;

    fn setup() -> (Arc<StateCache>, Arc<RecordingSink>, UpdatePipeline) {
        let cache = Arc::new(StateCache::new());
        let sink = Arc::new(RecordingSink::new());
        let feedback = FeedbackManager::new(sink.clone(), FeedbackConfig::default());
        (cache.clone(), sink, UpdatePipeline::new(cache, feedback))
    }

    #[test]
    fn test_accept_flow() {
        let (cache, sink, pipeline) = setup();
        cache.merge_claim(CachedClaim::from(claim_row("c1", ClaimStatus::Pending, 0)));

        let update = claim_row("c1", ClaimStatus::Redeemed, 10).to_update();
        assert!(pipeline.process(&update).is_applied());
        assert_eq!(pipeline.process(&update), ApplyOutcome::Duplicate);

        let c1 = ClaimId::new("c1").unwrap();
        assert_eq!(cache.get_claim(&c1).unwrap().status, ClaimStatus::Redeemed);
        assert_eq!(sink.acceptances(), vec![c1]);
        assert!(!sink.banner_shown());
    }

    #[test]
    fn test_rejection_flow() {
        let (cache, sink, pipeline) = setup();
        cache.merge_claim(CachedClaim::from(claim_row("c2", ClaimStatus::Pending, 0)));

        let mut row = claim_row("c2", ClaimStatus::Rejected, 10);
        row.rejection_reason = Some("Expired".into());
        pipeline.process(&row.to_update());
        pipeline.process(&row.to_update());

        assert_eq!(
            sink.rejections(),
            vec![(ClaimId::new("c2").unwrap(), "Expired".to_string())]
        );
    }

    #[test]
    fn test_rejection_without_reason() {
        let (cache, sink, pipeline) = setup();
        cache.merge_claim(CachedClaim::from(claim_row("c3", ClaimStatus::Pending, 0)));
        pipeline.process(&claim_row("c3", ClaimStatus::Rejected, 10).to_update());
        assert_eq!(sink.rejections()[0].1, NO_REASON);
    }

    #[test]
    fn test_reason_only_change_is_silent() {
        let (cache, sink, pipeline) = setup();
        cache.merge_claim(CachedClaim::from(claim_row("c4", ClaimStatus::Rejected, 0)));

        let mut row = claim_row("c4", ClaimStatus::Rejected, 10);
        row.rejection_reason = Some("Venue closed".into());
        assert!(pipeline.process(&row.to_update()).is_applied());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_stale_and_unknown_fire_nothing() {
        let (cache, sink, pipeline) = setup();
        cache.merge_claim(CachedClaim::from(claim_row("c5", ClaimStatus::Pending, 50)));

        let stale = claim_row("c5", ClaimStatus::Redeemed, 10).to_update();
        assert_eq!(pipeline.process(&stale), ApplyOutcome::Stale);
        let unknown = claim_row("ghost", ClaimStatus::Redeemed, 10).to_update();
        assert_eq!(pipeline.process(&unknown), ApplyOutcome::Unknown);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_row_for_uncached_claim_is_materialized() {
        let (cache, sink, pipeline) = setup();
        let c1 = ClaimId::new("c1").unwrap();

        let row = claim_row("c1", ClaimStatus::Redeemed, 10);
        assert_eq!(pipeline.process_row(&row), ApplyOutcome::Inserted);
        assert_eq!(pipeline.process_row(&row), ApplyOutcome::Duplicate);

        assert_eq!(cache.get_claim(&c1).unwrap().status, ClaimStatus::Redeemed);
        assert_eq!(sink.acceptances(), vec![c1]);
    }

    #[test]
    fn test_row_for_pending_claim_is_silent_until_it_moves() {
        let (cache, sink, pipeline) = setup();
        pipeline.process_row(&claim_row("c2", ClaimStatus::Pending, 0));
        assert!(cache.get_claim(&ClaimId::new("c2").unwrap()).is_some());
        assert!(sink.events().is_empty());

        let mut row = claim_row("c2", ClaimStatus::Rejected, 10);
        row.rejection_reason = Some("Sold out".into());
        assert!(pipeline.process_row(&row).is_applied());
        assert_eq!(
            sink.rejections(),
            vec![(ClaimId::new("c2").unwrap(), "Sold out".to_string())]
        );
    }
}
