//! Participant state machine.
//!
//! Every status/step mutation in the system goes through these guard+apply
//! functions; a transition not encoded here is an error. The callable
//! operations, Scheduler, TimeoutSweeper and refresh handler are the only
//! callers.

use crate::error::CoordinatorError;
use crate::types::{ContributionStep, Participant, ParticipantStatus, Timestamp};

fn precondition(p: &Participant, wanted: &str) -> CoordinatorError {
    CoordinatorError::FailedPrecondition(format!(
        "participant {} is {} (step {}), expected {}",
        p.user_id, p.status, p.contribution_step, wanted
    ))
}

/// WAITING(progress 0) | CONTRIBUTED(step COMPLETED) → READY, progress+1.
pub fn advance_to_next_circuit(p: &mut Participant) -> Result<(), CoordinatorError> {
    let eligible = (p.status == ParticipantStatus::Waiting && p.contribution_progress == 0)
        || (p.status == ParticipantStatus::Contributed
            && p.contribution_step == ContributionStep::Completed);
    if !eligible {
        return Err(precondition(p, "WAITING/0 or CONTRIBUTED/COMPLETED"));
    }
    p.status = ParticipantStatus::Ready;
    p.contribution_progress += 1;
    Ok(())
}

/// Advance the contribution step by exactly one. Entering VERIFYING stamps
/// `verification_started_at`.
pub fn advance_step(
    p: &mut Participant,
    now: Timestamp,
) -> Result<ContributionStep, CoordinatorError> {
    if p.status != ParticipantStatus::Contributing {
        return Err(precondition(p, "CONTRIBUTING"));
    }
    let next = p
        .contribution_step
        .next()
        .ok_or_else(|| precondition(p, "a step before COMPLETED"))?;
    if next == ContributionStep::Verifying {
        p.verification_started_at = now;
    }
    p.contribution_step = next;
    Ok(next)
}

/// Scheduler promotion: the participant takes the current-contributor slot.
pub fn promote(p: &mut Participant, now: Timestamp) -> Result<(), CoordinatorError> {
    match p.status {
        ParticipantStatus::Ready | ParticipantStatus::Waiting => {
            p.status = ParticipantStatus::Contributing;
            p.contribution_step = ContributionStep::Downloading;
            p.contribution_started_at = now;
            p.verification_started_at = 0;
            Ok(())
        }
        _ => Err(precondition(p, "READY or WAITING")),
    }
}

/// Scheduler queuing: READY → WAITING behind the current contributor.
pub fn queue_behind(p: &mut Participant) -> Result<(), CoordinatorError> {
    if p.status != ParticipantStatus::Ready {
        return Err(precondition(p, "READY"));
    }
    p.status = ParticipantStatus::Waiting;
    Ok(())
}

/// TimeoutSweeper eviction: any CONTRIBUTING step → TIMEDOUT.
pub fn mark_timed_out(p: &mut Participant) -> Result<(), CoordinatorError> {
    if p.status != ParticipantStatus::Contributing {
        return Err(precondition(p, "CONTRIBUTING"));
    }
    p.status = ParticipantStatus::Timedout;
    Ok(())
}

/// Admission of a TIMEDOUT participant whose penalties all expired.
pub fn exhume(p: &mut Participant) -> Result<(), CoordinatorError> {
    if p.status != ParticipantStatus::Timedout {
        return Err(precondition(p, "TIMEDOUT"));
    }
    p.status = ParticipantStatus::Exhumed;
    p.contribution_step = ContributionStep::Downloading;
    Ok(())
}

/// EXHUMED → READY with unchanged progress; the Scheduler re-enrolls.
pub fn resume_from_exhumed(p: &mut Participant) -> Result<(), CoordinatorError> {
    if p.status != ParticipantStatus::Exhumed {
        return Err(precondition(p, "EXHUMED"));
    }
    p.status = ParticipantStatus::Ready;
    Ok(())
}

/// Refresh-handler completion after a contribution document lands:
/// CONTRIBUTING → CONTRIBUTED, or DONE on the ceremony's last circuit.
pub fn complete_contribution(
    p: &mut Participant,
    circuit_count: u32,
) -> Result<(), CoordinatorError> {
    if p.status != ParticipantStatus::Contributing {
        return Err(precondition(p, "CONTRIBUTING"));
    }
    p.status = if p.contribution_progress + 1 > circuit_count {
        ParticipantStatus::Done
    } else {
        ParticipantStatus::Contributed
    };
    p.contribution_step = ContributionStep::Completed;
    p.temp_contribution_data = None;
    Ok(())
}

/// Coordinator-only: DONE → FINALIZING once the ceremony closed.
pub fn prepare_finalization(p: &mut Participant) -> Result<(), CoordinatorError> {
    if p.status != ParticipantStatus::Done {
        return Err(precondition(p, "DONE"));
    }
    p.status = ParticipantStatus::Finalizing;
    Ok(())
}

/// FINALIZING → FINALIZED at ceremony finalization.
pub fn finalize(p: &mut Participant) -> Result<(), CoordinatorError> {
    if p.status != ParticipantStatus::Finalizing {
        return Err(precondition(p, "FINALIZING"));
    }
    p.status = ParticipantStatus::Finalized;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Participant {
        Participant::admitted("alice", "c1")
    }

    #[test]
    fn step_chain_advances_one_at_a_time() {
        let mut p = fresh();
        p.status = ParticipantStatus::Contributing;

        assert_eq!(advance_step(&mut p, 10).unwrap(), ContributionStep::Computing);
        assert_eq!(advance_step(&mut p, 20).unwrap(), ContributionStep::Uploading);
        assert_eq!(p.verification_started_at, 0);
        assert_eq!(advance_step(&mut p, 30).unwrap(), ContributionStep::Verifying);
        assert_eq!(p.verification_started_at, 30);
        assert_eq!(advance_step(&mut p, 40).unwrap(), ContributionStep::Completed);

        // The chain is exhausted: one more advance is a guard violation.
        let err = advance_step(&mut p, 50).unwrap_err();
        assert!(matches!(err, CoordinatorError::FailedPrecondition(_)));
    }

    #[test]
    fn advance_step_requires_contributing() {
        let mut p = fresh();
        assert!(advance_step(&mut p, 0).is_err());
    }

    #[test]
    fn advance_circuit_from_waiting_zero() {
        let mut p = fresh();
        advance_to_next_circuit(&mut p).unwrap();
        assert_eq!(p.status, ParticipantStatus::Ready);
        assert_eq!(p.contribution_progress, 1);

        // READY is not eligible again.
        assert!(advance_to_next_circuit(&mut p).is_err());
    }

    #[test]
    fn advance_circuit_from_contributed_completed() {
        let mut p = fresh();
        p.status = ParticipantStatus::Contributed;
        p.contribution_step = ContributionStep::Completed;
        p.contribution_progress = 1;
        advance_to_next_circuit(&mut p).unwrap();
        assert_eq!(p.status, ParticipantStatus::Ready);
        assert_eq!(p.contribution_progress, 2);
    }

    #[test]
    fn waiting_with_progress_is_not_eligible() {
        let mut p = fresh();
        p.contribution_progress = 1;
        assert!(advance_to_next_circuit(&mut p).is_err());
    }

    #[test]
    fn promotion_resets_the_step_machine() {
        let mut p = fresh();
        p.status = ParticipantStatus::Ready;
        p.verification_started_at = 99;
        promote(&mut p, 1_234).unwrap();
        assert_eq!(p.status, ParticipantStatus::Contributing);
        assert_eq!(p.contribution_step, ContributionStep::Downloading);
        assert_eq!(p.contribution_started_at, 1_234);
        assert_eq!(p.verification_started_at, 0);
    }

    #[test]
    fn timeout_exhume_resume_round_trip() {
        let mut p = fresh();
        p.status = ParticipantStatus::Contributing;
        p.contribution_step = ContributionStep::Computing;
        p.contribution_progress = 1;

        mark_timed_out(&mut p).unwrap();
        assert_eq!(p.status, ParticipantStatus::Timedout);

        exhume(&mut p).unwrap();
        assert_eq!(p.status, ParticipantStatus::Exhumed);
        assert_eq!(p.contribution_step, ContributionStep::Downloading);

        resume_from_exhumed(&mut p).unwrap();
        assert_eq!(p.status, ParticipantStatus::Ready);
        assert_eq!(p.contribution_progress, 1);
    }

    #[test]
    fn resume_requires_exhumed() {
        let mut p = fresh();
        assert!(resume_from_exhumed(&mut p).is_err());
    }

    #[test]
    fn completion_picks_done_on_last_circuit() {
        let mut p = fresh();
        p.status = ParticipantStatus::Contributing;
        p.contribution_step = ContributionStep::Verifying;
        p.contribution_progress = 1;
        p.temp_contribution_data = Some(Default::default());

        complete_contribution(&mut p, 1).unwrap();
        assert_eq!(p.status, ParticipantStatus::Done);
        assert_eq!(p.contribution_step, ContributionStep::Completed);
        assert!(p.temp_contribution_data.is_none());

        let mut q = fresh();
        q.status = ParticipantStatus::Contributing;
        q.contribution_progress = 1;
        complete_contribution(&mut q, 3).unwrap();
        assert_eq!(q.status, ParticipantStatus::Contributed);
    }

    #[test]
    fn finalization_chain_guards() {
        let mut p = fresh();
        assert!(prepare_finalization(&mut p).is_err());
        p.status = ParticipantStatus::Done;
        prepare_finalization(&mut p).unwrap();
        assert_eq!(p.status, ParticipantStatus::Finalizing);
        finalize(&mut p).unwrap();
        assert_eq!(p.status, ParticipantStatus::Finalized);
        assert!(finalize(&mut p).is_err());
    }
}
