//! Pure transformations over a circuit's waiting queue.
//!
//! Every operation maps an old queue state to a new queue state plus the
//! participant updates the caller must apply in the same batch. Nothing here
//! touches the store; the Scheduler and TimeoutSweeper own the writes.

use crate::error::CoordinatorError;
use crate::types::WaitingQueue;

/// Participant update implied by a queue transformation. The executor stamps
/// the timestamps when applying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParticipantIntent {
    /// Becomes the current contributor: CONTRIBUTING / DOWNLOADING with a
    /// fresh `contribution_started_at`.
    Promote { user_id: String },
    /// Queued behind the current contributor: WAITING.
    Wait { user_id: String },
}

/// Result of a queue transformation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueUpdate {
    pub queue: WaitingQueue,
    pub intents: Vec<ParticipantIntent>,
}

fn precondition(msg: impl Into<String>) -> CoordinatorError {
    CoordinatorError::FailedPrecondition(msg.into())
}

/// Append a participant. An empty slot promotes them immediately; otherwise
/// they wait. Re-enrolling a queued participant is a no-op (the change feed
/// is at-least-once).
pub fn enroll(queue: &WaitingQueue, user_id: &str) -> QueueUpdate {
    if queue.contains(user_id) {
        return QueueUpdate {
            queue: queue.clone(),
            intents: Vec::new(),
        };
    }

    let mut next = queue.clone();
    next.contributors.push(user_id.to_string());

    let intents = if next.has_current() {
        vec![ParticipantIntent::Wait {
            user_id: user_id.to_string(),
        }]
    } else {
        next.current_contributor = user_id.to_string();
        vec![ParticipantIntent::Promote {
            user_id: user_id.to_string(),
        }]
    };

    QueueUpdate { queue: next, intents }
}

/// Re-promote a contributor who still holds the head slot after their
/// timeout expired. The queue itself is unchanged.
pub fn resume_after_timeout(
    queue: &WaitingQueue,
    user_id: &str,
) -> Result<QueueUpdate, CoordinatorError> {
    if queue.current_contributor != user_id {
        return Err(precondition(format!(
            "{user_id} is not the current contributor"
        )));
    }
    Ok(QueueUpdate {
        queue: queue.clone(),
        intents: vec![ParticipantIntent::Promote {
            user_id: user_id.to_string(),
        }],
    })
}

/// Pop the head after a finished contribution and promote the next waiter,
/// if any.
pub fn complete_head(queue: &WaitingQueue) -> Result<QueueUpdate, CoordinatorError> {
    if !queue.has_current() {
        return Err(precondition("queue has no current contributor"));
    }

    let mut next = queue.clone();
    next.contributors.remove(0);

    let intents = match next.contributors.first() {
        Some(head) => {
            next.current_contributor = head.clone();
            vec![ParticipantIntent::Promote {
                user_id: head.clone(),
            }]
        }
        None => {
            next.current_contributor.clear();
            Vec::new()
        }
    };

    Ok(QueueUpdate { queue: next, intents })
}

/// Evict a stalled head: pop, count the failure, promote the next waiter.
pub fn evict_head(queue: &WaitingQueue) -> Result<QueueUpdate, CoordinatorError> {
    if !queue.has_current() {
        return Err(precondition("queue has no current contributor"));
    }

    let mut update = complete_head(queue)?;
    update.queue.failed_contributions += 1;
    Ok(update)
}
