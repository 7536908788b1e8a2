//! Course deletion-request state machine (pure decisions).
//!
//! ```text
//! NoRequest ──(non-owner delete)──▶ PendingApproval ──(owner confirms)──▶ Approved ──▶ Deleted
//!     └──────────────(owner delete)───────────────────────────────────────────────────▶ Deleted
//! ```
//!
//! There is no `Denied` transition: an unconfirmed request stays pending
//! indefinitely. These functions only decide; the task handlers perform the
//! store writes and notifications.

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;
use crate::model::{Course, DeletionRequest};

/// Observable state of a course with respect to deletion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeletionState {
    NoRequest,
    PendingApproval,
    Approved,
}

impl DeletionState {
    pub fn of(request: Option<&DeletionRequest>) -> Self {
        match request {
            None => DeletionState::NoRequest,
            Some(r) if r.is_approved() => DeletionState::Approved,
            Some(_) => DeletionState::PendingApproval,
        }
    }
}

/// What a delete-course job should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteCourseDecision {
    /// Requester owns the course: remove it directly, no request row.
    DeleteDirectly,
    /// No request yet: create one (pending) and notify the owner.
    CreateRequest,
    /// A request already exists; `notify` is true when the owner was never
    /// successfully emailed about it.
    AwaitApproval { notify: bool },
    /// Already approved (the course is about to be removed); nothing to do.
    AlreadyApproved,
}

pub fn decide_delete_course(
    course: &Course,
    requester: UserId,
    existing: Option<&DeletionRequest>,
) -> DeleteCourseDecision {
    if course.is_owned_by(requester) {
        return DeleteCourseDecision::DeleteDirectly;
    }

    match (DeletionState::of(existing), existing) {
        (DeletionState::NoRequest, _) => DeleteCourseDecision::CreateRequest,
        (DeletionState::Approved, _) => DeleteCourseDecision::AlreadyApproved,
        (DeletionState::PendingApproval, Some(r)) => DeleteCourseDecision::AwaitApproval {
            notify: r.notified_at.is_none(),
        },
        (DeletionState::PendingApproval, None) => DeleteCourseDecision::CreateRequest,
    }
}

/// Validate an owner's confirmation of a deletion request.
///
/// Only the course owner may approve; the request must belong to the course.
pub fn authorize_approval(
    course: &Course,
    approver: UserId,
    request: &DeletionRequest,
) -> DomainResult<()> {
    if request.course_id != course.id {
        return Err(DomainError::invariant(format!(
            "deletion request {} does not belong to course {}",
            request.id, course.id
        )));
    }
    if !course.is_owned_by(approver) {
        return Err(DomainError::unauthorized(format!(
            "user {approver} does not own course {}",
            course.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CourseId, RequestId};
    use chrono::Utc;

    fn course(owner: i64) -> Course {
        Course {
            id: CourseId::new(1),
            owner_id: UserId::new(owner),
            title: "Rust".to_string(),
        }
    }

    fn request(confirm: bool, notified: bool) -> DeletionRequest {
        DeletionRequest {
            id: RequestId::new(9),
            course_id: CourseId::new(1),
            requested_by: UserId::new(2),
            pending: true,
            confirm,
            notified_at: notified.then(Utc::now),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn owner_deletes_directly() {
        let c = course(1);
        assert_eq!(
            decide_delete_course(&c, UserId::new(1), None),
            DeleteCourseDecision::DeleteDirectly
        );
    }

    #[test]
    fn non_owner_creates_request_once() {
        let c = course(1);
        assert_eq!(
            decide_delete_course(&c, UserId::new(2), None),
            DeleteCourseDecision::CreateRequest
        );

        let pending = request(false, true);
        assert_eq!(
            decide_delete_course(&c, UserId::new(2), Some(&pending)),
            DeleteCourseDecision::AwaitApproval { notify: false }
        );
    }

    #[test]
    fn unnotified_request_is_notified_on_retry() {
        let c = course(1);
        let pending = request(false, false);
        assert_eq!(
            decide_delete_course(&c, UserId::new(3), Some(&pending)),
            DeleteCourseDecision::AwaitApproval { notify: true }
        );
    }

    #[test]
    fn approval_keeps_pending_and_sets_confirm() {
        let mut r = request(false, true);
        assert_eq!(DeletionState::of(Some(&r)), DeletionState::PendingApproval);
        r.approve();
        assert!(r.pending && r.confirm);
        assert_eq!(DeletionState::of(Some(&r)), DeletionState::Approved);
    }

    #[test]
    fn only_owner_may_approve() {
        let c = course(1);
        let r = request(false, true);
        assert!(authorize_approval(&c, UserId::new(1), &r).is_ok());
        let err = authorize_approval(&c, UserId::new(2), &r).unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));
    }
}
