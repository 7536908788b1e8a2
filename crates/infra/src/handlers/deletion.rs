use chrono::Utc;
use tracing::{debug, info, warn};

use eduapp_core::{
    CourseId, DeleteCourseDecision, DeletionRequest, User, UserId, authorize_approval,
    decide_delete_course,
};

use super::{TaskHandlers, authenticate};
use crate::jobs::payload::{DeleteCourse, UpdateRequest};
use crate::jobs::{JobContext, TaskError};
use crate::notifier::Email;
use crate::store::{Queries, StoreExt};

enum DeleteStep {
    Done,
    Deleted,
    /// The notification is claimed (`notified_at` committed); send it.
    NotifyOwner {
        request: DeletionRequest,
        owner: User,
    },
    OwnerMissing {
        request: DeletionRequest,
        owner_id: UserId,
    },
}

/// Mark the request notified in the caller's transaction so that only one
/// job sends the email. A failed send releases the claim.
fn claim_notification(
    q: &mut dyn Queries,
    mut request: DeletionRequest,
    owner_id: UserId,
) -> Result<DeleteStep, TaskError> {
    let Some(owner) = q.get_user(owner_id)? else {
        return Ok(DeleteStep::OwnerMissing { request, owner_id });
    };
    request.notified_at = Some(Utc::now());
    q.update_deletion_request(&request)?;
    Ok(DeleteStep::NotifyOwner { request, owner })
}

impl TaskHandlers {
    /// Owner: remove the course. Anyone else: open (or reuse) a pending
    /// deletion request and tell the owner about it once.
    pub fn delete_course(&self, ctx: &JobContext, payload: DeleteCourse) -> Result<(), TaskError> {
        let course_id = payload.course_id;

        ctx.ensure_active()?;
        let (requester, step) = self.store.execute_atomic(|q| {
            let requester = authenticate(&*q, &payload.credential)?.id;
            let Some(course) = q.get_course(course_id)? else {
                return Ok::<_, TaskError>((requester, DeleteStep::Done));
            };
            let existing = q.get_deletion_request_for_course(course.id)?;

            let step = match decide_delete_course(&course, requester, existing.as_ref()) {
                DeleteCourseDecision::DeleteDirectly => {
                    q.delete_course(course.id)?;
                    DeleteStep::Deleted
                }
                DeleteCourseDecision::CreateRequest => {
                    match q.create_deletion_request(course.id, requester) {
                        Ok(request) => claim_notification(q, request, course.owner_id)?,
                        // another job opened it first and owns the notification
                        Err(err) if err.is_unique_violation() => DeleteStep::Done,
                        Err(err) => return Err(err.into()),
                    }
                }
                DeleteCourseDecision::AwaitApproval { notify: true } => match existing {
                    Some(request) => claim_notification(q, request, course.owner_id)?,
                    None => DeleteStep::Done,
                },
                DeleteCourseDecision::AwaitApproval { notify: false }
                | DeleteCourseDecision::AlreadyApproved => DeleteStep::Done,
            };
            Ok((requester, step))
        })?;

        match step {
            DeleteStep::Done => {
                debug!(job_id = %ctx.job_id, course_id = %course_id, "nothing to do for delete-course");
                Ok(())
            }
            DeleteStep::Deleted => {
                info!(job_id = %ctx.job_id, course_id = %course_id, user_id = %requester, "course deleted by owner");
                Ok(())
            }
            DeleteStep::OwnerMissing { request, owner_id } => Err(TaskError::dependency(format!(
                "owner {owner_id} of course {} (request {})",
                request.course_id, request.id
            ))),
            DeleteStep::NotifyOwner { request, owner } => {
                info!(job_id = %ctx.job_id, course_id = %course_id, request_id = %request.id, "deletion request pending");
                self.notify_owner(ctx, &request, &owner)
            }
        }
    }

    /// Failures here leave the request pending and unclaimed; the job is
    /// retried.
    fn notify_owner(
        &self,
        ctx: &JobContext,
        request: &DeletionRequest,
        owner: &User,
    ) -> Result<(), TaskError> {
        let body = "Hello,<br/>\
                    You have a request to delete the course created by you.<br/>\
                    Please check it!<br/>\
                    Thank you!";
        let Err(err) = self
            .notifier
            .send_email(&Email::new("Request to Delete Course", body, owner.email.clone()))
        else {
            return Ok(());
        };

        let released = self.store.execute_atomic(|q| {
            match q.get_deletion_request(request.id)? {
                Some(mut current) if current.notified_at == request.notified_at => {
                    current.notified_at = None;
                    q.update_deletion_request(&current)?;
                    Ok::<_, TaskError>(true)
                }
                _ => Ok(false),
            }
        });
        match released {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %ctx.job_id, request_id = %request.id, "notification claim already gone");
            }
            Err(release_err) => {
                warn!(job_id = %ctx.job_id, request_id = %request.id, error = %release_err, "could not release notification claim");
            }
        }
        Err(err.into())
    }

    /// Owner confirmation: approve the request and remove the course in one
    /// transaction.
    pub fn update_request(&self, ctx: &JobContext, payload: UpdateRequest) -> Result<(), TaskError> {
        let request_id = payload.request_id;

        ctx.ensure_active()?;
        let (approver, deleted): (UserId, Option<CourseId>) = self.store.execute_atomic(|q| {
            let approver = authenticate(&*q, &payload.credential)?.id;
            let Some(mut request) = q.get_deletion_request(request_id)? else {
                return Ok::<_, TaskError>((approver, None));
            };
            let Some(course) = q.get_course(request.course_id)? else {
                return Ok((approver, None));
            };
            authorize_approval(&course, approver, &request)?;

            request.approve();
            q.update_deletion_request(&request)?;
            q.delete_course(course.id)?;
            Ok((approver, Some(course.id)))
        })?;

        match deleted {
            Some(course_id) => info!(
                job_id = %ctx.job_id,
                request_id = %request_id,
                course_id = %course_id,
                user_id = %approver,
                "deletion request approved, course deleted"
            ),
            None => debug!(job_id = %ctx.job_id, request_id = %request_id, "deletion request already resolved"),
        }
        Ok(())
    }
}
