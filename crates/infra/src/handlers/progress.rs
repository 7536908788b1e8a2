use tracing::{debug, info};

use eduapp_core::{
    CourseId, CourseProgress, NewLessonCompletion, Progress, UserId, compute_progress,
};

use super::TaskHandlers;
use crate::jobs::payload::{CreateLessonCompletion, CreateSubscription, UpdateCourseProgress};
use crate::jobs::{JobContext, TaskError};
use crate::store::{Store, StoreError, StoreExt};

/// Recompute and store a user's progress in a course.
///
/// Counts and upsert run in one transaction. A course with no materials is an
/// invariant violation and nothing is written.
pub fn recompute_progress(
    store: &dyn Store,
    user_id: UserId,
    course_id: CourseId,
) -> Result<Progress, TaskError> {
    store.execute_atomic(|q| {
        let total = q.count_materials(course_id)?;
        let completed = q.count_distinct_completed_materials(user_id, course_id)?;
        let progress = compute_progress(completed, total)?;
        q.upsert_course_progress(CourseProgress {
            user_id,
            course_id,
            progress,
        })?;
        Ok(progress)
    })
}

impl TaskHandlers {
    pub fn create_subscription(
        &self,
        ctx: &JobContext,
        payload: CreateSubscription,
    ) -> Result<(), TaskError> {
        ctx.ensure_active()?;
        let CreateSubscription { user_id, course_id } = payload;

        let created = self.store.execute_atomic(|q| {
            if q.get_subscription(user_id, course_id)?.is_some() {
                return Ok::<_, StoreError>(false);
            }
            q.create_subscription(user_id, course_id)?;
            // a recompute may already have written the row; keep its value
            if q.get_course_progress(user_id, course_id)?.is_none() {
                q.create_course_progress(CourseProgress {
                    user_id,
                    course_id,
                    progress: Progress::ZERO,
                })?;
            }
            Ok(true)
        });

        match created {
            Ok(true) => {
                info!(job_id = %ctx.job_id, user_id = %user_id, course_id = %course_id, "subscription created");
                Ok(())
            }
            Ok(false) => {
                debug!(job_id = %ctx.job_id, user_id = %user_id, course_id = %course_id, "subscription already exists");
                Ok(())
            }
            // a concurrent job committed the same subscription first
            Err(err) if err.is_unique_violation() => {
                debug!(job_id = %ctx.job_id, user_id = %user_id, course_id = %course_id, "subscription created concurrently");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn create_lesson_completion(
        &self,
        ctx: &JobContext,
        payload: CreateLessonCompletion,
    ) -> Result<(), TaskError> {
        ctx.ensure_active()?;
        let CreateLessonCompletion {
            user_id,
            course_id,
            material_id,
        } = payload;

        let inserted = self.store.execute_atomic(|q| {
            q.create_lesson_completion(NewLessonCompletion {
                user_id,
                course_id,
                material_id,
            })
        });
        match inserted {
            Ok(_) => {}
            Err(err) if err.is_unique_violation() => {}
            Err(err) => return Err(err.into()),
        }

        let progress = recompute_progress(self.store.as_ref(), user_id, course_id)?;
        info!(
            job_id = %ctx.job_id,
            user_id = %user_id,
            course_id = %course_id,
            material_id = %material_id,
            progress = %progress,
            "course progress updated"
        );
        Ok(())
    }

    /// The payload's progress value is ignored; progress is always derived.
    pub fn update_course_progress(
        &self,
        ctx: &JobContext,
        payload: UpdateCourseProgress,
    ) -> Result<(), TaskError> {
        ctx.ensure_active()?;
        let progress = recompute_progress(self.store.as_ref(), payload.user_id, payload.course_id)?;
        info!(
            job_id = %ctx.job_id,
            user_id = %payload.user_id,
            course_id = %payload.course_id,
            progress = %progress,
            "course progress updated"
        );
        Ok(())
    }
}
