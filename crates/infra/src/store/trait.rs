use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use eduapp_core::{
    Course, CourseId, CourseProgress, DeletionRequest, LessonCompletion, Material, MaterialId,
    NewCourse, NewLessonCompletion, NewMaterial, NewUser, OutboxId, RequestId, Subscription, User,
    UserId, UserStatus, VerifyEmail,
};

use crate::jobs::NewJob;
use crate::outbox::OutboxMessage;

/// Store operation error.
///
/// These are **infrastructure errors**; callers decide whether a unique
/// violation means "conflict" (commands) or "already applied" (job handlers).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store could not be reached or the transaction could not start or
    /// commit (transient; retryable).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Row-level operations available inside a transaction.
///
/// Getters return `Ok(None)` for missing rows; creators fail with
/// [`StoreError::UniqueViolation`] on duplicates.
pub trait Queries {
    // users
    fn create_user(&mut self, user: NewUser) -> Result<User, StoreError>;
    fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;
    fn get_user_by_name(&self, user_name: &str) -> Result<Option<User>, StoreError>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    // courses and materials
    fn create_course(&mut self, course: NewCourse) -> Result<Course, StoreError>;
    fn get_course(&self, id: CourseId) -> Result<Option<Course>, StoreError>;
    /// Delete a course and everything that hangs off it (materials,
    /// subscriptions, completions, progress rows, deletion request).
    /// Returns `false` when the course did not exist.
    fn delete_course(&mut self, id: CourseId) -> Result<bool, StoreError>;
    fn create_material(&mut self, material: NewMaterial) -> Result<Material, StoreError>;
    fn get_material(&self, id: MaterialId) -> Result<Option<Material>, StoreError>;
    fn count_materials(&self, course_id: CourseId) -> Result<u64, StoreError>;

    // subscriptions and progress
    fn create_subscription(
        &mut self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Subscription, StoreError>;
    fn get_subscription(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<Subscription>, StoreError>;
    fn create_lesson_completion(
        &mut self,
        completion: NewLessonCompletion,
    ) -> Result<LessonCompletion, StoreError>;
    /// Completed materials of the course that still exist, counted once each.
    fn count_distinct_completed_materials(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<u64, StoreError>;
    fn create_course_progress(&mut self, progress: CourseProgress) -> Result<(), StoreError>;
    fn get_course_progress(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<CourseProgress>, StoreError>;
    fn upsert_course_progress(&mut self, progress: CourseProgress) -> Result<(), StoreError>;

    // deletion requests
    fn create_deletion_request(
        &mut self,
        course_id: CourseId,
        requested_by: UserId,
    ) -> Result<DeletionRequest, StoreError>;
    fn get_deletion_request(&self, id: RequestId) -> Result<Option<DeletionRequest>, StoreError>;
    fn get_deletion_request_for_course(
        &self,
        course_id: CourseId,
    ) -> Result<Option<DeletionRequest>, StoreError>;
    fn update_deletion_request(&mut self, request: &DeletionRequest) -> Result<(), StoreError>;
    fn delete_deletion_request(&mut self, id: RequestId) -> Result<bool, StoreError>;

    // email verification
    fn create_verify_email(
        &mut self,
        user_id: UserId,
        email: &str,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError>;
    fn get_verify_email_for_user(&self, user_id: UserId)
    -> Result<Option<VerifyEmail>, StoreError>;
    fn create_user_status(&mut self, status: UserStatus) -> Result<(), StoreError>;
    fn get_user_status(&self, user_id: UserId) -> Result<Option<UserStatus>, StoreError>;

    // outbox
    fn insert_outbox(&mut self, job: NewJob) -> Result<OutboxMessage, StoreError>;
    /// Staged messages created at or before `created_before`, oldest first.
    fn pending_outbox(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError>;
    fn delete_outbox(&mut self, id: OutboxId) -> Result<bool, StoreError>;
}

/// An open transaction. Dropping it without calling `commit` rolls back.
pub trait Transaction: Queries {
    fn queries(&mut self) -> &mut dyn Queries;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store abstraction: hands out transactions.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        (**self).begin()
    }
}

/// Atomic execution on top of [`Store::begin`].
pub trait StoreExt: Store {
    /// Run `work` inside a single transaction.
    ///
    /// Commits when `work` returns `Ok`; any error (from `work` or from the
    /// commit itself) leaves no partial writes behind. Never retries.
    fn execute_atomic<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Queries) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin()?;
        let value = work(tx.queries())?;
        tx.commit()?;
        Ok(value)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
