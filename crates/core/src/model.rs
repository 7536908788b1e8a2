//! Persisted row shapes.
//!
//! These are plain data carriers. Uniqueness rules (user name, email,
//! `(user, course)` subscriptions, `(user, course, material)` completions,
//! one deletion request per course) are enforced by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{
    CompletionId, CourseId, MaterialId, RequestId, SubscriptionId, UserId, VerifyEmailId,
};
use crate::progress::Progress;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub user_name: String,
    pub first_name: String,
    pub email: String,
    /// Raw role name as stored (`admin`, `student`, ...).
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub user_name: String,
    pub first_name: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub owner_id: UserId,
    pub title: String,
}

impl Course {
    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner_id == user
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCourse {
    pub owner_id: UserId,
    pub title: String,
}

/// A lesson belonging to a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub id: MaterialId,
    pub course_id: CourseId,
    pub title: String,
    pub file_url: String,
    pub order_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMaterial {
    pub course_id: CourseId,
    pub title: String,
    pub file_url: String,
    pub order_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub course_id: CourseId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonCompletion {
    pub id: CompletionId,
    pub user_id: UserId,
    pub course_id: CourseId,
    pub material_id: MaterialId,
    pub completed: bool,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLessonCompletion {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub material_id: MaterialId,
}

/// Derived row: always a full recomputation, never an increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseProgress {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub progress: Progress,
}

/// Request by a non-owner to delete a course, awaiting owner approval.
///
/// `pending` and `confirm` are both kept literally: approval sets
/// `confirm = true` while `pending` stays `true`, and the course (with this
/// row) is removed in the same handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub id: RequestId,
    pub course_id: CourseId,
    pub requested_by: UserId,
    pub pending: bool,
    pub confirm: bool,
    /// Set once the owner has been emailed, so replays don't notify twice.
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeletionRequest {
    pub fn is_approved(&self) -> bool {
        self.confirm
    }

    /// Record the owner's confirmation.
    pub fn approve(&mut self) {
        self.confirm = true;
        self.pending = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmail {
    pub id: VerifyEmailId,
    pub user_id: UserId,
    pub email: String,
    pub secret_code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    pub user_id: UserId,
    pub active: bool,
    pub pending: bool,
}

impl UserStatus {
    /// Status of a freshly registered user awaiting email verification.
    pub fn awaiting_verification(user_id: UserId) -> Self {
        Self {
            user_id,
            active: false,
            pending: true,
        }
    }
}
