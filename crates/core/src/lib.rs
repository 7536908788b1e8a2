//! `eduapp-core`: domain foundation for the education platform backend.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, the persisted row shapes, the progress
//! computation and the course-deletion-request decisions.

pub mod deletion;
pub mod error;
pub mod id;
pub mod model;
pub mod progress;

pub use deletion::{DeleteCourseDecision, DeletionState, authorize_approval, decide_delete_course};
pub use error::{DomainError, DomainResult};
pub use id::{
    CompletionId, CourseId, MaterialId, OutboxId, RequestId, SubscriptionId, UserId,
    VerifyEmailId,
};
pub use model::{
    Course, CourseProgress, DeletionRequest, LessonCompletion, Material, NewCourse,
    NewLessonCompletion, NewMaterial, NewUser, Subscription, User, UserStatus, VerifyEmail,
};
pub use progress::{Progress, compute_progress};
