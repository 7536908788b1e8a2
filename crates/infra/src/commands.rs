//! Application commands.
//!
//! The HTTP layer (not part of this workspace) calls these. Each command is
//! one [`UnitOfWork`]: the mutation and the outbox row for its follow-up job
//! commit together, and the job is enqueued only after the commit.
//!
//! ```text
//! register_user             insert user                 ─▶ send-verify-email
//! subscribe                 check course, no dup        ─▶ create-subscription
//! complete_lesson           check subscription, insert  ─▶ create-lesson-completion
//! create_material           owner check, insert         ─▶ create-material-notification
//! request_course_deletion   check course                ─▶ delete-course
//! confirm_deletion_request  check request               ─▶ update-request
//! recompute_progress        check subscription          ─▶ update-course-progress
//! request_password_reset    check email                 ─▶ reset-password
//! ```
//!
//! Unique violations surface as [`CommandError::Conflict`] and nothing is
//! queued.

use tracing::info;

use eduapp_auth::{Credential, CredentialError, validate_credential};
use eduapp_core::{
    Course, CourseId, CourseProgress, DeletionRequest, DomainError, LessonCompletion, Material,
    MaterialId, NewLessonCompletion, NewMaterial, NewUser, Progress, RequestId, User, UserId,
};

use crate::jobs::DispatchError;
use crate::jobs::payload::{
    CreateLessonCompletion, CreateMaterialNotification, CreateSubscription, DeleteCourse,
    ResetPassword, SendVerifyEmail, UpdateCourseProgress, UpdateRequest,
};
use crate::store::StoreError;
use crate::unit_of_work::{AtomicOutcome, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Unique constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("dispatch error: {0}")]
    Dispatch(DispatchError),
}

impl From<StoreError> for CommandError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::UniqueViolation(msg) => CommandError::Conflict(msg),
            StoreError::NotFound(msg) => CommandError::NotFound(msg),
            other => CommandError::Store(other),
        }
    }
}

impl From<DispatchError> for CommandError {
    fn from(value: DispatchError) -> Self {
        CommandError::Dispatch(value)
    }
}

impl From<CredentialError> for CommandError {
    fn from(value: CredentialError) -> Self {
        CommandError::Unauthorized(value.to_string())
    }
}

impl From<DomainError> for CommandError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::InvariantViolation(msg) => CommandError::Validation(msg),
            DomainError::NotFound(msg) => CommandError::NotFound(msg),
            DomainError::Conflict(msg) => CommandError::Conflict(msg),
            DomainError::Unauthorized(msg) => CommandError::Unauthorized(msg),
        }
    }
}

pub type CommandResult<T> = Result<AtomicOutcome<T>, CommandError>;

#[derive(Debug, Clone)]
pub struct Commands {
    uow: UnitOfWork,
}

impl Commands {
    pub fn new(uow: UnitOfWork) -> Self {
        Self { uow }
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    pub fn register_user(&self, user: NewUser) -> CommandResult<User> {
        if user.user_name.trim().is_empty() {
            return Err(DomainError::validation("user name is required").into());
        }
        if !user.email.contains('@') {
            return Err(DomainError::validation(format!("invalid email: {}", user.email)).into());
        }

        let dispatcher = self.uow.dispatcher();
        let outcome = self.uow.execute_with_job(
            |q| Ok::<_, CommandError>(q.create_user(user)?),
            |user: &User| {
                dispatcher.prepare(&SendVerifyEmail {
                    user_name: user.user_name.clone(),
                })
            },
        )?;
        info!(user_id = %outcome.value.id, "user registered");
        Ok(outcome)
    }

    pub fn subscribe(&self, credential: &Credential, course_id: CourseId) -> CommandResult<Course> {
        validate_credential(credential)?;
        let user_id = credential.user_id;

        let dispatcher = self.uow.dispatcher();
        self.uow.execute_with_job(
            |q| {
                let course = q
                    .get_course(course_id)?
                    .ok_or_else(|| CommandError::NotFound(format!("course {course_id}")))?;
                if q.get_subscription(user_id, course_id)?.is_some() {
                    return Err(CommandError::Conflict(format!(
                        "user {user_id} is already subscribed to course {course_id}"
                    )));
                }
                Ok(course)
            },
            |_| dispatcher.prepare(&CreateSubscription { user_id, course_id }),
        )
    }

    pub fn complete_lesson(
        &self,
        credential: &Credential,
        course_id: CourseId,
        material_id: MaterialId,
    ) -> CommandResult<LessonCompletion> {
        validate_credential(credential)?;
        let user_id = credential.user_id;

        let dispatcher = self.uow.dispatcher();
        self.uow.execute_with_job(
            |q| {
                match q.get_material(material_id)? {
                    Some(m) if m.course_id == course_id => {}
                    _ => {
                        return Err(CommandError::NotFound(format!(
                            "material {material_id} in course {course_id}"
                        )));
                    }
                }
                if q.get_subscription(user_id, course_id)?.is_none() {
                    return Err(CommandError::NotFound(format!(
                        "subscription of user {user_id} to course {course_id}"
                    )));
                }
                Ok(q.create_lesson_completion(NewLessonCompletion {
                    user_id,
                    course_id,
                    material_id,
                })?)
            },
            |_| {
                dispatcher.prepare(&CreateLessonCompletion {
                    user_id,
                    course_id,
                    material_id,
                })
            },
        )
    }

    pub fn create_material(
        &self,
        credential: &Credential,
        material: NewMaterial,
    ) -> CommandResult<Material> {
        validate_credential(credential)?;
        let course_id = material.course_id;

        let dispatcher = self.uow.dispatcher();
        self.uow.execute_with_job(
            |q| {
                let course = q
                    .get_course(course_id)?
                    .ok_or_else(|| CommandError::NotFound(format!("course {course_id}")))?;
                if !course.is_owned_by(credential.user_id) {
                    return Err(CommandError::Unauthorized(format!(
                        "user {} does not own course {course_id}",
                        credential.user_id
                    )));
                }
                Ok(q.create_material(material)?)
            },
            |m: &Material| {
                dispatcher.prepare(&CreateMaterialNotification {
                    material_id: m.id,
                    credential: credential.clone(),
                    title: m.title.clone(),
                    file_url: m.file_url.clone(),
                    order_number: m.order_number,
                })
            },
        )
    }

    pub fn request_course_deletion(
        &self,
        credential: &Credential,
        course_id: CourseId,
    ) -> CommandResult<Course> {
        validate_credential(credential)?;

        let dispatcher = self.uow.dispatcher();
        self.uow.execute_with_job(
            |q| {
                q.get_course(course_id)?
                    .ok_or_else(|| CommandError::NotFound(format!("course {course_id}")))
            },
            |_| {
                dispatcher.prepare(&DeleteCourse {
                    course_id,
                    credential: credential.clone(),
                })
            },
        )
    }

    pub fn confirm_deletion_request(
        &self,
        credential: &Credential,
        request_id: RequestId,
    ) -> CommandResult<DeletionRequest> {
        validate_credential(credential)?;

        let dispatcher = self.uow.dispatcher();
        self.uow.execute_with_job(
            |q| {
                q.get_deletion_request(request_id)?
                    .ok_or_else(|| CommandError::NotFound(format!("deletion request {request_id}")))
            },
            |_| {
                dispatcher.prepare(&UpdateRequest {
                    request_id,
                    credential: credential.clone(),
                })
            },
        )
    }

    /// Queue a recompute; the value is the progress stored at call time.
    pub fn recompute_progress(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> CommandResult<CourseProgress> {
        let dispatcher = self.uow.dispatcher();
        self.uow.execute_with_job(
            |q| -> Result<CourseProgress, CommandError> {
                if q.get_subscription(user_id, course_id)?.is_none() {
                    return Err(CommandError::NotFound(format!(
                        "subscription of user {user_id} to course {course_id}"
                    )));
                }
                Ok(q.get_course_progress(user_id, course_id)?
                    .unwrap_or(CourseProgress {
                        user_id,
                        course_id,
                        progress: Progress::ZERO,
                    }))
            },
            |current: &CourseProgress| {
                dispatcher.prepare(&UpdateCourseProgress {
                    user_id,
                    course_id,
                    progress: current.progress,
                })
            },
        )
    }

    pub fn request_password_reset(&self, email: &str) -> CommandResult<User> {
        let dispatcher = self.uow.dispatcher();
        self.uow.execute_with_job(
            |q| {
                q.get_user_by_email(email)?
                    .ok_or_else(|| CommandError::NotFound(format!("no user with email {email}")))
            },
            |_| {
                dispatcher.prepare(&ResetPassword {
                    email: email.to_string(),
                })
            },
        )
    }
}
