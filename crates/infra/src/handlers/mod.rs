//! Task handlers: one method per [`TaskType`](crate::jobs::TaskType).
//!
//! Every handler is safe to run more than once for the same job. Writes go
//! through store transactions; emails are sent only after the data they
//! describe has committed, so a notification failure retries the job
//! without undoing anything.

use std::sync::Arc;

use eduapp_auth::{Credential, validate_credential};
use eduapp_core::User;

use crate::jobs::{HandlerRegistry, TaskError};
use crate::jobs::payload::{
    CreateLessonCompletion, CreateMaterialNotification, CreateSubscription, DeleteCourse,
    ResetPassword, SendVerifyEmail, UpdateCourseProgress, UpdateRequest,
};
use crate::notifier::Notifier;
use crate::store::{Queries, Store};

mod account;
mod deletion;
mod material;
mod progress;

pub use progress::recompute_progress;

/// Links placed in outgoing emails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationLinks {
    pub verify_email_base_url: String,
    pub reset_password_url: String,
}

impl Default for NotificationLinks {
    fn default() -> Self {
        Self {
            verify_email_base_url: "http://localhost:3390".to_string(),
            reset_password_url: "http://localhost:3390/reset/password".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct TaskHandlers {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    links: NotificationLinks,
}

impl std::fmt::Debug for TaskHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandlers")
            .field("links", &self.links)
            .finish_non_exhaustive()
    }
}

impl TaskHandlers {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, links: NotificationLinks) -> Self {
        Self {
            store,
            notifier,
            links,
        }
    }

    /// Register a handler for every task type.
    pub fn register_all(self, registry: &mut HandlerRegistry) {
        let handlers = Arc::new(self);

        let h = handlers.clone();
        registry.register::<SendVerifyEmail, _>(move |ctx, p| h.send_verify_email(ctx, p));
        let h = handlers.clone();
        registry.register::<CreateSubscription, _>(move |ctx, p| h.create_subscription(ctx, p));
        let h = handlers.clone();
        registry.register::<CreateLessonCompletion, _>(move |ctx, p| {
            h.create_lesson_completion(ctx, p)
        });
        let h = handlers.clone();
        registry.register::<CreateMaterialNotification, _>(move |ctx, p| {
            h.create_material_notification(ctx, p)
        });
        let h = handlers.clone();
        registry.register::<DeleteCourse, _>(move |ctx, p| h.delete_course(ctx, p));
        let h = handlers.clone();
        registry.register::<UpdateRequest, _>(move |ctx, p| h.update_request(ctx, p));
        let h = handlers.clone();
        registry.register::<UpdateCourseProgress, _>(move |ctx, p| {
            h.update_course_progress(ctx, p)
        });
        let h = handlers;
        registry.register::<ResetPassword, _>(move |ctx, p| h.reset_password(ctx, p));
    }
}

/// Resolve a payload credential to the stored user it names.
///
/// The stored user's id must equal the credential's `user_id`.
fn authenticate(q: &dyn Queries, credential: &Credential) -> Result<User, TaskError> {
    validate_credential(credential)?;
    let user = q
        .get_user_by_name(&credential.user_name)?
        .ok_or_else(|| TaskError::Unauthorized(format!("unknown user {}", credential.user_name)))?;
    credential.matches(user.id)?;
    Ok(user)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use eduapp_auth::{Credential, Role};
    use eduapp_core::{Course, Material, NewCourse, NewMaterial, NewUser, User};

    use super::{NotificationLinks, TaskHandlers};
    use crate::jobs::{JobContext, JobId, TaskType};
    use crate::notifier::RecordingNotifier;
    use crate::store::{InMemoryStore, StoreExt};

    pub struct Fixture {
        pub store: Arc<InMemoryStore>,
        pub notifier: Arc<RecordingNotifier>,
        pub handlers: TaskHandlers,
    }

    impl Fixture {
        pub fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let notifier = Arc::new(RecordingNotifier::new());
            let handlers = TaskHandlers::new(
                store.clone(),
                notifier.clone(),
                NotificationLinks {
                    verify_email_base_url: "https://edu.test".to_string(),
                    reset_password_url: "https://edu.test/reset/password".to_string(),
                },
            );
            Self {
                store,
                notifier,
                handlers,
            }
        }

        pub fn user(&self, name: &str, role: &str) -> User {
            self.store
                .execute_atomic(|q| {
                    q.create_user(NewUser {
                        user_name: name.to_string(),
                        first_name: name.to_uppercase(),
                        email: format!("{name}@example.com"),
                        role: role.to_string(),
                    })
                })
                .unwrap()
        }

        pub fn course(&self, owner: &User, materials: usize) -> (Course, Vec<Material>) {
            self.store
                .execute_atomic(|q| {
                    let course = q.create_course(NewCourse {
                        owner_id: owner.id,
                        title: "Rust 101".to_string(),
                    })?;
                    let mut rows = Vec::new();
                    for i in 0..materials {
                        rows.push(q.create_material(NewMaterial {
                            course_id: course.id,
                            title: format!("Lesson {i}"),
                            file_url: format!("https://files.test/{i}.pdf"),
                            order_number: i as i32,
                        })?);
                    }
                    Ok::<_, crate::store::StoreError>((course, rows))
                })
                .unwrap()
        }
    }

    pub fn credential(user: &User) -> Credential {
        Credential::new(user.id, Role::from(user.role.as_str()), user.user_name.clone())
    }

    pub fn ctx(task: TaskType) -> JobContext {
        JobContext::new(JobId::new(), task, 1, 10, Arc::new(AtomicBool::new(false)))
    }

    pub fn cancelled_ctx(task: TaskType) -> JobContext {
        JobContext::new(JobId::new(), task, 1, 10, Arc::new(AtomicBool::new(true)))
    }
}
