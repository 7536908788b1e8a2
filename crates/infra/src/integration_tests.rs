//! End-to-end flows: command → unit of work → outbox → queue → worker pool →
//! handler → store / notifier.
//!
//! Routing uses zero delays so `run_until_idle` drains everything queued.

use std::sync::Arc;
use std::time::Duration;

use eduapp_auth::{Credential, Role};
use eduapp_core::{Course, CourseId, MaterialId, NewCourse, NewMaterial, NewUser, User, UserId};

use crate::commands::{CommandError, Commands};
use crate::handlers::{NotificationLinks, TaskHandlers};
use crate::jobs::payload::DeleteCourse;
use crate::jobs::{
    Dispatcher, HandlerRegistry, InMemoryJobQueue, JobQueue, PoolConfig, RoutingTable, WorkerPool,
};
use crate::notifier::RecordingNotifier;
use crate::store::{InMemoryStore, StoreExt};
use crate::unit_of_work::{ScheduledJob, UnitOfWork};

struct App {
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryJobQueue>,
    notifier: Arc<RecordingNotifier>,
    dispatcher: Dispatcher,
    commands: Commands,
    pool: WorkerPool,
}

impl App {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let routing = RoutingTable::default().with_delays(Duration::ZERO, Duration::ZERO);
        let dispatcher = Dispatcher::new(queue.clone(), routing);
        let commands = Commands::new(UnitOfWork::new(store.clone(), dispatcher.clone()));

        let mut registry = HandlerRegistry::new();
        TaskHandlers::new(store.clone(), notifier.clone(), NotificationLinks::default())
            .register_all(&mut registry);
        let pool = WorkerPool::new(
            queue.clone(),
            registry,
            PoolConfig::default().with_name("test-pool"),
        );

        Self {
            store,
            queue,
            notifier,
            dispatcher,
            commands,
            pool,
        }
    }

    fn drain(&self) -> usize {
        self.pool.run_until_idle().unwrap()
    }

    fn register(&self, name: &str, role: &str) -> User {
        self.commands
            .register_user(NewUser {
                user_name: name.to_string(),
                first_name: name.to_string(),
                email: format!("{name}@example.com"),
                role: role.to_string(),
            })
            .unwrap()
            .value
    }

    fn course(&self, owner: &User, materials: usize) -> (Course, Vec<MaterialId>) {
        let course = self
            .store
            .execute_atomic(|q| {
                q.create_course(NewCourse {
                    owner_id: owner.id,
                    title: "Algorithms".to_string(),
                })
            })
            .unwrap();
        let mut ids = Vec::with_capacity(materials);
        for i in 0..materials {
            let material = self
                .commands
                .create_material(
                    &credential(owner),
                    NewMaterial {
                        course_id: course.id,
                        title: format!("Part {i}"),
                        file_url: format!("https://files.test/{i}.pdf"),
                        order_number: i as i32,
                    },
                )
                .unwrap()
                .value;
            ids.push(material.id);
        }
        (course, ids)
    }

    fn progress(&self, user: UserId, course: CourseId) -> Option<u8> {
        self.store
            .execute_atomic(|q| q.get_course_progress(user, course))
            .unwrap()
            .map(|p| p.progress.value())
    }

    fn course_exists(&self, id: CourseId) -> bool {
        self.store
            .execute_atomic(|q| q.get_course(id))
            .unwrap()
            .is_some()
    }
}

fn credential(user: &User) -> Credential {
    Credential::new(user.id, Role::from(user.role.as_str()), user.user_name.clone())
}

#[test]
fn subscribe_and_complete_lessons_reaches_full_progress() {
    let app = App::new();
    let owner = app.register("instructor", "admin");
    let student = app.register("learner", "student");
    let (course, materials) = app.course(&owner, 2);
    app.drain();

    let cred = credential(&student);
    app.commands.subscribe(&cred, course.id).unwrap();
    app.drain();
    assert_eq!(app.progress(student.id, course.id), Some(0));

    app.commands
        .complete_lesson(&cred, course.id, materials[0])
        .unwrap();
    app.drain();
    assert_eq!(app.progress(student.id, course.id), Some(50));

    app.commands
        .complete_lesson(&cred, course.id, materials[1])
        .unwrap();
    app.drain();
    assert_eq!(app.progress(student.id, course.id), Some(100));

    // explicit recompute is stable
    app.commands.recompute_progress(student.id, course.id).unwrap();
    app.drain();
    assert_eq!(app.progress(student.id, course.id), Some(100));
}

#[test]
fn duplicate_completion_is_conflict_and_queues_nothing() {
    let app = App::new();
    let owner = app.register("instructor", "admin");
    let student = app.register("learner", "student");
    let (course, materials) = app.course(&owner, 1);
    let material = materials[0];
    let cred = credential(&student);
    app.commands.subscribe(&cred, course.id).unwrap();
    app.drain();

    app.commands
        .complete_lesson(&cred, course.id, material)
        .unwrap();
    app.drain();

    let err = app
        .commands
        .complete_lesson(&cred, course.id, material)
        .unwrap_err();
    assert!(matches!(err, CommandError::Conflict(_)));
    assert_eq!(app.queue.stats().unwrap().pending, 0);
    assert_eq!(app.drain(), 0);
}

#[test]
fn replayed_progress_job_is_idempotent() {
    let app = App::new();
    let owner = app.register("instructor", "admin");
    let student = app.register("learner", "student");
    let (course, _) = app.course(&owner, 3);
    let cred = credential(&student);
    app.commands.subscribe(&cred, course.id).unwrap();
    app.drain();

    let outcome = app.commands.recompute_progress(student.id, course.id).unwrap();
    let job_id = outcome.job.unwrap().job_id();
    let job = app.queue.get(job_id).unwrap().unwrap();
    app.drain();
    let first = app.progress(student.id, course.id);

    // same job delivered again (at-least-once)
    let mut replay = crate::jobs::NewJob::new(
        job.task,
        job.payload.clone(),
        job.queue.clone(),
        job.max_attempts(),
        chrono::Utc::now(),
    );
    replay.retry_policy = job.retry_policy.clone();
    app.dispatcher.enqueue(replay).unwrap();
    app.drain();

    assert_eq!(app.progress(student.id, course.id), first);
}

#[test]
fn owner_delete_removes_course_without_request() {
    let app = App::new();
    let owner = app.register("instructor", "admin");
    let (course, _) = app.course(&owner, 1);
    app.drain();

    app.commands
        .request_course_deletion(&credential(&owner), course.id)
        .unwrap();
    app.drain();

    assert!(!app.course_exists(course.id));
    let request = app
        .store
        .execute_atomic(|q| q.get_deletion_request_for_course(course.id))
        .unwrap();
    assert!(request.is_none());
}

#[test]
fn non_owner_delete_then_owner_confirmation() {
    let app = App::new();
    let owner = app.register("instructor", "admin");
    let other = app.register("colleague", "admin");
    let (course, _) = app.course(&owner, 1);
    app.drain();
    let before = app.notifier.sent_to("instructor@example.com").len();

    for _ in 0..2 {
        app.commands
            .request_course_deletion(&credential(&other), course.id)
            .unwrap();
        app.drain();
    }

    let request = app
        .store
        .execute_atomic(|q| q.get_deletion_request_for_course(course.id))
        .unwrap()
        .expect("pending request");
    assert!(request.pending && !request.confirm);
    let requests_to_owner = app
        .notifier
        .sent_to("instructor@example.com")
        .into_iter()
        .skip(before)
        .filter(|e| e.subject == "Request to Delete Course")
        .count();
    assert_eq!(requests_to_owner, 1);
    assert!(app.course_exists(course.id));

    // only the owner may confirm
    app.commands
        .confirm_deletion_request(&credential(&other), request.id)
        .unwrap();
    app.drain();
    assert!(app.course_exists(course.id));
    assert_eq!(app.queue.stats().unwrap().dead_lettered, 1);

    app.commands
        .confirm_deletion_request(&credential(&owner), request.id)
        .unwrap();
    app.drain();
    assert!(!app.course_exists(course.id));
}

#[test]
fn registration_sends_role_based_welcome() {
    let app = App::new();
    app.register("instructor", "admin");
    app.register("learner", "student");
    app.drain();

    let instructor_mail = app.notifier.sent_to("instructor@example.com");
    assert_eq!(instructor_mail.len(), 1);
    assert_eq!(instructor_mail[0].subject, "Welcome to EduApp Teaching Committee");
    let learner_mail = app.notifier.sent_to("learner@example.com");
    assert_eq!(learner_mail[0].subject, "Welcome to EduApp");
}

#[test]
fn notification_failure_retries_without_undoing_data() {
    let app = App::new();
    app.notifier.fail_next(1);
    let user = app.register("learner", "student");

    app.drain();
    // first attempt failed, retry scheduled with zero delay
    app.queue.make_all_ready().unwrap();
    app.drain();

    assert_eq!(app.notifier.sent_to("learner@example.com").len(), 1);
    let status = app
        .store
        .execute_atomic(|q| q.get_user_status(user.id))
        .unwrap();
    assert!(status.is_some());
}

#[test]
fn commit_failure_enqueues_nothing() {
    let app = App::new();
    app.store.fail_next_commits(1);

    let err = app
        .commands
        .register_user(NewUser {
            user_name: "learner".to_string(),
            first_name: "L".to_string(),
            email: "learner@example.com".to_string(),
            role: "student".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, CommandError::Store(_)));
    assert_eq!(app.queue.stats().unwrap().pending, 0);
    let user = app
        .store
        .execute_atomic(|q| q.get_user_by_name("learner"))
        .unwrap();
    assert!(user.is_none());
}

#[test]
fn queue_outage_after_commit_is_relayed_later() {
    let app = App::new();
    app.queue.set_unavailable(true);
    let owner = app.register("instructor", "admin");
    let (course, _) = app.course(&owner, 0);

    let outcome = app
        .commands
        .request_course_deletion(&credential(&owner), course.id)
        .unwrap();
    assert!(matches!(outcome.job, Some(ScheduledJob::PendingRelay { .. })));
    assert!(app.course_exists(course.id));

    app.queue.set_unavailable(false);
    let report = app
        .commands
        .unit_of_work()
        .relay()
        .relay_pending(100)
        .unwrap();
    // verify email + delete course
    assert_eq!(report.delivered, 2);
    app.drain();

    assert!(!app.course_exists(course.id));
    assert_eq!(app.notifier.sent_to("instructor@example.com").len(), 1);
}

#[test]
fn malformed_payload_is_dead_lettered_once() {
    let app = App::new();
    let job = app
        .dispatcher
        .prepare(&DeleteCourse {
            course_id: CourseId::new(1),
            credential: Credential::new(UserId::new(1), Role::ADMIN, "x"),
        })
        .unwrap();
    let mut broken = job;
    broken.payload = serde_json::json!({ "course_id": "not a number" });
    app.dispatcher.enqueue(broken).unwrap();

    app.drain();
    let stats = app.queue.stats().unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.retrying, 0);
}

#[test]
fn lesson_completion_requires_subscription() {
    let app = App::new();
    let owner = app.register("instructor", "admin");
    let student = app.register("learner", "student");
    let (course, materials) = app.course(&owner, 2);
    let cred = credential(&student);
    app.drain();
    let queued = app.queue.stats().unwrap().pending;

    let err = app
        .commands
        .complete_lesson(&cred, course.id, materials[0])
        .unwrap_err();
    assert!(matches!(err, CommandError::NotFound(_)));
    assert_eq!(app.queue.stats().unwrap().pending, queued);
    assert_eq!(app.progress(student.id, course.id), None);

    app.commands.subscribe(&cred, course.id).unwrap();
    app.drain();
    app.commands
        .complete_lesson(&cred, course.id, materials[0])
        .unwrap();
    app.drain();

    let subscription = app
        .store
        .execute_atomic(|q| q.get_subscription(student.id, course.id))
        .unwrap();
    assert!(subscription.is_some());
    assert_eq!(app.progress(student.id, course.id), Some(50));
}

#[test]
fn delete_with_mismatched_credential_is_dead_lettered() {
    let app = App::new();
    let owner = app.register("instructor", "admin");
    app.register("colleague", "admin");
    let (course, _) = app.course(&owner, 1);
    app.drain();

    let forged = Credential::new(owner.id, Role::ADMIN, "colleague");
    app.commands
        .request_course_deletion(&forged, course.id)
        .unwrap();
    app.drain();

    assert!(app.course_exists(course.id));
    assert_eq!(app.queue.stats().unwrap().dead_lettered, 1);
    let request = app
        .store
        .execute_atomic(|q| q.get_deletion_request_for_course(course.id))
        .unwrap();
    assert!(request.is_none());
}
