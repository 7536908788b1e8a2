use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use eduapp_core::{
    CompletionId, Course, CourseId, CourseProgress, DeletionRequest, LessonCompletion, Material,
    MaterialId, NewCourse, NewLessonCompletion, NewMaterial, NewUser, OutboxId, RequestId,
    Subscription, SubscriptionId, User, UserId, UserStatus, VerifyEmail, VerifyEmailId,
};

use super::r#trait::{Queries, Store, StoreError, Transaction};
use crate::jobs::NewJob;
use crate::outbox::OutboxMessage;

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    users: BTreeMap<UserId, User>,
    courses: BTreeMap<CourseId, Course>,
    materials: BTreeMap<MaterialId, Material>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    completions: BTreeMap<CompletionId, LessonCompletion>,
    progress: BTreeMap<(UserId, CourseId), CourseProgress>,
    requests: BTreeMap<RequestId, DeletionRequest>,
    verify_emails: BTreeMap<VerifyEmailId, VerifyEmail>,
    user_statuses: BTreeMap<UserId, UserStatus>,
    outbox: BTreeMap<OutboxId, OutboxMessage>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory relational store.
///
/// Intended for tests/dev. Transactions are serialized behind one lock and
/// work on a copy of the tables that replaces the committed state on commit.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    commit_failures: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, n: usize) {
        self.commit_failures.store(n, Ordering::SeqCst);
    }

    /// Simulate an outage: `begin` fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn take_commit_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Store for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        let committed = self.lock()?;
        let working = committed.clone();
        Ok(Box::new(InMemoryTransaction {
            store: self,
            committed,
            working,
        }))
    }
}

struct InMemoryTransaction<'s> {
    store: &'s InMemoryStore,
    committed: MutexGuard<'s, Tables>,
    working: Tables,
}

impl Transaction for InMemoryTransaction<'_> {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.store.take_commit_failure() {
            return Err(StoreError::Unavailable("commit failed".to_string()));
        }
        let working = std::mem::take(&mut self.working);
        *self.committed = working;
        Ok(())
    }
}

impl Queries for InMemoryTransaction<'_> {
    fn create_user(&mut self, user: NewUser) -> Result<User, StoreError> {
        let t = &mut self.working;
        if t.users.values().any(|u| u.user_name == user.user_name) {
            return Err(StoreError::UniqueViolation(format!(
                "users.user_name = {}",
                user.user_name
            )));
        }
        if t.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::UniqueViolation(format!("users.email = {}", user.email)));
        }
        let row = User {
            id: UserId::new(t.next_id()),
            user_name: user.user_name,
            first_name: user.first_name,
            email: user.email,
            role: user.role,
        };
        t.users.insert(row.id, row.clone());
        Ok(row)
    }

    fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.working.users.get(&id).cloned())
    }

    fn get_user_by_name(&self, user_name: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .working
            .users
            .values()
            .find(|u| u.user_name == user_name)
            .cloned())
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.working.users.values().find(|u| u.email == email).cloned())
    }

    fn create_course(&mut self, course: NewCourse) -> Result<Course, StoreError> {
        let t = &mut self.working;
        if !t.users.contains_key(&course.owner_id) {
            return Err(StoreError::NotFound(format!("user {}", course.owner_id)));
        }
        let row = Course {
            id: CourseId::new(t.next_id()),
            owner_id: course.owner_id,
            title: course.title,
        };
        t.courses.insert(row.id, row.clone());
        Ok(row)
    }

    fn get_course(&self, id: CourseId) -> Result<Option<Course>, StoreError> {
        Ok(self.working.courses.get(&id).cloned())
    }

    fn delete_course(&mut self, id: CourseId) -> Result<bool, StoreError> {
        let t = &mut self.working;
        if t.courses.remove(&id).is_none() {
            return Ok(false);
        }
        t.materials.retain(|_, m| m.course_id != id);
        t.subscriptions.retain(|_, s| s.course_id != id);
        t.completions.retain(|_, c| c.course_id != id);
        t.progress.retain(|(_, course_id), _| *course_id != id);
        t.requests.retain(|_, r| r.course_id != id);
        Ok(true)
    }

    fn create_material(&mut self, material: NewMaterial) -> Result<Material, StoreError> {
        let t = &mut self.working;
        if !t.courses.contains_key(&material.course_id) {
            return Err(StoreError::NotFound(format!("course {}", material.course_id)));
        }
        let row = Material {
            id: MaterialId::new(t.next_id()),
            course_id: material.course_id,
            title: material.title,
            file_url: material.file_url,
            order_number: material.order_number,
        };
        t.materials.insert(row.id, row.clone());
        Ok(row)
    }

    fn get_material(&self, id: MaterialId) -> Result<Option<Material>, StoreError> {
        Ok(self.working.materials.get(&id).cloned())
    }

    fn count_materials(&self, course_id: CourseId) -> Result<u64, StoreError> {
        Ok(self
            .working
            .materials
            .values()
            .filter(|m| m.course_id == course_id)
            .count() as u64)
    }

    fn create_subscription(
        &mut self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Subscription, StoreError> {
        let t = &mut self.working;
        if t
            .subscriptions
            .values()
            .any(|s| s.user_id == user_id && s.course_id == course_id)
        {
            return Err(StoreError::UniqueViolation(format!(
                "subscriptions (user {user_id}, course {course_id})"
            )));
        }
        if !t.courses.contains_key(&course_id) {
            return Err(StoreError::NotFound(format!("course {course_id}")));
        }
        let row = Subscription {
            id: SubscriptionId::new(t.next_id()),
            user_id,
            course_id,
        };
        t.subscriptions.insert(row.id, row.clone());
        Ok(row)
    }

    fn get_subscription(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .working
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.course_id == course_id)
            .cloned())
    }

    fn create_lesson_completion(
        &mut self,
        completion: NewLessonCompletion,
    ) -> Result<LessonCompletion, StoreError> {
        let t = &mut self.working;
        if t.completions.values().any(|c| {
            c.user_id == completion.user_id
                && c.course_id == completion.course_id
                && c.material_id == completion.material_id
        }) {
            return Err(StoreError::UniqueViolation(format!(
                "lesson_completions (user {}, course {}, material {})",
                completion.user_id, completion.course_id, completion.material_id
            )));
        }
        let row = LessonCompletion {
            id: CompletionId::new(t.next_id()),
            user_id: completion.user_id,
            course_id: completion.course_id,
            material_id: completion.material_id,
            completed: true,
            completed_at: Utc::now(),
        };
        t.completions.insert(row.id, row.clone());
        Ok(row)
    }

    fn count_distinct_completed_materials(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<u64, StoreError> {
        let t = &self.working;
        let mut seen: Vec<MaterialId> = t
            .completions
            .values()
            .filter(|c| c.user_id == user_id && c.course_id == course_id && c.completed)
            .filter(|c| {
                t.materials
                    .get(&c.material_id)
                    .is_some_and(|m| m.course_id == course_id)
            })
            .map(|c| c.material_id)
            .collect();
        seen.sort();
        seen.dedup();
        Ok(seen.len() as u64)
    }

    fn create_course_progress(&mut self, progress: CourseProgress) -> Result<(), StoreError> {
        let key = (progress.user_id, progress.course_id);
        if self.working.progress.contains_key(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "course_progress (user {}, course {})",
                progress.user_id, progress.course_id
            )));
        }
        self.working.progress.insert(key, progress);
        Ok(())
    }

    fn get_course_progress(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<CourseProgress>, StoreError> {
        Ok(self.working.progress.get(&(user_id, course_id)).cloned())
    }

    fn upsert_course_progress(&mut self, progress: CourseProgress) -> Result<(), StoreError> {
        self.working
            .progress
            .insert((progress.user_id, progress.course_id), progress);
        Ok(())
    }

    fn create_deletion_request(
        &mut self,
        course_id: CourseId,
        requested_by: UserId,
    ) -> Result<DeletionRequest, StoreError> {
        let t = &mut self.working;
        if t.requests.values().any(|r| r.course_id == course_id) {
            return Err(StoreError::UniqueViolation(format!(
                "requests.course_id = {course_id}"
            )));
        }
        let row = DeletionRequest {
            id: RequestId::new(t.next_id()),
            course_id,
            requested_by,
            pending: true,
            confirm: false,
            notified_at: None,
            created_at: Utc::now(),
        };
        t.requests.insert(row.id, row.clone());
        Ok(row)
    }

    fn get_deletion_request(&self, id: RequestId) -> Result<Option<DeletionRequest>, StoreError> {
        Ok(self.working.requests.get(&id).cloned())
    }

    fn get_deletion_request_for_course(
        &self,
        course_id: CourseId,
    ) -> Result<Option<DeletionRequest>, StoreError> {
        Ok(self
            .working
            .requests
            .values()
            .find(|r| r.course_id == course_id)
            .cloned())
    }

    fn update_deletion_request(&mut self, request: &DeletionRequest) -> Result<(), StoreError> {
        match self.working.requests.get_mut(&request.id) {
            Some(row) => {
                *row = request.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("request {}", request.id))),
        }
    }

    fn delete_deletion_request(&mut self, id: RequestId) -> Result<bool, StoreError> {
        Ok(self.working.requests.remove(&id).is_some())
    }

    fn create_verify_email(
        &mut self,
        user_id: UserId,
        email: &str,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError> {
        let t = &mut self.working;
        let row = VerifyEmail {
            id: VerifyEmailId::new(t.next_id()),
            user_id,
            email: email.to_string(),
            secret_code: secret_code.to_string(),
            created_at: Utc::now(),
        };
        t.verify_emails.insert(row.id, row.clone());
        Ok(row)
    }

    fn get_verify_email_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<VerifyEmail>, StoreError> {
        Ok(self
            .working
            .verify_emails
            .values()
            .rev()
            .find(|v| v.user_id == user_id)
            .cloned())
    }

    fn create_user_status(&mut self, status: UserStatus) -> Result<(), StoreError> {
        if self.working.user_statuses.contains_key(&status.user_id) {
            return Err(StoreError::UniqueViolation(format!(
                "user_status.user_id = {}",
                status.user_id
            )));
        }
        self.working.user_statuses.insert(status.user_id, status);
        Ok(())
    }

    fn get_user_status(&self, user_id: UserId) -> Result<Option<UserStatus>, StoreError> {
        Ok(self.working.user_statuses.get(&user_id).cloned())
    }

    fn insert_outbox(&mut self, job: NewJob) -> Result<OutboxMessage, StoreError> {
        let t = &mut self.working;
        let row = OutboxMessage {
            id: OutboxId::new(t.next_id()),
            job,
            created_at: Utc::now(),
        };
        t.outbox.insert(row.id, row.clone());
        Ok(row)
    }

    fn pending_outbox(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        Ok(self
            .working
            .outbox
            .values()
            .filter(|m| m.created_at <= created_before)
            .take(limit)
            .cloned()
            .collect())
    }

    fn delete_outbox(&mut self, id: OutboxId) -> Result<bool, StoreError> {
        Ok(self.working.outbox.remove(&id).is_some())
    }
}
