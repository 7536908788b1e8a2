//! Typed job payloads, one per [`TaskType`].
//!
//! Payloads are encoded as JSON objects with `snake_case` fields. Anything
//! that identifies the caller travels as an explicit [`Credential`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use eduapp_auth::Credential;
use eduapp_core::{CourseId, MaterialId, Progress, RequestId, UserId};

use super::types::TaskType;

/// Binds a payload type to the task it drives.
pub trait TaskPayload: Serialize + DeserializeOwned + Send + 'static {
    const TASK: TaskType;

    fn encode(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn decode(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendVerifyEmail {
    pub user_name: String,
}

impl TaskPayload for SendVerifyEmail {
    const TASK: TaskType = TaskType::SendVerifyEmail;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubscription {
    pub user_id: UserId,
    pub course_id: CourseId,
}

impl TaskPayload for CreateSubscription {
    const TASK: TaskType = TaskType::CreateSubscription;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLessonCompletion {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub material_id: MaterialId,
}

impl TaskPayload for CreateLessonCompletion {
    const TASK: TaskType = TaskType::CreateLessonCompletion;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMaterialNotification {
    pub material_id: MaterialId,
    pub credential: Credential,
    pub title: String,
    pub file_url: String,
    pub order_number: i32,
}

impl TaskPayload for CreateMaterialNotification {
    const TASK: TaskType = TaskType::CreateMaterialNotification;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCourse {
    pub course_id: CourseId,
    pub credential: Credential,
}

impl TaskPayload for DeleteCourse {
    const TASK: TaskType = TaskType::DeleteCourse;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub request_id: RequestId,
    pub credential: Credential,
}

impl TaskPayload for UpdateRequest {
    const TASK: TaskType = TaskType::UpdateRequest;
}

/// `progress` is whatever the caller last saw; the handler always recomputes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCourseProgress {
    pub user_id: UserId,
    pub course_id: CourseId,
    #[serde(default)]
    pub progress: Progress,
}

impl TaskPayload for UpdateCourseProgress {
    const TASK: TaskType = TaskType::UpdateCourseProgress;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPassword {
    pub email: String,
}

impl TaskPayload for ResetPassword {
    const TASK: TaskType = TaskType::ResetPassword;
}

#[cfg(test)]
mod tests {
    use super::*;
    use eduapp_auth::Role;

    #[test]
    fn credential_is_an_explicit_payload_field() {
        let payload = DeleteCourse {
            course_id: CourseId::new(3),
            credential: Credential::new(UserId::new(7), Role::STUDENT, "bob"),
        };
        let json = payload.encode().unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "course_id": 3,
                "credential": {"user_id": 7, "role": "student", "user_name": "bob"}
            })
        );
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let err = CreateSubscription::decode(&serde_json::json!({"user_id": "x"}));
        assert!(err.is_err());
    }

    #[test]
    fn progress_field_is_optional() {
        let p = UpdateCourseProgress::decode(&serde_json::json!({"user_id": 1, "course_id": 2}))
            .unwrap();
        assert_eq!(p.progress, Progress::ZERO);
    }
}
