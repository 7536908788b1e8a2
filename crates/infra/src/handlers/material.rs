use tracing::info;

use super::{TaskHandlers, authenticate};
use crate::jobs::payload::CreateMaterialNotification;
use crate::jobs::{JobContext, TaskError};
use crate::notifier::Email;
use crate::store::StoreExt;

impl TaskHandlers {
    pub fn create_material_notification(
        &self,
        ctx: &JobContext,
        payload: CreateMaterialNotification,
    ) -> Result<(), TaskError> {
        let user = self
            .store
            .execute_atomic(|q| authenticate(&*q, &payload.credential))?;

        let body = format!(
            "Hello {},<br/>\
             Your material \"{}\" (lesson {}) has been created. You can view it <a href=\"{}\">here</a>.<br/>\
             Please do not share this material with others.<br/>",
            user.first_name, payload.title, payload.order_number, payload.file_url
        );
        self.notifier
            .send_email(&Email::new("Material Created", body, user.email.clone()))?;

        info!(
            job_id = %ctx.job_id,
            material_id = %payload.material_id,
            user_id = %user.id,
            "material notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eduapp_auth::{Credential, Role};
    use eduapp_core::UserId;

    use crate::handlers::test_support::{Fixture, credential, ctx};
    use crate::jobs::TaskType;

    fn payload(fx: &Fixture, credential: Credential) -> CreateMaterialNotification {
        let owner = fx
            .store
            .execute_atomic(|q| q.get_user_by_name("owner"))
            .unwrap()
            .unwrap();
        let (_, materials) = fx.course(&owner, 1);
        let m = &materials[0];
        CreateMaterialNotification {
            material_id: m.id,
            credential,
            title: m.title.clone(),
            file_url: m.file_url.clone(),
            order_number: m.order_number,
        }
    }

    #[test]
    fn owner_is_emailed_a_link() {
        let fx = Fixture::new();
        let owner = fx.user("owner", "admin");
        let p = payload(&fx, credential(&owner));

        fx.handlers
            .create_material_notification(&ctx(TaskType::CreateMaterialNotification), p)
            .unwrap();

        let sent = fx.notifier.sent_to("owner@example.com");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Material Created");
        assert!(sent[0].html_body.contains("https://files.test/0.pdf"));
    }

    #[test]
    fn forged_credential_is_unauthorized() {
        let fx = Fixture::new();
        fx.user("owner", "admin");
        let forged = Credential::new(UserId::new(999), Role::ADMIN, "owner");
        let p = payload(&fx, forged);

        let err = fx
            .handlers
            .create_material_notification(&ctx(TaskType::CreateMaterialNotification), p)
            .unwrap_err();
        assert!(matches!(err, TaskError::Unauthorized(_)));
        assert!(!err.is_retryable());
        assert!(fx.notifier.sent().is_empty());
    }
}
