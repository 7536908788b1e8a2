use rand::Rng;
use tracing::info;

use eduapp_auth::Role;
use eduapp_core::{User, UserStatus};

use super::TaskHandlers;
use crate::jobs::payload::{ResetPassword, SendVerifyEmail};
use crate::jobs::{JobContext, TaskError};
use crate::notifier::Email;
use crate::store::{StoreError, StoreExt};

const SECRET_CODE_LEN: usize = 6;

fn secret_code() -> String {
    let mut rng = rand::rng();
    (0..SECRET_CODE_LEN)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}

/// Subject and closing line of the welcome email for a user's role.
fn welcome_for(user: &User) -> Result<(&'static str, &'static str), TaskError> {
    let role = Role::from(user.role.as_str());
    if role.is_admin() {
        Ok((
            "Welcome to EduApp Teaching Committee",
            "Welcome to EduApp Teaching committee!",
        ))
    } else if role.is_student() {
        Ok(("Welcome to EduApp", "Thank you for registering with us!"))
    } else {
        Err(TaskError::validation(format!(
            "unknown user role: {}",
            user.role
        )))
    }
}

impl TaskHandlers {
    pub fn send_verify_email(
        &self,
        ctx: &JobContext,
        payload: SendVerifyEmail,
    ) -> Result<(), TaskError> {
        let user = self
            .store
            .execute_atomic(|q| q.get_user_by_name(&payload.user_name))?
            .ok_or_else(|| TaskError::not_found(format!("user {}", payload.user_name)))?;
        let (subject, closing) = welcome_for(&user)?;

        ctx.ensure_active()?;
        let verify = self.store.execute_atomic(|q| {
            let verify = match q.get_verify_email_for_user(user.id)? {
                Some(existing) => existing,
                None => q.create_verify_email(user.id, &user.email, &secret_code())?,
            };
            if q.get_user_status(user.id)?.is_none() {
                q.create_user_status(UserStatus::awaiting_verification(user.id))?;
            }
            Ok::<_, StoreError>(verify)
        })?;

        let link = format!(
            "{}/verifyemail?email_id={}&secret_code={}",
            self.links.verify_email_base_url.trim_end_matches('/'),
            verify.id,
            verify.secret_code
        );
        let body = format!(
            "Hello {},<br/>\
             Your OTP is {}. Don't share it with others!<br/>\
             Please <a href=\"{link}\">click here</a> to verify your email address.<br/>\
             <br/>{closing}<br/>",
            user.first_name, verify.secret_code
        );
        self.notifier
            .send_email(&Email::new(subject, body, user.email.clone()))?;

        info!(job_id = %ctx.job_id, user_id = %user.id, role = %user.role, "verify email sent");
        Ok(())
    }

    pub fn reset_password(&self, ctx: &JobContext, payload: ResetPassword) -> Result<(), TaskError> {
        let user = self
            .store
            .execute_atomic(|q| q.get_user_by_email(&payload.email))?
            .ok_or_else(|| TaskError::not_found(format!("no user with email {}", payload.email)))?;

        let body = format!(
            "Hello {},<br/>\
             We received a request to reset your account password.<br/>\
             If you initiated this request, please <a href=\"{}\">click here</a> to reset your password.<br/>\
             Thank you!",
            user.first_name, self.links.reset_password_url
        );
        self.notifier.send_email(&Email::new(
            "Reset your EduApp password",
            body,
            user.email.clone(),
        ))?;

        info!(job_id = %ctx.job_id, user_id = %user.id, "password reset email sent");
        Ok(())
    }
}
