//! Outbound email.
//!
//! Handlers talk to a [`Notifier`]; the worker binary picks [`SmtpNotifier`]
//! when SMTP is configured and [`RecordingNotifier`] otherwise.

use std::path::PathBuf;
use std::sync::Arc;

pub mod recording;
pub mod smtp;

pub use recording::RecordingNotifier;
pub use smtp::{EmailConfig, SmtpNotifier};

/// Notification failure. Always retryable from the job's point of view: the
/// data the email describes is already committed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("SMTP transport error: {0}")]
    Transport(String),
    #[error("email address parse error: {0}")]
    Address(String),
    #[error("email build error: {0}")]
    Build(String),
}

/// One outgoing HTML email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub html_body: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Files attached as `application/octet-stream`.
    pub attachments: Vec<PathBuf>,
}

impl Email {
    pub fn new(subject: impl Into<String>, html_body: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            html_body: html_body.into(),
            to: vec![to.into()],
            ..Self::default()
        }
    }

    pub fn with_cc(mut self, cc: impl Into<String>) -> Self {
        self.cc.push(cc.into());
        self
    }

    pub fn with_bcc(mut self, bcc: impl Into<String>) -> Self {
        self.bcc.push(bcc.into());
        self
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }
}

pub trait Notifier: Send + Sync {
    fn send_email(&self, email: &Email) -> Result<(), NotifyError>;
}

impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn send_email(&self, email: &Email) -> Result<(), NotifyError> {
        (**self).send_email(email)
    }
}
