//! Report delivery over SMTP
//!
//! One message per recipient, each carrying the workbook as an attachment,
//! over a STARTTLS relay. A failed recipient never aborts the rest of the
//! fan-out: every dispatch is recorded as a [`DeliveryAttempt`] and the run
//! loop decides what the failures mean for the run status.
//!
//! Transient transport failures are retried per recipient; address and
//! composition errors are permanent and fail that recipient immediately.

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::EmailSettings;
use crate::retry::{RetryClass, RetryPolicy, Retryable};
use crate::types::{DeliveryAttempt, ReportArtifact};

const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid address '{address}': {source}")]
    Address {
        address: String,
        source: lettre::address::AddressError,
    },

    #[error("failed to compose message: {0}")]
    Compose(#[from] lettre::error::Error),

    #[error("invalid attachment content type: {0}")]
    ContentType(#[from] lettre::message::header::ContentTypeErr),

    #[error("failed to read report attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("smtp transport failure: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

impl Retryable for NotificationError {
    fn retry_class(&self) -> RetryClass {
        match self {
            // Rejected by the server for cause: retry cannot help.
            NotificationError::Smtp(e) if e.is_permanent() => RetryClass::Permanent,
            NotificationError::Smtp(_) => RetryClass::Transient,
            _ => RetryClass::Permanent,
        }
    }
}

/// SMTP dispatcher for the report artifact.
pub struct Notifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    subject: String,
    retry: RetryPolicy,
}

impl Notifier {
    /// Build the relay from settings. No connection is made until the
    /// first send.
    pub fn new(settings: &EmailSettings, retry: RetryPolicy) -> Result<Self, NotificationError> {
        let from: Mailbox =
            settings
                .from
                .parse()
                .map_err(|source| NotificationError::Address {
                    address: settings.from.clone(),
                    source,
                })?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)?
            .port(settings.smtp_port)
            .credentials(Credentials::new(
                settings.smtp_username.clone(),
                settings.smtp_password.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            from,
            subject: settings.subject.clone(),
            retry,
        })
    }

    /// Send the report to every recipient, independently. Returns one
    /// attempt per recipient, in input order.
    pub async fn dispatch_report(
        &self,
        recipients: &[String],
        artifact: &ReportArtifact,
    ) -> Vec<DeliveryAttempt> {
        let workbook = match std::fs::read(&artifact.path) {
            Ok(bytes) => bytes,
            Err(source) => {
                // Nothing to attach: every recipient fails the same way.
                let err = NotificationError::Attachment {
                    path: artifact.path.clone(),
                    source,
                };
                warn!(error = %err, "report attachment unreadable");
                return recipients
                    .iter()
                    .map(|r| failed_attempt(r, &err))
                    .collect();
            }
        };
        let filename = artifact
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.xlsx".to_string());
        let body = summary_body(artifact);

        let mut attempts = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let attempt = self
                .send_one(recipient, &workbook, &filename, &body)
                .await;
            match &attempt {
                Ok(()) => info!(recipient = %recipient, "report delivered"),
                Err(e) => warn!(recipient = %recipient, error = %e, "report delivery failed"),
            }
            attempts.push(match attempt {
                Ok(()) => DeliveryAttempt {
                    recipient: recipient.clone(),
                    succeeded: true,
                    error: None,
                    attempted_at: chrono::Utc::now(),
                },
                Err(e) => failed_attempt(recipient, &e),
            });
        }
        attempts
    }

    async fn send_one(
        &self,
        recipient: &str,
        workbook: &[u8],
        filename: &str,
        body: &str,
    ) -> Result<(), NotificationError> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|source| NotificationError::Address {
                address: recipient.to_string(),
                source,
            })?;

        self.retry
            .run("report_email", || async {
                // Messages are consumed by send, so each attempt rebuilds.
                let message = self.compose(to.clone(), workbook, filename, body)?;
                self.transport.send(message).await?;
                Ok(())
            })
            .await
    }

    fn compose(
        &self,
        to: Mailbox,
        workbook: &[u8],
        filename: &str,
        body: &str,
    ) -> Result<Message, NotificationError> {
        let attachment = Attachment::new(filename.to_string())
            .body(workbook.to_vec(), ContentType::parse(XLSX_CONTENT_TYPE)?);

        Ok(Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(self.subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(body.to_string()))
                    .singlepart(attachment),
            )?)
    }
}

fn failed_attempt(recipient: &str, error: &NotificationError) -> DeliveryAttempt {
    DeliveryAttempt {
        recipient: recipient.to_string(),
        succeeded: false,
        error: Some(error.to_string()),
        attempted_at: chrono::Utc::now(),
    }
}

/// Plain-text message body summarizing the attached report.
fn summary_body(artifact: &ReportArtifact) -> String {
    format!(
        "Well production report generated {}.\n\n\
         Data rows: {}\n\
         Records accepted: {}\n\
         Records rejected: {}\n\n\
         The full report is attached.\n",
        artifact.generated_at.format("%Y-%m-%d %H:%M UTC"),
        artifact.data_rows,
        artifact.accepted,
        artifact.rejected,
    )
}
