// backupagent/src/backup/notify.rs
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::info;

use crate::config::{MailConfig, NotificationSchedule};
use crate::errors::NotifyError;

/// Delivers the summary of uploaded artifacts to an operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, artifact_names: &[String]) -> Result<(), NotifyError>;
}

/// Decides whether a run should send the accumulated names.
///
/// `EverySuccess` fires on runs that uploaded something; `FixedHours` fires on
/// runs in a listed hour while names are pending.
pub fn should_notify(
    schedule: &NotificationSchedule,
    uploaded_this_run: usize,
    pending: usize,
    hour: u32,
) -> bool {
    if pending == 0 {
        return false;
    }
    match schedule {
        NotificationSchedule::EverySuccess => uploaded_this_run > 0,
        NotificationSchedule::FixedHours(hours) => hours.contains(&hour),
    }
}

#[derive(Debug, Serialize)]
struct MailMessage<'a> {
    from: &'a str,
    to: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    cc: Option<&'a [String]>,
    subject: String,
    html: String,
}

/// Sends the summary as an HTML email through an HTTP mail relay.
pub struct HttpMailNotifier {
    client: reqwest::Client,
    config: MailConfig,
}

impl HttpMailNotifier {
    pub fn new(config: MailConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Notifier for HttpMailNotifier {
    async fn notify(&self, artifact_names: &[String]) -> Result<(), NotifyError> {
        if artifact_names.is_empty() {
            return Err(NotifyError::Empty);
        }
        let now = Local::now();
        let message = MailMessage {
            from: &self.config.from,
            to: &self.config.to,
            cc: Some(self.config.cc.as_slice()).filter(|cc| !cc.is_empty()),
            subject: mail_subject(artifact_names.len(), now),
            html: render_summary(artifact_names),
        };

        let mut request = self.client.post(&self.config.endpoint_url).json(&message);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            recipients = self.config.to.len(),
            artifacts = artifact_names.len(),
            "📧 Backup notification sent"
        );
        Ok(())
    }
}

/// Stands in when no mail relay is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, artifact_names: &[String]) -> Result<(), NotifyError> {
        info!(artifacts = ?artifact_names, "Backup files uploaded (email notifications disabled)");
        Ok(())
    }
}

pub fn mail_subject(count: usize, now: DateTime<Local>) -> String {
    let noun = if count == 1 { "File" } else { "Files" };
    format!("Backup {} Uploaded - {}", noun, now.format("%Y-%m-%d %H:%M:%S"))
}

/// Renders the numbered table of uploaded archive names.
pub fn render_summary(artifact_names: &[String]) -> String {
    let rows: String = artifact_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            format!(
                r#"<tr><td style="border: 1px solid #ddd; padding: 8px; text-align: center;">{}</td><td style="border: 1px solid #ddd; padding: 8px;">{}</td></tr>"#,
                index + 1,
                escape_html(name)
            )
        })
        .collect();

    format!(
        r#"<div style="font-family: Arial, sans-serif; color: #333;">
<h1 style="color: #4CAF50;">Backup Files Uploaded</h1>
<p>The following backup files have been successfully uploaded to S3:</p>
<table style="border-collapse: collapse; width: 100%;">
<thead><tr style="background-color: #f2f2f2;"><th style="border: 1px solid #ddd; padding: 8px;">#</th><th style="border: 1px solid #ddd; padding: 8px;">File Name</th></tr></thead>
<tbody>{}</tbody>
</table>
<p style="margin-top: 20px;">Best regards,<br>Your Backup Service</p>
</div>"#,
        rows
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
