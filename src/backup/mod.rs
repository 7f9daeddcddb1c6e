pub(crate) mod archive;
pub(crate) mod cleanup;
pub(crate) mod logic;
pub(crate) mod multipart;
pub(crate) mod notify;
pub(crate) mod s3_upload;

#[cfg(test)]
pub(crate) mod fakes;

use std::sync::Arc;

use crate::config::{AppConfig, MailConfig};

pub use archive::TarGzArchiver;
pub use logic::{Orchestrator, RunOutcome};
pub use notify::{HttpMailNotifier, LogNotifier, Notifier};
pub use s3_upload::S3MultipartStore;

/// Picks the mail relay when one is configured, otherwise logs the summary.
pub fn build_notifier(mail: Option<&MailConfig>) -> anyhow::Result<Arc<dyn Notifier>> {
    match mail {
        Some(config) => Ok(Arc::new(HttpMailNotifier::new(config.clone())?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// Public entry point for the backup pipeline: wires the S3 store, the
/// tar.gz archiver and the notifier into an [`Orchestrator`].
pub async fn build_orchestrator(app_config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let store = S3MultipartStore::connect(&app_config.storage).await;
    tracing::info!(bucket = store.bucket(), "S3 store ready");
    if let Err(e) = store.check_connection().await {
        tracing::warn!(error = %e, "⚠️ Bucket check failed; uploads will be retried on each tick");
    }
    let notifier = build_notifier(app_config.notification.as_ref())?;

    Ok(Orchestrator::new(
        app_config.pipeline.clone(),
        Arc::new(TarGzArchiver),
        Arc::new(store),
        notifier,
    ))
}
