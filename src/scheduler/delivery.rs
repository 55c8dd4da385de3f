//! Hand-off of scheduled run results to recipients.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::execution::ExportArtifact;
use crate::model::ReportSchedule;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// What a scheduled run produced.
#[derive(Debug, Clone)]
pub struct Delivery<'a> {
    pub schedule: &'a ReportSchedule,
    pub report_name: &'a str,
    pub row_count: usize,
    pub truncated: bool,
    pub artifact: Option<&'a ExportArtifact>,
}

/// Delivers scheduled results. Implementations send mail, upload files,
/// post to webhooks and the like.
#[async_trait]
pub trait ReportDelivery: Send + Sync {
    async fn deliver(&self, delivery: Delivery<'_>) -> Result<(), DeliveryError>;
}

/// Logs each delivery and sends nothing.
#[derive(Debug, Clone, Default)]
pub struct LogDelivery;

#[async_trait]
impl ReportDelivery for LogDelivery {
    async fn deliver(&self, delivery: Delivery<'_>) -> Result<(), DeliveryError> {
        info!(
            schedule_id = delivery.schedule.id,
            report = delivery.report_name,
            recipients = ?delivery.schedule.recipients,
            rows = delivery.row_count,
            file = delivery.artifact.map(|a| a.filename.as_str()),
            "scheduled report ready"
        );
        Ok(())
    }
}

/// Writes artifacts to `<root>/schedule_<id>/<filename>`.
#[derive(Debug, Clone)]
pub struct DirectoryDelivery {
    root: PathBuf,
}

impl DirectoryDelivery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn schedule_dir(&self, schedule: &ReportSchedule) -> PathBuf {
        self.root.join(format!("schedule_{}", schedule.id))
    }
}

#[async_trait]
impl ReportDelivery for DirectoryDelivery {
    async fn deliver(&self, delivery: Delivery<'_>) -> Result<(), DeliveryError> {
        let Some(artifact) = delivery.artifact else {
            return Err(DeliveryError::Failed(format!(
                "schedule {} produced no export to deliver",
                delivery.schedule.id
            )));
        };

        let dir = self.schedule_dir(delivery.schedule);
        fs::create_dir_all(&dir)?;
        let path = dir.join(&artifact.filename);
        fs::write(&path, &artifact.bytes)?;

        info!(
            schedule_id = delivery.schedule.id,
            path = %path.display(),
            recipients = delivery.schedule.recipients.len(),
            "scheduled report delivered"
        );
        Ok(())
    }
}
