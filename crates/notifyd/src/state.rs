use async_trait::async_trait;
use notify_core::AdmissionController;
use std::sync::Arc;
use tracing::info;

/// Delivers an admitted notification. Only called after `Decision::Allowed`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, identity: &str, event_type: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, identity: &str, event_type: &str) -> anyhow::Result<()> {
        info!(identity, event_type, "notification delivered");
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(admission: Arc<AdmissionController>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            admission,
            notifier,
        }
    }
}
