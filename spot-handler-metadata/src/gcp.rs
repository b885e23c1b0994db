use constcat::concat;
use reqwest::StatusCode;

use super::*;

const METADATA_URL: &str = "http://metadata.google.internal";
const INSTANCE_PATH: &str = "/computeMetadata/v1/instance";
const MAINTENANCE_EVENT_PATH: &str = concat!(INSTANCE_PATH, "/maintenance-event");
const PREEMPTED_PATH: &str = concat!(INSTANCE_PATH, "/preempted");

const TERMINATE_ON_HOST_MAINTENANCE: &str = "TERMINATE_ON_HOST_MAINTENANCE";
const PREEMPTED: &str = "TRUE";

/// Reads the GCE `maintenance-event` and `preempted` metadata keys.
#[derive(Debug)]
pub struct GcpChecker {
    client: reqwest::Client,
    base_url: String,
}

impl GcpChecker {
    pub fn new() -> Result<Self, MetadataError> {
        Self::with_base_url(METADATA_URL)
    }

    pub fn with_base_url(url: impl Into<String>) -> Result<Self, MetadataError> {
        Ok(Self {
            client: client()?,
            base_url: base_url(url),
        })
    }

    async fn value(&self, path: &str) -> Result<String, MetadataError> {
        let url = format!("{}{path}", self.base_url);
        let request = self.client.get(&url).header("Metadata-Flavor", "Google");
        let response = send(request, &url).await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(MetadataError::Status { url, status });
        }

        response
            .text()
            .await
            .map(|text| text.trim().to_string())
            .map_err(|source| MetadataError::Decode { url, source })
    }
}

#[async_trait]
impl MetadataChecker for GcpChecker {
    /// Either key alone can announce the end of the instance, so an unreadable one
    /// only fails the check when the other cannot be read either.
    async fn check_interrupt(&self) -> Result<bool, MetadataError> {
        let maintenance = self.value(MAINTENANCE_EVENT_PATH).await;
        if maintenance
            .as_deref()
            .is_ok_and(|event| event == TERMINATE_ON_HOST_MAINTENANCE)
        {
            tracing::info!("Host maintenance will terminate the instance");
            return Ok(true);
        }

        let preempted = self.value(PREEMPTED_PATH).await;
        match (maintenance, preempted) {
            (Err(err), Err(_)) => Err(err),
            (Err(err), Ok(preempted)) => {
                tracing::warn!(?err, "Reading maintenance event failed");
                Ok(preempted == PREEMPTED)
            }
            (Ok(_), Err(err)) => {
                tracing::warn!(?err, "Reading preemption flag failed");
                Ok(false)
            }
            (Ok(_), Ok(preempted)) => Ok(preempted == PREEMPTED),
        }
    }

    /// GCP has no rebalance signal.
    async fn check_rebalance_recommendation(&self) -> Result<bool, MetadataError> {
        Ok(false)
    }
}
