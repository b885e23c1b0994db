use constcat::concat;
use reqwest::StatusCode;
use serde::Deserialize;

use super::*;

const IMDS_URL: &str = "http://169.254.169.254";
const SCHEDULED_EVENTS_API_VERSION: &str = "2020-07-01";
const SCHEDULED_EVENTS_PATH: &str = concat!(
    "/metadata/scheduledevents?api-version=",
    SCHEDULED_EVENTS_API_VERSION
);

const PREEMPT_EVENT: &str = "Preempt";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScheduledEvents {
    #[serde(default)]
    events: Vec<ScheduledEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScheduledEvent {
    event_type: String,
}

/// Watches the Azure scheduled events document for spot eviction (`Preempt`) events.
///
/// See <https://learn.microsoft.com/azure/virtual-machines/linux/scheduled-events>.
#[derive(Debug)]
pub struct AzureChecker {
    client: reqwest::Client,
    base_url: String,
}

impl AzureChecker {
    pub fn new() -> Result<Self, MetadataError> {
        Self::with_base_url(IMDS_URL)
    }

    pub fn with_base_url(url: impl Into<String>) -> Result<Self, MetadataError> {
        Ok(Self {
            client: client()?,
            base_url: base_url(url),
        })
    }

    async fn scheduled_events(&self) -> Result<ScheduledEvents, MetadataError> {
        let url = format!("{}{SCHEDULED_EVENTS_PATH}", self.base_url);
        let request = self.client.get(&url).header("Metadata", "true");
        let response = send(request, &url).await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(MetadataError::Status { url, status });
        }

        response
            .json()
            .await
            .map_err(|source| MetadataError::Decode { url, source })
    }
}

#[async_trait]
impl MetadataChecker for AzureChecker {
    async fn check_interrupt(&self) -> Result<bool, MetadataError> {
        let scheduled = self.scheduled_events().await?;
        Ok(scheduled
            .events
            .iter()
            .any(|event| event.event_type == PREEMPT_EVENT))
    }

    /// Azure has no rebalance signal.
    async fn check_rebalance_recommendation(&self) -> Result<bool, MetadataError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::matchers::query_param;

    use super::*;

    async fn scheduled_events(body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/scheduledevents"))
            .and(query_param("api-version", SCHEDULED_EVENTS_API_VERSION))
            .and(header("Metadata", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn preempt_event_is_an_interruption() {
        let server = scheduled_events(json!({
            "DocumentIncarnation": 2,
            "Events": [
                {"EventId": "A", "EventType": "Freeze", "ResourceType": "VirtualMachine"},
                {"EventId": "B", "EventType": "Preempt", "ResourceType": "VirtualMachine"},
            ],
        }))
        .await;

        let checker = AzureChecker::with_base_url(server.uri()).unwrap();

        assert!(checker.check_interrupt().await.unwrap());
    }

    #[tokio::test]
    async fn no_events_is_no_interruption() {
        let server = scheduled_events(json!({"DocumentIncarnation": 1, "Events": []})).await;

        let checker = AzureChecker::with_base_url(server.uri()).unwrap();

        assert!(!checker.check_interrupt().await.unwrap());
    }

    #[tokio::test]
    async fn other_events_are_no_interruption() {
        let server = scheduled_events(json!({
            "Events": [{"EventId": "A", "EventType": "Reboot"}],
        }))
        .await;

        let checker = AzureChecker::with_base_url(server.uri()).unwrap();

        assert!(!checker.check_interrupt().await.unwrap());
    }

    #[tokio::test]
    async fn unexpected_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let checker = AzureChecker::with_base_url(server.uri()).unwrap();

        assert!(matches!(
            checker.check_interrupt().await,
            Err(MetadataError::Status { .. })
        ));
    }

    #[tokio::test]
    async fn never_recommends_rebalance() {
        let checker = AzureChecker::with_base_url("http://127.0.0.1:9").unwrap();

        assert!(!checker.check_rebalance_recommendation().await.unwrap());
    }
}
