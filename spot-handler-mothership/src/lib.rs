use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header;
use serde::Deserialize;
use serde::Serialize;
use spot_handler_ext as k8s;

use k8s::Backoff;
use k8s::NodeExt as _;
use k8s::corev1;

const API_KEY_HEADER: &str = "X-API-Key";
const USER_AGENT: &str = concat!("castai-spot-handler/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF: Backoff = Backoff::constant(3, Duration::from_secs(1));

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Interrupted,
    RebalanceRecommendation,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => f.write_str("interrupted"),
            Self::RebalanceRecommendation => f.write_str("rebalanceRecommendation"),
        }
    }
}

/// Lifecycle event reported for a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEventRequest {
    pub event_type: EventType,
    /// Control-plane identifier of the node.
    pub node_id: String,
    /// Cloud instance identifier, omitted when the node has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl CloudEventRequest {
    pub fn for_node(event_type: EventType, node: &corev1::Node) -> Self {
        Self {
            event_type,
            node_id: node.node_id().unwrap_or_default().to_string(),
            provider_id: node.provider_id().map(ToString::to_string),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("building mothership client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("API key is not a valid header value")]
    InvalidApiKey,
    #[error("sending cloud event: {0}")]
    Request(#[source] reqwest::Error),
    #[error("sending cloud event: request error status_code={status} body={body}")]
    Status { status: StatusCode, body: String },
}

impl ReportError {
    /// Transport failures and server errors are worth another attempt, client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Status { status, .. } => status.is_server_error(),
            Self::Client(_) | Self::InvalidApiKey => false,
        }
    }
}

#[async_trait]
pub trait CloudEventReporter: Debug + Send + Sync {
    async fn send_cloud_event(&self, request: &CloudEventRequest) -> Result<(), ReportError>;

    /// Longest a single `send_cloud_event` call can take, retries included.
    fn budget(&self) -> Duration;
}

#[derive(Clone)]
pub struct MothershipConfig {
    pub url: String,
    pub api_key: String,
    pub cluster_id: String,
    /// PEM encoded CA certificate trusted in addition to the system roots.
    pub ca_cert: Option<Vec<u8>>,
    /// Timeout of a single attempt.
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl MothershipConfig {
    pub fn new(url: impl ToString, api_key: impl ToString, cluster_id: impl ToString) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
            cluster_id: cluster_id.to_string(),
            ca_cert: None,
            timeout: DEFAULT_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl Debug for MothershipConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MothershipConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("cluster_id", &self.cluster_id)
            .field("ca_cert", &self.ca_cert.as_ref().map(|_| "<pem>"))
            .field("timeout", &self.timeout)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Reports cloud events to `POST /v1/kubernetes/external-clusters/{cluster}/events`.
#[derive(Debug)]
pub struct MothershipClient {
    client: reqwest::Client,
    events_url: String,
    timeout: Duration,
    backoff: Backoff,
}

impl MothershipClient {
    pub fn new(config: &MothershipConfig) -> Result<Self, ReportError> {
        let mut api_key =
            header::HeaderValue::from_str(&config.api_key).map_err(|_| ReportError::InvalidApiKey)?;
        api_key.set_sensitive(true);
        let mut headers = header::HeaderMap::new();
        headers.insert(API_KEY_HEADER, api_key);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(config.timeout);
        if let Some(pem) = &config.ca_cert {
            let certificate = reqwest::Certificate::from_pem(pem).map_err(ReportError::Client)?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder.build().map_err(ReportError::Client)?;

        let events_url = format!(
            "{}/v1/kubernetes/external-clusters/{}/events",
            config.url.trim_end_matches('/'),
            config.cluster_id
        );

        Ok(Self {
            client,
            events_url,
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    async fn post(&self, request: &CloudEventRequest) -> Result<(), ReportError> {
        let response = self
            .client
            .post(&self.events_url)
            .json(request)
            .send()
            .await
            .map_err(ReportError::Request)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ReportError::Status { status, body })
    }
}

#[async_trait]
impl CloudEventReporter for MothershipClient {
    async fn send_cloud_event(&self, request: &CloudEventRequest) -> Result<(), ReportError> {
        tracing::debug!(
            event_type = %request.event_type,
            node_id = %request.node_id,
            provider_id = ?request.provider_id,
            "Sending cloud event"
        );
        self.backoff
            .retry_if("send cloud event", ReportError::is_retryable, move || {
                self.post(request)
            })
            .await
    }

    fn budget(&self) -> Duration {
        self.backoff.budget(self.timeout)
    }
}
