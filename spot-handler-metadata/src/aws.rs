use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::*;

const IMDS_URL: &str = "http://169.254.169.254";

const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// A cached token is replaced this long before IMDS expires it.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// How long lookups go without a token after IMDSv2 refused to issue one.
const TOKEN_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

const INSTANCE_ACTION_PATH: &str = "/latest/meta-data/spot/instance-action";
const REBALANCE_RECOMMENDATION_PATH: &str = "/latest/meta-data/events/recommendations/rebalance";

/// Spot interruption notice, e.g. `{"action": "terminate", "time": "2017-09-18T08:22:00Z"}`.
#[derive(Debug, Deserialize)]
struct InstanceAction {
    action: String,
    time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RebalanceRecommendation {
    notice_time: String,
}

/// Outcome of the last token request, `None` meaning IMDSv1.
struct CachedToken {
    value: Option<String>,
    expires: Instant,
}

impl Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("value", &self.value.as_ref().map(|_| "<redacted>"))
            .field("expires", &self.expires)
            .finish()
    }
}

/// Reads spot instance-action and rebalance-recommendation notices from EC2 instance metadata.
///
/// The IMDSv2 session token is reused until shortly before it expires. When no token
/// can be obtained lookups proceed without one, which IMDSv1 accepts, and a new token
/// is only asked for after [`TOKEN_RETRY_INTERVAL`].
#[derive(Debug)]
pub struct AwsChecker {
    client: reqwest::Client,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl AwsChecker {
    pub fn new() -> Result<Self, MetadataError> {
        Self::with_base_url(IMDS_URL)
    }

    pub fn with_base_url(url: impl Into<String>) -> Result<Self, MetadataError> {
        Ok(Self {
            client: client()?,
            base_url: base_url(url),
            token: Mutex::new(None),
        })
    }

    async fn token(&self) -> Option<String> {
        let mut cached = self.token.lock().await;
        let now = Instant::now();
        if let Some(token) = cached.as_ref().filter(|token| token.expires > now) {
            return token.value.clone();
        }

        let value = self.request_token().await;
        let lifetime = if value.is_some() {
            TOKEN_TTL - TOKEN_REFRESH_MARGIN
        } else {
            TOKEN_RETRY_INTERVAL
        };
        *cached = Some(CachedToken {
            value: value.clone(),
            expires: now + lifetime,
        });
        value
    }

    async fn request_token(&self) -> Option<String> {
        let url = format!("{}{TOKEN_PATH}", self.base_url);
        let response = self
            .client
            .put(&url)
            .header(TOKEN_TTL_HEADER, TOKEN_TTL.as_secs())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match response {
            Ok(response) => response.text().await.ok(),
            Err(err) => {
                tracing::debug!(%err, "IMDSv2 token unavailable, falling back to IMDSv1");
                None
            }
        }
    }

    /// Fetches a metadata document, where a missing document means there is no notice.
    async fn document<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, MetadataError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(token) = self.token().await {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = send(request, &url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|source| MetadataError::Decode { url, source }),
            status => Err(MetadataError::Status { url, status }),
        }
    }
}

#[async_trait]
impl MetadataChecker for AwsChecker {
    async fn check_interrupt(&self) -> Result<bool, MetadataError> {
        let action = self.document::<InstanceAction>(INSTANCE_ACTION_PATH).await?;
        if let Some(InstanceAction { action, time }) = &action {
            tracing::info!(action = %action, time = %time, "Spot instance action scheduled");
        }
        Ok(action.is_some())
    }

    async fn check_rebalance_recommendation(&self) -> Result<bool, MetadataError> {
        let recommendation = self
            .document::<RebalanceRecommendation>(REBALANCE_RECOMMENDATION_PATH)
            .await?;
        if let Some(RebalanceRecommendation { notice_time }) = &recommendation {
            tracing::info!(notice_time = %notice_time, "Rebalance recommendation issued");
        }
        Ok(recommendation.is_some())
    }
}
