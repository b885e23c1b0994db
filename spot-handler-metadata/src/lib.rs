use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

pub use aws::AwsChecker;
pub use azure::AzureChecker;
pub use gcp::GcpChecker;

mod aws;
mod azure;
mod gcp;

/// Upper bound for a single metadata request. The caller polls again soon anyway.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("building metadata client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("requesting {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("received unexpected status code {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("decoding {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Answers whether the cloud announced the end of this instance.
///
/// `Ok(false)` is the steady state. Errors mean the metadata source could not be read
/// and the question should be asked again on the next poll.
#[async_trait]
pub trait MetadataChecker: Debug + Send + Sync {
    async fn check_interrupt(&self) -> Result<bool, MetadataError>;

    async fn check_rebalance_recommendation(&self) -> Result<bool, MetadataError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
}

impl Provider {
    /// Builds the metadata checker for this provider against its well-known endpoint.
    pub fn checker(self) -> Result<Box<dyn MetadataChecker>, MetadataError> {
        let checker: Box<dyn MetadataChecker> = match self {
            Self::Aws => Box::new(AwsChecker::new()?),
            Self::Azure => Box::new(AzureChecker::new()?),
            Self::Gcp => Box::new(GcpChecker::new()?),
        };
        Ok(checker)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provider {0:?}, expected one of aws, azure, gcp")]
pub struct UnknownProvider(String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

fn client() -> Result<reqwest::Client, MetadataError> {
    reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .no_proxy()
        .build()
        .map_err(MetadataError::Client)
}

fn base_url(url: impl Into<String>) -> String {
    url.into().trim_end_matches('/').to_string()
}

async fn send(request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response, MetadataError> {
    request.send().await.map_err(|source| MetadataError::Request {
        url: url.to_string(),
        source,
    })
}
