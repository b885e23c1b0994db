use std::path::PathBuf;

use clap::Parser;
use clap::builder::NonEmptyStringValueParser;
use spot_handler_metadata::Provider;
use spot_handler_mothership::MothershipConfig;
use tracing_subscriber::EnvFilter;

use crate::handler::InterruptionPolicy;

use super::*;

#[derive(Debug, thiserror::Error)]
#[error("reading CA certificate {}: {source}", .path.display())]
pub(crate) struct CaCertError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

/// Agent configuration, taken from flags or the environment.
#[derive(Parser)]
#[command(version, about = "Reports spot interruptions of this node and cordons it")]
pub(crate) struct Config {
    #[arg(long, env = "CLUSTER_ID", value_parser = NonEmptyStringValueParser::new())]
    pub(crate) cluster_id: String,

    #[arg(long, env = "API_URL", value_parser = NonEmptyStringValueParser::new())]
    pub(crate) api_url: String,

    #[arg(
        long,
        env = "API_KEY",
        hide_env_values = true,
        value_parser = NonEmptyStringValueParser::new()
    )]
    pub(crate) api_key: String,

    /// PEM file with an additional CA trusted for the mothership API.
    #[arg(long, env = "TLS_CA_CERT_FILE", value_hint = clap::ValueHint::FilePath)]
    pub(crate) tls_ca_cert_file: Option<PathBuf>,

    /// Name of the Kubernetes node this agent runs on.
    #[arg(long, env = "NODE_NAME", value_parser = NonEmptyStringValueParser::new())]
    pub(crate) node_name: String,

    /// Cloud provider whose metadata service is polled: aws, azure or gcp.
    #[arg(long, env = "PROVIDER")]
    pub(crate) provider: Provider,

    #[arg(
        long,
        env = "POLL_INTERVAL_SECONDS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub(crate) poll_interval_seconds: u64,

    /// How long to keep polling after a shutdown signal, e.g. `30s`.
    #[arg(long, env = "GRACE_PERIOD", default_value = "30s", value_parser = k8s::parse_duration)]
    pub(crate) grace_period: Duration,

    /// Timeout of a single mothership request, e.g. `5s`.
    #[arg(long, env = "API_TIMEOUT", default_value = "5s", value_parser = k8s::parse_duration)]
    pub(crate) api_timeout: Duration,

    #[arg(
        long,
        env = "INTERRUPTION_POLICY",
        value_enum,
        default_value_t = InterruptionPolicy::StopOnDetection
    )]
    pub(crate) interruption_policy: InterruptionPolicy,

    /// Port of the debug HTTP server. Disabled when unset.
    #[arg(long, env = "DEBUG_PORT")]
    pub(crate) debug_port: Option<u16>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub(crate) log_level: String,
}

impl Config {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub(crate) fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }

    pub(crate) fn mothership(&self) -> Result<MothershipConfig, CaCertError> {
        let ca_cert = self
            .tls_ca_cert_file
            .as_ref()
            .map(|path| {
                std::fs::read(path).map_err(|source| CaCertError {
                    path: path.clone(),
                    source,
                })
            })
            .transpose()?;

        Ok(MothershipConfig {
            ca_cert,
            timeout: self.api_timeout,
            ..MothershipConfig::new(&self.api_url, &self.api_key, &self.cluster_id)
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("cluster_id", &self.cluster_id)
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("tls_ca_cert_file", &self.tls_ca_cert_file)
            .field("node_name", &self.node_name)
            .field("provider", &self.provider)
            .field("poll_interval_seconds", &self.poll_interval_seconds)
            .field("grace_period", &self.grace_period)
            .field("api_timeout", &self.api_timeout)
            .field("interruption_policy", &self.interruption_policy)
            .field("debug_port", &self.debug_port)
            .field("log_level", &self.log_level)
            .finish()
    }
}
