use std::fmt::Debug;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::version;
use kube::ResourceExt as _;
use kube::api;
use spot_handler_ext as k8s;

use k8s::Backoff;
use k8s::corev1;

pub use patch::two_way_merge;

mod patch;

/// Backoff applied to node patch submissions.
pub const PATCH_BACKOFF: Backoff = Backoff::constant(5, Duration::from_secs(1));

const SERVER_VERSION_BACKOFF: Backoff = Backoff::constant(5, Duration::from_secs(1));

#[derive(Debug, thiserror::Error)]
pub enum NodePatchError {
    #[error("serializing node: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("patching node: {0}")]
    Patch(#[source] kube::Error),
}

pub struct KubeApi {
    patch_params: api::PatchParams,
    patch_backoff: Backoff,
    client: kube::Client,
}

impl KubeApi {
    /// Create a KubeApi configured with a default Kubernetes client.
    ///
    /// The client configuration is inferred the usual kube way: `KUBECONFIG`,
    /// the local kubeconfig file or the in-cluster service account.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn run() -> Result<(), kube::Error> {
    /// let api = spot_handler_kubeapi::KubeApi::new().await?;
    /// let node = api.get_node("node-1").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new() -> kube::Result<Self> {
        kube::Client::try_default().await.map(Self::with_client)
    }

    /// Create a KubeApi backed by the provided Kubernetes client.
    pub fn with_client(client: kube::Client) -> Self {
        Self {
            patch_params: api::PatchParams::default(),
            patch_backoff: PATCH_BACKOFF,
            client,
        }
    }

    pub fn with_patch_backoff(self, patch_backoff: Backoff) -> Self {
        Self {
            patch_backoff,
            ..self
        }
    }

    /// Reads the Node called `name`. Failures are returned as is, without retrying.
    pub async fn get_node(&self, name: &str) -> kube::Result<corev1::Node> {
        self.nodes().get(name).await
    }

    /// Applies `change` to a copy of `node` and submits only the difference.
    ///
    /// Both snapshots are serialized and diffed into a merge patch, which is sent as a
    /// strategic merge patch. Fields other controllers changed in the meantime are
    /// left alone, because the whole object is never written back. Submission is retried
    /// according to the configured backoff. An empty diff submits nothing.
    ///
    /// Returns the node as stored by the API server after the patch.
    #[allow(tail_expr_drop_order)]
    pub async fn patch_node<F>(
        &self,
        node: &corev1::Node,
        change: F,
    ) -> Result<corev1::Node, NodePatchError>
    where
        F: FnOnce(&mut corev1::Node),
    {
        let original = serde_json::to_value(node)?;
        let mut modified = node.clone();
        change(&mut modified);
        let patch = two_way_merge(&original, &serde_json::to_value(&modified)?);

        let name = node.name_any();
        if patch.as_object().is_some_and(|patch| patch.is_empty()) {
            tracing::debug!(node = %name, "Nothing to patch");
            return Ok(modified);
        }

        tracing::debug!(node = %name, %patch, "Patching node");
        let nodes = &self.nodes();
        let name = name.as_str();
        let params = &self.patch_params;
        let patch = &api::Patch::Strategic(&patch);
        self.patch_backoff
            .retry("patch node", move || async move {
                nodes.patch(name, params, patch).await
            })
            .await
            .map_err(NodePatchError::Patch)
    }

    /// Fetches the API server version, retrying transient failures.
    pub async fn server_version(&self) -> kube::Result<version::Info> {
        let client = &self.client;
        SERVER_VERSION_BACKOFF
            .retry("get server version", move || client.apiserver_version())
            .await
    }

    fn nodes(&self) -> api::Api<corev1::Node> {
        api::Api::all(self.client.clone())
    }
}

impl Debug for KubeApi {
    /// Formats the `KubeApi` for debugging while redacting the `client`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeApi")
            .field("patch_params", &self.patch_params)
            .field("patch_backoff", &self.patch_backoff)
            .field("client", &"<kube::Client>")
            .finish()
    }
}

#[cfg(test)]
mod tests;
