pub use k8s_openapi as openapi;
pub use k8s_openapi::api::core::v1 as corev1;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

pub use backoff::Backoff;
pub use time::ParseDurationError;
pub use time::parse_duration;

use std::collections::BTreeMap;

mod backoff;
mod time;

/// Label carrying the control-plane identifier of the node.
pub const NODE_ID_LABEL: &str = "provisioner.cast.ai/node-id";

/// Annotation overriding `spec.providerID` when reporting the instance identifier.
pub const PROVIDER_ID_ANNOTATION: &str = "provisioner.cast.ai/provider-id";

pub const DRAINING_LABEL: &str = "autoscaling.cast.ai/draining";
pub const DRAINING_REASON_INTERRUPTED: &str = "spot-interruption";
pub const DRAINING_TAINT_KEY: &str = "autoscaling.cast.ai/draining";
pub const DRAINING_TAINT_VALUE: &str = "true";
pub const DRAINING_TAINT_EFFECT: &str = "NoSchedule";

pub trait NodeExt {
    fn node_id(&self) -> Option<&str>;
    fn provider_id(&self) -> Option<&str>;
    fn is_unschedulable(&self) -> bool;
    fn has_taint(&self, key: &str) -> bool;
    fn mark_draining(&mut self, reason: &str);
}

impl NodeExt for corev1::Node {
    fn node_id(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()?
            .get(NODE_ID_LABEL)
            .map(String::as_str)
    }

    /// Resolves the cloud instance identifier of the node.
    ///
    /// The [`PROVIDER_ID_ANNOTATION`] annotation takes precedence over `spec.providerID`.
    /// Empty values count as absent.
    fn provider_id(&self) -> Option<&str> {
        let annotated = self
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(PROVIDER_ID_ANNOTATION))
            .map(String::as_str)
            .filter(|id| !id.is_empty());

        annotated.or_else(|| {
            self.spec
                .as_ref()?
                .provider_id
                .as_deref()
                .filter(|id| !id.is_empty())
        })
    }

    fn is_unschedulable(&self) -> bool {
        self.spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
    }

    fn has_taint(&self, key: &str) -> bool {
        self.spec
            .as_ref()
            .and_then(|spec| spec.taints.as_ref())
            .is_some_and(|taints| taints.iter().any(|taint| taint.key == key))
    }

    /// Cordons the node, labels it with the draining `reason` and adds the draining taint.
    ///
    /// The taint is only appended when no taint with the same key is present.
    fn mark_draining(&mut self, reason: &str) {
        let tainted = self.has_taint(DRAINING_TAINT_KEY);
        let spec = self.spec.get_or_insert_with(default);
        spec.unschedulable = Some(true);
        if !tainted {
            spec.taints
                .get_or_insert_with(Vec::new)
                .push(corev1::Taint::draining());
        }

        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(DRAINING_LABEL.to_string(), reason.to_string());
    }
}

pub trait TaintExt {
    fn draining() -> Self;
}

impl TaintExt for corev1::Taint {
    fn draining() -> Self {
        Self {
            key: DRAINING_TAINT_KEY.to_string(),
            value: Some(DRAINING_TAINT_VALUE.to_string()),
            effect: DRAINING_TAINT_EFFECT.to_string(),
            ..default()
        }
    }
}

pub trait ObjectMetaExt {
    fn new(name: impl ToString) -> Self;
    fn label(self, key: impl ToString, value: impl ToString) -> Self;
    fn annotation(self, key: impl ToString, value: impl ToString) -> Self;
}

impl ObjectMetaExt for metav1::ObjectMeta {
    fn new(name: impl ToString) -> Self {
        let name = Some(name.to_string());
        Self { name, ..default() }
    }

    fn label(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    fn annotation(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }
}

pub fn default<T: Default>() -> T {
    T::default()
}
