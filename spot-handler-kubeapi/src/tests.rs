use serde_json::Value;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;

use k8s::NodeExt as _;
use k8s::ObjectMetaExt as _;
use k8s::metav1;

use super::*;

const NODE_PATH: &str = "/api/v1/nodes/AI";
const FAST: Backoff = Backoff::constant(5, Duration::from_millis(5));

fn node() -> corev1::Node {
    corev1::Node {
        metadata: metav1::ObjectMeta::new("AI")
            .label(k8s::NODE_ID_LABEL, "CAST")
            .label("kubernetes.io/hostname", "ai"),
        spec: Some(corev1::NodeSpec {
            provider_id: Some("azure:///subscriptions/x/vm-1".to_string()),
            ..k8s::default()
        }),
        ..k8s::default()
    }
}

fn kubeapi(server: &MockServer) -> KubeApi {
    let config = kube::Config::new(server.uri().parse().unwrap());
    let client = kube::Client::try_from(config).unwrap();
    KubeApi::with_client(client).with_patch_backoff(FAST)
}

async fn patch_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.method.as_str() == "PATCH")
        .map(|request| request.body_json().unwrap())
        .collect()
}

#[test]
fn merge_patch_of_identical_documents_is_empty() {
    let doc = json!({"metadata": {"name": "AI"}, "spec": {"taints": []}});
    assert_eq!(two_way_merge(&doc, &doc), json!({}));
}

#[test]
fn merge_patch_nulls_removed_keys_and_replaces_arrays() {
    let original = json!({
        "metadata": {"labels": {"a": "1", "b": "2"}},
        "spec": {"taints": [{"key": "x", "effect": "NoExecute"}]}
    });
    let modified = json!({
        "metadata": {"labels": {"a": "1", "c": "3"}},
        "spec": {"taints": [{"key": "x", "effect": "NoExecute"}, {"key": "y", "effect": "NoSchedule"}]}
    });

    let patch = two_way_merge(&original, &modified);

    assert_eq!(
        patch,
        json!({
            "metadata": {"labels": {"b": null, "c": "3"}},
            "spec": {"taints": [{"key": "x", "effect": "NoExecute"}, {"key": "y", "effect": "NoSchedule"}]}
        })
    );

    let mut applied = original.clone();
    json_patch::merge(&mut applied, &patch);
    assert_eq!(applied, modified);
}

#[test]
fn draining_patch_touches_only_drain_fields() {
    let node = node();
    let mut drained = node.clone();
    drained.mark_draining(k8s::DRAINING_REASON_INTERRUPTED);

    let original = serde_json::to_value(&node).unwrap();
    let patch = two_way_merge(&original, &serde_json::to_value(&drained).unwrap());

    assert_eq!(
        patch,
        json!({
            "metadata": {"labels": {(k8s::DRAINING_LABEL): k8s::DRAINING_REASON_INTERRUPTED}},
            "spec": {
                "unschedulable": true,
                "taints": [{"key": k8s::DRAINING_TAINT_KEY, "value": "true", "effect": "NoSchedule"}]
            }
        })
    );
}

#[tokio::test]
async fn get_node_reads_by_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(NODE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(node()))
        .expect(1)
        .mount(&server)
        .await;

    let node = kubeapi(&server).get_node("AI").await.unwrap();

    assert_eq!(node.node_id(), Some("CAST"));
}

#[tokio::test]
async fn get_node_failure_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(NODE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    assert!(kubeapi(&server).get_node("AI").await.is_err());
}

#[tokio::test]
async fn patch_node_submits_strategic_merge_diff() {
    let server = MockServer::start().await;
    let node = node();
    let mut drained = node.clone();
    drained.mark_draining(k8s::DRAINING_REASON_INTERRUPTED);
    Mock::given(method("PATCH"))
        .and(path(NODE_PATH))
        .and(header("content-type", "application/strategic-merge-patch+json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&drained))
        .expect(1)
        .mount(&server)
        .await;

    let patched = kubeapi(&server)
        .patch_node(&node, |node| node.mark_draining(k8s::DRAINING_REASON_INTERRUPTED))
        .await
        .unwrap();

    assert!(patched.is_unschedulable());
    let bodies = patch_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    let mut applied = serde_json::to_value(&node).unwrap();
    json_patch::merge(&mut applied, &bodies[0]);
    assert_eq!(applied, serde_json::to_value(&drained).unwrap());
    assert!(bodies[0]["metadata"].get("name").is_none());
}

#[tokio::test]
async fn patch_node_retries_failed_submissions() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(NODE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(NODE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(node()))
        .expect(1)
        .mount(&server)
        .await;

    let result = kubeapi(&server)
        .patch_node(&node(), |node| node.mark_draining(k8s::DRAINING_REASON_INTERRUPTED))
        .await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn patch_node_gives_up_after_five_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(NODE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&server)
        .await;

    let err = kubeapi(&server)
        .patch_node(&node(), |node| node.mark_draining(k8s::DRAINING_REASON_INTERRUPTED))
        .await
        .unwrap_err();

    assert!(matches!(err, NodePatchError::Patch(_)));
    assert!(err.to_string().starts_with("patching node"));
}

#[tokio::test]
async fn patch_node_skips_empty_diff() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200).set_body_json(node()))
        .expect(0)
        .mount(&server)
        .await;

    let node = node();
    let unchanged = kubeapi(&server).patch_node(&node, |_| {}).await.unwrap();

    assert_eq!(unchanged, node);
}
