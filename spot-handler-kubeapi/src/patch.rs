use serde_json::Map;
use serde_json::Value;

/// Computes a two-way merge patch that turns `original` into `modified`.
///
/// Objects are compared key by key. Removed keys become `null`, and changed or added
/// keys carry their new value, recursing into nested objects. Arrays and scalars are
/// replaced as a whole. Identical inputs yield an empty object.
///
/// # Examples
///
/// ```
/// # use serde_json::json;
/// let original = json!({"spec": {"unschedulable": false, "podCIDR": "10.0.0.0/24"}});
/// let modified = json!({"spec": {"unschedulable": true, "podCIDR": "10.0.0.0/24"}});
/// let patch = spot_handler_kubeapi::two_way_merge(&original, &modified);
/// assert_eq!(patch, json!({"spec": {"unschedulable": true}}));
/// ```
pub fn two_way_merge(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            Value::Object(diff_objects(original, modified))
        }
        _ => modified.clone(),
    }
}

fn diff_objects(original: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();

    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    for (key, new) in modified {
        match (original.get(key), new) {
            (Some(old), new) if old == new => {}
            (Some(Value::Object(old)), Value::Object(new)) => {
                patch.insert(key.clone(), Value::Object(diff_objects(old, new)));
            }
            (_, new) => {
                patch.insert(key.clone(), new.clone());
            }
        }
    }

    patch
}
