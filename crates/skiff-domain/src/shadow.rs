use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Document ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ShadowState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Value>,
}

/// A per-name device shadow. `version` increases by exactly one on every
/// accepted update; the delta is whatever part of `desired` the device has
/// not yet acknowledged via `reported`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowDocument {
    pub state: ShadowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

impl ShadowDocument {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: ShadowState::default(),
            metadata: None,
            version: 0,
            timestamp: now,
            client_token: None,
        }
    }

    /// Merge a desired-state patch (cloud side of the document). Recomputes
    /// the delta against what the device last reported.
    pub fn update_desired(&mut self, patch: &Value, now: DateTime<Utc>) {
        let mut desired = self.state.desired.take().unwrap_or(Value::Object(Default::default()));
        merge_patch(&mut desired, patch);
        self.state.desired = Some(desired);
        self.refresh_delta();
        self.version += 1;
        self.timestamp = now;
    }

    /// Merge a reported-state patch (device acknowledgement). Any reported
    /// value that now matches desired clears the corresponding delta entry.
    pub fn update_reported(&mut self, patch: &Value, now: DateTime<Utc>) {
        let mut reported = self.state.reported.take().unwrap_or(Value::Object(Default::default()));
        merge_patch(&mut reported, patch);
        self.state.reported = Some(reported);
        self.refresh_delta();
        self.version += 1;
        self.timestamp = now;
    }

    fn refresh_delta(&mut self) {
        self.state.delta = match (&self.state.desired, &self.state.reported) {
            (Some(desired), Some(reported)) => compute_delta(desired, reported),
            (Some(desired), None) => Some(desired.clone()),
            _ => None,
        };
    }
}

/// RFC-7386-style merge: object keys merge recursively, `null` removes,
/// everything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            let map = target.as_object_mut().unwrap();
            for (k, v) in patch_map {
                if v.is_null() {
                    map.remove(k);
                } else if v.is_object() {
                    let entry = map.entry(k.clone()).or_insert(Value::Object(Default::default()));
                    merge_patch(entry, v);
                } else {
                    map.insert(k.clone(), v.clone());
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// The subset of `desired` not matched by `reported`. `None` when the device
/// has fully converged.
fn compute_delta(desired: &Value, reported: &Value) -> Option<Value> {
    match (desired, reported) {
        (Value::Object(d), Value::Object(r)) => {
            let mut delta = serde_json::Map::new();
            for (k, dv) in d {
                match r.get(k) {
                    Some(rv) => {
                        if let Some(sub) = compute_delta(dv, rv) {
                            delta.insert(k.clone(), sub);
                        }
                    }
                    None => {
                        delta.insert(k.clone(), dv.clone());
                    }
                }
            }
            if delta.is_empty() { None } else { Some(Value::Object(delta)) }
        }
        (d, r) if d == r => None,
        (d, _) => Some(d.clone()),
    }
}

// ── Topics ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowOp {
    Get,
    Update,
    Delete,
}

impl ShadowOp {
    fn as_str(&self) -> &'static str {
        match self {
            ShadowOp::Get => "get",
            ShadowOp::Update => "update",
            ShadowOp::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowResult {
    Accepted,
    Rejected,
    Documents,
    Delta,
}

impl ShadowResult {
    fn as_str(&self) -> &'static str {
        match self {
            ShadowResult::Accepted => "accepted",
            ShadowResult::Rejected => "rejected",
            ShadowResult::Documents => "documents",
            ShadowResult::Delta => "delta",
        }
    }
}

/// Build a shadow topic:
/// `$iot/device/{uuid}/shadow/name/{shadow}/{op}[/{result}]`.
pub fn shadow_topic(
    uuid: &str,
    shadow_name: &str,
    op: ShadowOp,
    result: Option<ShadowResult>,
) -> String {
    match result {
        Some(r) => format!(
            "$iot/device/{}/shadow/name/{}/{}/{}",
            uuid,
            shadow_name,
            op.as_str(),
            r.as_str()
        ),
        None => format!(
            "$iot/device/{}/shadow/name/{}/{}",
            uuid,
            shadow_name,
            op.as_str()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_is_monotonic_across_updates() {
        let mut doc = ShadowDocument::new(Utc::now());
        doc.update_desired(&json!({"led": "on"}), Utc::now());
        doc.update_desired(&json!({"fan": 2}), Utc::now());
        doc.update_reported(&json!({"led": "on"}), Utc::now());
        assert_eq!(doc.version, 3);
    }

    #[test]
    fn acknowledged_report_clears_delta() {
        let mut doc = ShadowDocument::new(Utc::now());
        doc.update_desired(&json!({"led": "on", "fan": 2}), Utc::now());
        assert_eq!(doc.state.delta, Some(json!({"led": "on", "fan": 2})));

        doc.update_reported(&json!({"led": "on"}), Utc::now());
        assert_eq!(doc.state.delta, Some(json!({"fan": 2})));

        doc.update_reported(&json!({"fan": 2}), Utc::now());
        assert!(doc.state.delta.is_none());
    }

    #[test]
    fn null_in_patch_removes_key() {
        let mut doc = ShadowDocument::new(Utc::now());
        doc.update_desired(&json!({"led": "on"}), Utc::now());
        doc.update_desired(&json!({"led": null}), Utc::now());
        assert_eq!(doc.state.desired, Some(json!({})));
    }

    #[test]
    fn nested_objects_diff_recursively() {
        let mut doc = ShadowDocument::new(Utc::now());
        doc.update_desired(&json!({"pump": {"speed": 3, "mode": "auto"}}), Utc::now());
        doc.update_reported(&json!({"pump": {"mode": "auto"}}), Utc::now());
        assert_eq!(doc.state.delta, Some(json!({"pump": {"speed": 3}})));
    }

    #[test]
    fn topic_grammar() {
        assert_eq!(
            shadow_topic("u-1", "main", ShadowOp::Update, Some(ShadowResult::Delta)),
            "$iot/device/u-1/shadow/name/main/update/delta"
        );
        assert_eq!(
            shadow_topic("u-1", "main", ShadowOp::Get, None),
            "$iot/device/u-1/shadow/name/main/get"
        );
    }
}
