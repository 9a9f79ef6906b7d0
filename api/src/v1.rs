//! Module `v1` implements the v1 Overlay CRD API.
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1";

/// OverlaySpec carries the user-supplied partial object tree.
///
/// The payload is deliberately schemaless: whatever shape the user supplies
/// is merged onto the source template at reconcile time.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "kubeforge.sh",
    version = "v1",
    kind = "Overlay",
    namespaced,
    plural = "overlays",
    status = "OverlayStatus",
    derive = "Default",
    derive = "PartialEq"
)]
pub struct OverlaySpec {
    /// Data is the partial tree merged onto the source template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// OverlayStatus mirrors the spec's payload shape. The controller reads but
/// never writes it.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct OverlayStatus {
    /// Data is the observed payload, if any writer records one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use kube::Resource;
    use serde_json::json;

    use super::*;

    #[test]
    fn group_version_kind() {
        assert_eq!(Overlay::group(&()), crate::GROUP);
        assert_eq!(Overlay::version(&()), VERSION);
        assert_eq!(Overlay::kind(&()), "Overlay");
        assert_eq!(Overlay::plural(&()), "overlays");
        assert_eq!(Overlay::api_version(&()), "kubeforge.sh/v1");
    }

    #[test]
    fn payload_round_trip() {
        let o = Overlay::new(
            "sample",
            OverlaySpec {
                data: Some(json!({"pods": [{"name": "p1", "image": "nginx"}]})),
            },
        );
        let buf = serde_json::to_string(&o).expect("serialize overlay");
        assert!(buf.contains(r#""kind":"Overlay""#));
        let back: Overlay = serde_json::from_str(&buf).expect("deserialize overlay");
        assert_eq!(back.spec, o.spec);
    }
}
