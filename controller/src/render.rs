//! Render produces concrete Kubernetes objects from an Overlay and its
//! merged tree.

use std::sync::LazyLock;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, api::DynamicObject};
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use api::v1::Overlay;

use crate::{Error, LAST_APPLIED_ANNOTATION, OVERRIDE_NAME_ANNOTATION, Result};

/// Render walks the merged tree's top-level sequences and emits the ordered
/// `(resource key, object)` pairs handed to the applier.
///
/// Top-level values that are not sequences are skipped. Entries that cannot
/// be decoded into an object are logged and dropped; one bad entry does not
/// stop its siblings.
pub fn render(overlay: &Overlay, merged: &Value) -> Result<Vec<(String, DynamicObject)>> {
    let Some(tree) = merged.as_object() else {
        return Err(Error::Merge("merged document is not a mapping".into()));
    };
    let owner = owner_reference(overlay)?;
    let namespace = overlay.meta().namespace.as_deref();

    let mut objects = Vec::new();
    for (resource, value) in tree {
        let Some(entries) = value.as_array() else {
            continue;
        };
        for entry in entries {
            match materialize(entry, &owner, namespace) {
                Ok(object) => objects.push((resource.clone(), object)),
                Err(err) => {
                    warn!(%err, resource, "skipping undecodable object definition");
                }
            }
        }
    }
    Ok(objects)
}

/// Materialize turns one merged sequence entry into the object the applier
/// receives: namespace and owner stamped, fingerprint recorded, and the
/// override-name annotation honored.
fn materialize(
    entry: &Value,
    owner: &OwnerReference,
    namespace: Option<&str>,
) -> Result<DynamicObject> {
    let mut object: DynamicObject = serde_json::from_value(entry.clone())?;
    object.metadata.namespace = namespace.map(str::to_string);

    // The fingerprint snapshots the entry as merged, before any stamping.
    let fingerprint = serde_json::to_string(entry)?.replace('\n', " ");
    let annotations = object.metadata.annotations.get_or_insert_default();
    annotations.insert(LAST_APPLIED_ANNOTATION.clone(), fingerprint);

    object.metadata.owner_references = Some(vec![owner.clone()]);

    let override_name = object
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(OVERRIDE_NAME_ANNOTATION.as_str()))
        .filter(|name| !name.is_empty())
        .cloned();
    if let Some(name) = override_name {
        object.metadata.name = Some(name);
    }

    Ok(object)
}

/// Owner_reference builds the single controller reference every produced
/// object carries, pointing back at the triggering Overlay.
pub fn owner_reference(overlay: &Overlay) -> Result<OwnerReference> {
    let meta = overlay.meta();
    let name = meta.name.clone().ok_or(Error::MissingMetadata("name"))?;
    let uid = meta.uid.clone().ok_or(Error::MissingMetadata("uid"))?;
    Ok(OwnerReference {
        api_version: Overlay::api_version(&()).into_owned(),
        kind: owner_kind(overlay)?,
        name,
        uid,
        controller: Some(true),
        ..Default::default()
    })
}

/// Owner_kind reports the kind recorded on the owner reference.
///
/// The typed client always knows the Overlay kind; the textual scan recovers
/// it should the decoder ever hand back an empty one.
fn owner_kind(overlay: &Overlay) -> Result<String> {
    static KIND: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""kind":"([^"]+)""#).expect("kind pattern"));

    let kind = Overlay::kind(&());
    if !kind.is_empty() {
        return Ok(kind.into_owned());
    }
    let raw = serde_json::to_string(overlay)?;
    KIND.captures(&raw)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string())
        .ok_or(Error::MissingMetadata("kind"))
}
