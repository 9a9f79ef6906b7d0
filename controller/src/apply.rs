//! Apply converges produced objects onto the live cluster.
//!
//! Convergence is create-or-replace rather than update: the payload shape is
//! user-controlled and may change immutable fields, so a drifted object is
//! validated with a dry-run create, deleted, and recreated by the next
//! event-driven sync.

use kube::{
    ResourceExt,
    api::{Api, DeleteParams, DynamicObject, PostParams},
};
use tracing::{debug, info, instrument};

use crate::{Error, LAST_APPLIED_ANNOTATION, Result};

/// FIELD_MANAGER is the manager recorded on created objects.
const FIELD_MANAGER: &str = "controller";

/// Apply converges one produced object through the resolved API.
///
/// An in-sync object (equal fingerprints) results in no writes at all.
#[instrument(skip(api, desired), fields(name = %desired.name_any()))]
pub async fn apply(
    api: &Api<DynamicObject>,
    desired: &DynamicObject,
    controller_name: &str,
) -> Result<()> {
    let name = desired.name_any();

    let existing = api.get_opt(&name).await?;
    let Some(existing) = existing else {
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.into()),
        };
        api.create(&params, desired).await.map_err(|source| {
            Error::Apply {
                name: name.clone(),
                source,
            }
        })?;
        info!("created object");
        return Ok(());
    };

    if fingerprint(&existing) == fingerprint(desired) {
        debug!("object already up to date");
        return Ok(());
    }

    // Dry-run validates the replacement before the existing object goes away.
    let dry_run = PostParams {
        dry_run: true,
        field_manager: Some(controller_name.to_string()),
    };
    api.create(&dry_run, desired)
        .await
        .map_err(|source| Error::Validation {
            name: name.clone(),
            source,
        })?;

    api.delete(&name, &DeleteParams::default())
        .await
        .map_err(|source| Error::Apply {
            name: name.clone(),
            source,
        })?;
    info!("replaced object; recreation follows on the next sync");
    Ok(())
}

/// Fingerprint reads the applied-configuration annotation off an object.
fn fingerprint(object: &DynamicObject) -> Option<&str> {
    object
        .annotations()
        .get(LAST_APPLIED_ANNOTATION.as_str())
        .map(String::as_str)
}
