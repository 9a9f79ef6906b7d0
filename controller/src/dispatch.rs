//! Dispatch translates watch deliveries into work-queue items.
//!
//! Dependent-resource events drive convergence back on the owning Overlay,
//! not on the dependent itself, so reconciliation stays idempotent at the
//! Overlay grain.

use std::{collections::HashMap, sync::Mutex};

use kube::{
    ResourceExt,
    api::DynamicObject,
    runtime::reflector::{ObjectRef, Store},
};
use tracing::{debug, trace};

use api::v1::Overlay;

use crate::{OverlayKey, overlay_kind, queue::RateLimitingQueue};

/// Dispatcher feeds the work queue from Overlay and dependent watch events.
pub struct Dispatcher {
    queue: RateLimitingQueue<OverlayKey>,
    overlays: Store<Overlay>,
    versions: Mutex<HashMap<String, String>>,
}

impl Dispatcher {
    /// New wires the dispatcher to the queue and the Overlay cache.
    pub fn new(queue: RateLimitingQueue<OverlayKey>, overlays: Store<Overlay>) -> Self {
        Self {
            queue,
            overlays,
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue adds the Overlay's own key. Every Overlay delivery lands here,
    /// unfiltered.
    pub fn enqueue(&self, overlay: &Overlay) {
        self.queue.add(OverlayKey::from(overlay));
    }

    /// Observe_dependent routes one delivered dependent object, dropping
    /// redeliveries whose resourceVersion is unchanged.
    pub fn observe_dependent(&self, object: &DynamicObject) {
        let id = identity(object);
        let version = object.resource_version().unwrap_or_default();
        {
            let mut versions = self.versions.lock().expect("version memory poisoned");
            if versions.get(&id).is_some_and(|seen| *seen == version) {
                trace!(object = %object.name_any(), "resourceVersion unchanged, skipping");
                return;
            }
            versions.insert(id, version);
        }
        self.handle_object(object);
    }

    /// Observe_dependent_delete drops the version memory for a deleted
    /// object and routes it.
    pub fn observe_dependent_delete(&self, object: &DynamicObject) {
        self.versions
            .lock()
            .expect("version memory poisoned")
            .remove(&identity(object));
        self.handle_object(object);
    }

    /// Handle_object walks an object's controller owner reference to the
    /// owning Overlay and enqueues it. Objects without an appropriate owner
    /// are skipped.
    pub fn handle_object(&self, object: &DynamicObject) {
        let Some(owner) = object
            .owner_references()
            .iter()
            .find(|reference| reference.controller == Some(true))
        else {
            trace!(object = %object.name_any(), "no controller owner, skipping");
            return;
        };
        if owner.kind != overlay_kind() {
            trace!(object = %object.name_any(), owner = %owner.kind, "owner is not an Overlay, skipping");
            return;
        }
        let Some(namespace) = object.namespace() else {
            return;
        };

        let reference: ObjectRef<Overlay> = ObjectRef::new(&owner.name).within(&namespace);
        if self.overlays.get(&reference).is_none() {
            debug!(object = %object.name_any(), overlay = %owner.name, "ignoring orphaned object");
            return;
        }

        self.queue.add(OverlayKey::new(namespace, owner.name.clone()));
    }
}

/// Identity keys the resourceVersion memory; the uid when present, the
/// namespaced name otherwise.
fn identity(object: &DynamicObject) -> String {
    object.uid().unwrap_or_else(|| {
        format!(
            "{}/{}",
            object.namespace().unwrap_or_default(),
            object.name_any()
        )
    })
}
