//! Discovery maps resource-kind strings to the API endpoints serving them.

use std::{collections::HashMap, sync::Mutex};

use kube::{
    Client, Discovery,
    discovery::{ApiCapabilities, ApiResource},
};
use tracing::trace;

use crate::{Error, Result};

/// Resolver turns a resource kind (`Pod`) or plural name (`pods`) into the
/// concrete endpoint serving it, sweeping cluster discovery on a miss.
///
/// Hits are cached for the process lifetime; correctness does not depend on
/// the cache.
pub struct Resolver {
    client: Client,
    cache: Mutex<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl Resolver {
    /// New creates a resolver backed by `client`.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve returns the resource whose kind or plural name equals
    /// `resource`, compared case-insensitively.
    pub async fn resolve(&self, resource: &str) -> Result<(ApiResource, ApiCapabilities)> {
        let wanted = resource.to_ascii_lowercase();
        {
            let cache = self.cache.lock().expect("resolver cache poisoned");
            if let Some(found) = cache.get(&wanted) {
                return Ok(found.clone());
            }
        }

        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    if serves(&ar, &wanted) {
                        trace!(
                            resource,
                            group = ar.group,
                            version = ar.version,
                            plural = ar.plural,
                            "resolved resource"
                        );
                        self.cache
                            .lock()
                            .expect("resolver cache poisoned")
                            .insert(wanted, (ar.clone(), caps.clone()));
                        return Ok((ar, caps));
                    }
                }
            }
        }
        Err(Error::Discovery(resource.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn with_cached(
        client: Client,
        entries: impl IntoIterator<Item = (String, (ApiResource, ApiCapabilities))>,
    ) -> Self {
        Self {
            client,
            cache: Mutex::new(entries.into_iter().collect()),
        }
    }
}

/// Serves reports whether `ar` answers for the lower-cased `wanted` name.
fn serves(ar: &ApiResource, wanted: &str) -> bool {
    ar.kind.eq_ignore_ascii_case(wanted) || ar.plural.eq_ignore_ascii_case(wanted)
}
