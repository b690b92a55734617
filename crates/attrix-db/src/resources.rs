//! Reference-counted ephemeral preview resources.
//!
//! A resource is created with one reference by [`ResourceRegistry::acquire`]
//! and its bytes are dropped when [`ResourceRegistry::release`] takes the
//! count to zero. Counts are mutated under a single mutex so concurrent
//! deletes cannot double-free or resurrect an entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, warn};

use attrix_core::{Error, ResourceRef, Result};

/// Image bytes plus their MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewResource {
    pub data: Bytes,
    pub mime_type: String,
}

struct Entry {
    resource: PreviewResource,
    ref_count: usize,
}

/// Shared registry of preview resources. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    entries: Arc<Mutex<HashMap<ResourceRef, Entry>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceRef, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new resource with a reference count of one.
    pub fn acquire(&self, data: impl Into<Bytes>, mime_type: impl Into<String>) -> ResourceRef {
        let resource_ref = ResourceRef::new();
        let resource = PreviewResource {
            data: data.into(),
            mime_type: mime_type.into(),
        };
        debug!(resource_ref = %resource_ref, size = resource.data.len(), "Resource acquired");
        self.lock().insert(
            resource_ref,
            Entry {
                resource,
                ref_count: 1,
            },
        );
        resource_ref
    }

    /// Add a reference to a live resource. Returns the new count.
    pub fn retain(&self, resource_ref: &ResourceRef) -> Result<usize> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(resource_ref)
            .ok_or(Error::UnknownResource(*resource_ref))?;
        entry.ref_count += 1;
        Ok(entry.ref_count)
    }

    /// Drop one reference. Returns `true` when this call freed the resource.
    ///
    /// Releasing an unknown (or already freed) reference is an error, so a
    /// double release is visible to the caller.
    pub fn release(&self, resource_ref: &ResourceRef) -> Result<bool> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(resource_ref) else {
            warn!(resource_ref = %resource_ref, "Release of unknown resource");
            return Err(Error::UnknownResource(*resource_ref));
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(false);
        }
        entries.remove(resource_ref);
        debug!(resource_ref = %resource_ref, "Resource freed");
        Ok(true)
    }

    /// Cheap clone of the resource, if still live.
    pub fn get(&self, resource_ref: &ResourceRef) -> Option<PreviewResource> {
        self.lock().get(resource_ref).map(|e| e.resource.clone())
    }

    pub fn contains(&self, resource_ref: &ResourceRef) -> bool {
        self.lock().contains_key(resource_ref)
    }

    pub fn ref_count(&self, resource_ref: &ResourceRef) -> Option<usize> {
        self.lock().get(resource_ref).map(|e| e.ref_count)
    }

    /// Number of live resources.
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Free every resource regardless of count. Returns how many were freed.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let freed = entries.len();
        entries.clear();
        freed
    }
}
