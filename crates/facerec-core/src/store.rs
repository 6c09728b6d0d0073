//! Registry of known faces, persisted under a single key.
//!
//! Reads go through an in-memory snapshot populated on first use. Every write
//! replaces the snapshot under the same lock that persists it, so readers see
//! either the old list or the new one.
//!
//! Entries are addressed by position. Out-of-range indices are ignored without
//! error; callers must re-list after any mutation.

use crate::codec::{decode_descriptor, encode_descriptor};
use crate::kv::KeyValueStore;
use crate::types::{EuclideanMatcher, Gender, MatchResult, Matcher, StoredFace};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage key holding the serialized registry.
pub const REGISTRY_KEY: &str = "knownFaces.v1";

/// Wire shape shared by persistence and export.
#[derive(Serialize)]
struct SerializedFace<'a> {
    name: &'a str,
    #[serde(rename = "descriptorB64")]
    descriptor_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dob: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gender: Option<Gender>,
}

impl<'a> From<&'a StoredFace> for SerializedFace<'a> {
    fn from(face: &'a StoredFace) -> Self {
        Self {
            name: &face.name,
            descriptor_b64: encode_descriptor(&face.descriptor),
            dob: face.dob.as_deref(),
            gender: face.gender,
        }
    }
}

pub struct EmbeddingStore {
    kv: Arc<dyn KeyValueStore>,
    cache: Mutex<Option<Vec<StoredFace>>>,
}

impl EmbeddingStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            cache: Mutex::new(None),
        }
    }

    /// Snapshot of the registry in insertion order.
    pub fn list(&self) -> Vec<StoredFace> {
        let mut guard = self.lock();
        self.loaded(&mut guard).clone()
    }

    pub fn len(&self) -> usize {
        let mut guard = self.lock();
        self.loaded(&mut guard).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<StoredFace> {
        let mut guard = self.lock();
        self.loaded(&mut guard).get(index).cloned()
    }

    /// Append a face and return its index. Names need not be unique and the
    /// descriptor length is not checked.
    pub fn add(
        &self,
        name: &str,
        descriptor: Vec<f32>,
        dob: Option<String>,
        gender: Option<Gender>,
    ) -> usize {
        let mut guard = self.lock();
        let faces = self.loaded(&mut guard);
        faces.push(StoredFace {
            name: name.to_string(),
            descriptor,
            dob,
            gender,
        });
        let index = faces.len() - 1;
        tracing::info!(name, index, "face added to registry");
        self.persist(faces);
        index
    }

    pub fn delete_at(&self, index: usize) {
        let mut guard = self.lock();
        let faces = self.loaded(&mut guard);
        if index >= faces.len() {
            tracing::debug!(index, len = faces.len(), "delete ignored: index out of range");
            return;
        }
        let removed = faces.remove(index);
        tracing::info!(name = %removed.name, index, "face removed from registry");
        self.persist(faces);
    }

    /// Replace name, dob and gender at `index`. The descriptor is kept.
    pub fn update_at(&self, index: usize, name: &str, dob: Option<String>, gender: Option<Gender>) {
        let mut guard = self.lock();
        let faces = self.loaded(&mut guard);
        let Some(face) = faces.get_mut(index) else {
            tracing::debug!(index, "update ignored: index out of range");
            return;
        };
        face.name = name.to_string();
        face.dob = dob;
        face.gender = gender;
        tracing::info!(name, index, "face updated in registry");
        self.persist(faces);
    }

    pub fn clear(&self) {
        let mut guard = self.lock();
        *guard = Some(Vec::new());
        if let Err(e) = self.kv.remove(REGISTRY_KEY) {
            tracing::warn!(error = %e, "failed to remove registry from storage");
        }
        tracing::info!("registry cleared");
    }

    /// Drop the in-memory snapshot; the next read reloads from storage.
    pub fn invalidate_cache(&self) {
        *self.lock() = None;
    }

    pub fn export_serialized(&self, pretty: bool) -> String {
        let mut guard = self.lock();
        serialize(self.loaded(&mut guard), pretty)
    }

    /// Import serialized faces, appending when `merge` is set and replacing
    /// the registry otherwise.
    ///
    /// Malformed entries are dropped. A payload that is not a JSON array
    /// leaves the registry untouched. Returns the number of entries accepted.
    pub fn import_serialized(&self, text: &str, merge: bool) -> usize {
        let Some(incoming) = parse_registry(text) else {
            tracing::debug!(merge, "import ignored: payload is not a JSON array");
            return 0;
        };
        let accepted = incoming.len();

        let mut guard = self.lock();
        let faces = self.loaded(&mut guard);
        if merge {
            faces.extend(incoming);
        } else {
            *faces = incoming;
        }
        tracing::info!(accepted, merge, total = faces.len(), "registry imported");
        self.persist(faces);
        accepted
    }

    /// Match a probe against the current registry without copying it.
    pub fn match_descriptor(&self, probe: &[f32], threshold: f32) -> MatchResult {
        let mut guard = self.lock();
        EuclideanMatcher.compare(probe, self.loaded(&mut guard), threshold)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<StoredFace>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn loaded<'g>(&self, guard: &'g mut Option<Vec<StoredFace>>) -> &'g mut Vec<StoredFace> {
        guard.get_or_insert_with(|| self.read_persisted())
    }

    fn read_persisted(&self) -> Vec<StoredFace> {
        let raw = match self.kv.get(REGISTRY_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read registry; starting empty");
                return Vec::new();
            }
        };
        match parse_registry(&raw) {
            Some(faces) => {
                tracing::debug!(count = faces.len(), "registry loaded");
                faces
            }
            None => {
                tracing::warn!("persisted registry is corrupt; treating as empty");
                Vec::new()
            }
        }
    }

    fn persist(&self, faces: &[StoredFace]) {
        if let Err(e) = self.kv.set(REGISTRY_KEY, &serialize(faces, false)) {
            tracing::warn!(error = %e, "failed to persist registry");
        }
    }
}

fn serialize(faces: &[StoredFace], pretty: bool) -> String {
    let entries: Vec<SerializedFace<'_>> = faces.iter().map(SerializedFace::from).collect();
    let result = if pretty {
        serde_json::to_string_pretty(&entries)
    } else {
        serde_json::to_string(&entries)
    };
    result.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "registry serialization failed");
        "[]".to_string()
    })
}

/// Parse a serialized registry, keeping only well-typed entries.
///
/// Returns `None` when the text is not JSON or not an array.
fn parse_registry(text: &str) -> Option<Vec<StoredFace>> {
    let value: Value = serde_json::from_str(text).ok()?;
    let items = value.as_array()?;
    let faces: Vec<StoredFace> = items.iter().filter_map(parse_entry).collect();
    if faces.len() != items.len() {
        tracing::debug!(
            dropped = items.len() - faces.len(),
            "dropped malformed registry entries"
        );
    }
    Some(faces)
}

fn parse_entry(item: &Value) -> Option<StoredFace> {
    let name = item.get("name")?.as_str()?;
    let blob = item.get("descriptorB64")?.as_str()?;
    let descriptor = decode_descriptor(blob).ok()?;
    let dob = item.get("dob").and_then(Value::as_str).map(str::to_string);
    let gender = item.get("gender").and_then(Value::as_str).and_then(Gender::parse);
    Some(StoredFace {
        name: name.to_string(),
        descriptor,
        dob,
        gender,
    })
}
