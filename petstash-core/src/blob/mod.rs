/*!
Blob store adapter.

Binary files (pet photos, generated invoices) live in a shared upload area
addressed by relative path. This module defines the storage port, the path
rules every adapter enforces, and the base64 bridge between the upload area
and the snapshot document.
*/

pub mod local;

pub use local::LocalBlobStore;

use base64::{engine::general_purpose, Engine as _};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::codec::encode_post;
use crate::model::{AttachmentBinding, BlobFile, EntityKind};
use crate::store::{EntityStore, StoredPost, ATTACHED_FILE_KEY, ATTACHMENT_POST_TYPE};
use crate::value::{Meta, MetaValue};
use crate::{PetstashError, Result};

/// Directory (relative to the upload root) holding generated documents.
pub const DOCUMENTS_DIR: &str = "petstash-documents";

/// Entity metadata keys whose values reference attachment ids.
pub const ATTACHMENT_META_KEYS: [&str; 3] =
    ["client_photo_id", "pet_photo_id", "appointment_attachment_ids"];

/// Storage abstraction for the upload area.
///
/// Paths are always relative to the adapter's root.
pub trait BlobStore {
    /// Write `data` at `path`, creating parent directories
    fn save(&self, data: &[u8], path: &str) -> Result<()>;

    /// Read the file at `path`
    fn load(&self, path: &str) -> Result<Vec<u8>>;

    /// Check if a file exists at `path`
    fn exists(&self, path: &str) -> bool;

    /// Delete the file at `path`; missing files are not an error
    fn delete(&self, path: &str) -> Result<()>;

    /// Every file below `dir`, as root-relative paths
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Remove `dir` and everything below it
    fn clear_dir(&self, dir: &str) -> Result<()>;
}

/// Validate a root-relative path.
///
/// Absolute paths, drive prefixes, `..`/`.` segments, backslashes and NUL
/// bytes are rejected.
pub fn sanitize_relative_path(path: &str) -> Result<PathBuf> {
    if path.trim().is_empty() {
        return Err(PetstashError::invalid_path(path, "path is empty"));
    }
    if path.contains('\0') || path.contains('\\') {
        return Err(PetstashError::invalid_path(
            path,
            "path contains a NUL byte or backslash",
        ));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::ParentDir => {
                return Err(PetstashError::invalid_path(path, "path traversal is not allowed"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PetstashError::invalid_path(path, "absolute paths are not allowed"))
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(PetstashError::invalid_path(path, "path is empty"));
    }
    Ok(clean)
}

/// Read one file and encode it for embedding.
pub fn read_one<B: BlobStore + ?Sized>(blobs: &B, path: &str) -> Result<String> {
    let bytes = blobs.load(path)?;
    Ok(general_purpose::STANDARD.encode(bytes))
}

/// Decode base64 content and write it at `path`. Returns the decoded size.
pub fn write_one<B: BlobStore + ?Sized>(blobs: &B, path: &str, content: &str) -> Result<usize> {
    sanitize_relative_path(path)?;
    let bytes = general_purpose::STANDARD.decode(content.trim())?;
    blobs.save(&bytes, path)?;
    Ok(bytes.len())
}

/// Size in bytes of a base64 payload once decoded.
pub fn decoded_len(content: &str) -> u64 {
    let trimmed = content.trim().trim_end_matches('=');
    (trimmed.len() as u64 * 3) / 4
}

/// Collect attachment files bound to the given entities.
///
/// Attachments are found two ways: posts parented to one of `owners`, and
/// ids stored under any of `meta_keys` on those entities.
pub fn read_attachments<S, B>(
    store: &S,
    blobs: &B,
    owners: &BTreeMap<i64, EntityKind>,
    meta_keys: &[&str],
) -> Result<Vec<BlobFile>>
where
    S: EntityStore + ?Sized,
    B: BlobStore + ?Sized,
{
    let owner_ids: Vec<i64> = owners.keys().copied().collect();
    let mut attachments: BTreeMap<i64, StoredPost> = store
        .attachments_of(&owner_ids)?
        .into_iter()
        .map(|a| (a.post.id, a))
        .collect();

    for id in referenced_attachment_ids(store, &owner_ids, meta_keys)? {
        if attachments.contains_key(&id) {
            continue;
        }
        match store.load_post(id)? {
            Some(post) if post.post.post_type == ATTACHMENT_POST_TYPE => {
                attachments.insert(id, post);
            }
            _ => debug!("Referenced attachment {} does not exist, skipping", id),
        }
    }

    let mut files = Vec::with_capacity(attachments.len());
    for (id, attachment) in attachments {
        let Some(path) = attachment.meta_value(ATTACHED_FILE_KEY) else {
            warn!("Attachment {} has no file path, skipping", id);
            continue;
        };
        let path = path.to_string();
        let content = read_one(blobs, &path)?;

        let parent = attachment.post.parent;
        let meta: Meta = attachment
            .meta
            .iter()
            .map(|(k, v)| (k.clone(), MetaValue::from_stored(v)))
            .collect();

        files.push(BlobFile {
            path,
            content,
            attachment: Some(AttachmentBinding {
                id,
                parent_id: (parent != 0).then_some(parent),
                parent_kind: owners.get(&parent).copied(),
                post: encode_post(&attachment.post),
                mime_type: attachment.post.mime_type.clone(),
                meta,
            }),
        });
    }

    debug!("Collected {} attachment files", files.len());
    Ok(files)
}

/// Collect free-standing generated documents.
pub fn read_documents<B: BlobStore + ?Sized>(blobs: &B) -> Result<Vec<BlobFile>> {
    blobs
        .list(DOCUMENTS_DIR)?
        .into_iter()
        .map(|path| {
            let content = read_one(blobs, &path)?;
            Ok(BlobFile {
                path,
                content,
                attachment: None,
            })
        })
        .collect()
}

/// Attachment ids stored under `meta_keys` on the given posts.
pub fn referenced_attachment_ids<S: EntityStore + ?Sized>(
    store: &S,
    post_ids: &[i64],
    meta_keys: &[&str],
) -> Result<BTreeSet<i64>> {
    let mut ids = BTreeSet::new();
    if post_ids.is_empty() {
        return Ok(ids);
    }
    for key in meta_keys {
        for raw in store.meta_values(post_ids, key)? {
            collect_ids(&MetaValue::from_stored(&raw), &mut ids);
        }
    }
    Ok(ids)
}

fn collect_ids(value: &MetaValue, out: &mut BTreeSet<i64>) {
    match value {
        MetaValue::List(items) => items.iter().for_each(|item| collect_ids(item, out)),
        other => {
            if let Some(id) = other.as_id().filter(|id| *id > 0) {
                out.insert(id);
            }
        }
    }
}

/// Temporary area holding decoded files until the database commits.
pub struct BlobStaging {
    dir: TempDir,
    store: LocalBlobStore,
    staged: Vec<String>,
}

impl BlobStaging {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("petstash-staging-")
            .tempdir()
            .map_err(|e| PetstashError::storage(format!("Failed to create staging area: {e}")))?;
        let store = LocalBlobStore::with_base_dir(dir.path());
        Ok(Self {
            dir,
            store,
            staged: Vec::new(),
        })
    }

    /// Decode and stage one file. Returns the decoded size.
    pub fn stage(&mut self, path: &str, content: &str) -> Result<usize> {
        let size = write_one(&self.store, path, content)?;
        self.staged.push(path.to_string());
        Ok(size)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy every staged file into `target`.
    ///
    /// Failures do not stop the remaining files; they are returned so the
    /// caller can report them.
    pub fn promote<B: BlobStore + ?Sized>(self, target: &B) -> Vec<(String, PetstashError)> {
        let mut failures = Vec::new();
        for path in &self.staged {
            let result = self
                .store
                .load(path)
                .and_then(|bytes| target.save(&bytes, path));
            if let Err(e) = result {
                failures.push((path.clone(), e));
            }
        }
        failures
    }
}
