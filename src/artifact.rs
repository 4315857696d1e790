//! Artifact model and all-or-nothing materialization.
//!
//! Workers hand back artifact fragments (relative path + bytes); a session
//! merges them into an [`ArtifactSet`] which is written out in one shot:
//! the full tree is staged under a hidden sibling directory, fsynced, then
//! promoted with a single atomic rename. A failed materialization removes
//! the stage, so the output root is never left half-applied.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RunnerError};

/// One file produced by a task, content carried as base64 so fragments can
/// be embedded verbatim in transcript events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFragment {
    /// Path relative to the session's output root.
    pub path: PathBuf,
    content_b64: String,
}

impl ArtifactFragment {
    pub fn new(path: impl Into<PathBuf>, content: &[u8]) -> Self {
        Self {
            path: path.into(),
            content_b64: base64::engine::general_purpose::STANDARD.encode(content),
        }
    }

    /// Build a fragment from already-encoded content, validating both the
    /// path and the encoding up front.
    pub fn from_base64(
        path: impl Into<PathBuf>,
        content_b64: impl Into<String>,
    ) -> std::result::Result<Self, String> {
        let fragment = Self {
            path: validated_rel_path(&path.into())?,
            content_b64: content_b64.into(),
        };
        fragment.content()?;
        Ok(fragment)
    }

    /// Decode the fragment's content.
    ///
    /// Fails only on hand-edited or damaged transcript data.
    pub fn content(&self) -> std::result::Result<Vec<u8>, String> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.content_b64)
            .map_err(|e| format!("invalid base64 in fragment '{}': {}", self.path.display(), e))
    }
}

/// Validate a fragment path: relative, no parent traversal, non-empty.
///
/// Returns the normalized path or a reason the caller wraps into its own
/// error class (worker protocol violation vs. corrupt transcript).
pub fn validated_rel_path(path: &Path) -> std::result::Result<PathBuf, String> {
    if path.as_os_str().is_empty() {
        return Err("empty artifact path".to_string());
    }
    if path.is_absolute() {
        return Err(format!("absolute artifact path '{}'", path.display()));
    }
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => {
                return Err(format!(
                    "artifact path '{}' escapes the output root",
                    path.display()
                ))
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err("empty artifact path".to_string());
    }
    Ok(normalized)
}

/// The session's accumulated artifacts, keyed by relative path.
///
/// Later fragments for the same path win; transcript order makes that
/// deterministic under replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a fragment, validating its path.
    pub fn insert_fragment(
        &mut self,
        fragment: &ArtifactFragment,
    ) -> std::result::Result<(), String> {
        let path = validated_rel_path(&fragment.path)?;
        let content = fragment.content()?;
        self.files.insert(path, content);
        Ok(())
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, content: Vec<u8>) {
        self.files.insert(path.into(), content);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(|p| p.as_path())
    }

    pub fn get(&self, path: &Path) -> Option<&[u8]> {
        self.files.get(path).map(|c| c.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_path(), c.as_slice()))
    }
}

/// Read an existing output tree back into an [`ArtifactSet`].
///
/// Used for conflict detection and for byte-for-byte replay verification.
pub fn load_tree(root: &Path) -> Result<ArtifactSet> {
    let mut set = ArtifactSet::new();
    if !root.exists() {
        return Ok(set);
    }
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            RunnerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root")
            .to_path_buf();
        let content = std::fs::read(entry.path())?;
        set.insert(rel, content);
    }
    Ok(set)
}

/// Write a session's artifacts under `dest_root`, all-or-nothing.
///
/// Behavior when `dest_root` already exists:
/// - byte-identical content: accepted as-is (re-materialization of the
///   same session, e.g. during replay, is idempotent)
/// - differing content with `overwrite`: the old tree is swapped out only
///   after the new one is fully staged
/// - differing content without `overwrite`: `OutputConflict`
///
/// Returns the written paths relative to `dest_root`, in path order.
pub async fn materialize(
    artifacts: &ArtifactSet,
    dest_root: &Path,
    overwrite: bool,
) -> Result<Vec<PathBuf>> {
    let written: Vec<PathBuf> = artifacts.paths().map(|p| p.to_path_buf()).collect();

    if dest_root.exists() {
        let existing = load_tree(dest_root)?;
        if &existing == artifacts {
            tracing::debug!(root = %dest_root.display(), "output already matches, nothing to write");
            return Ok(written);
        }
        if !overwrite {
            return Err(RunnerError::OutputConflict {
                path: dest_root.to_path_buf(),
                detail: "existing content differs and no overwrite policy was granted".to_string(),
            });
        }
    }

    let stage = stage_path(dest_root)?;
    if let Err(err) = write_stage(artifacts, &stage).await {
        let _ = tokio::fs::remove_dir_all(&stage).await;
        return Err(err);
    }

    if let Err(err) = promote_stage(&stage, dest_root).await {
        let _ = tokio::fs::remove_dir_all(&stage).await;
        return Err(err);
    }

    tracing::info!(
        root = %dest_root.display(),
        files = written.len(),
        "artifacts materialized"
    );
    Ok(written)
}

/// Hidden sibling of `dest_root` named `.{name}.{suffix}`.
///
/// Full-name prefixing (rather than `set_extension`) keeps output names
/// containing dots from colliding with unrelated siblings.
fn hidden_sibling(dest_root: &Path, suffix: &str) -> Result<PathBuf> {
    let parent = dest_root.parent().filter(|p| !p.as_os_str().is_empty());
    let name = dest_root
        .file_name()
        .ok_or_else(|| RunnerError::OutputConflict {
            path: dest_root.to_path_buf(),
            detail: "output root has no final path component".to_string(),
        })?;
    let sibling = format!(".{}.{}", name.to_string_lossy(), suffix);
    Ok(match parent {
        Some(p) => p.join(sibling),
        None => PathBuf::from(sibling),
    })
}

fn stage_path(dest_root: &Path) -> Result<PathBuf> {
    let short = &Uuid::new_v4().to_string()[..8];
    hidden_sibling(dest_root, &format!("stage-{short}"))
}

async fn write_stage(artifacts: &ArtifactSet, stage: &Path) -> Result<()> {
    tokio::fs::create_dir_all(stage).await?;
    for (rel, content) in artifacts.iter() {
        let target = stage.join(rel);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&target).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, content).await?;
        file.sync_all().await?;
    }
    Ok(())
}

async fn promote_stage(stage: &Path, dest_root: &Path) -> Result<()> {
    if let Some(parent) = dest_root.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    if dest_root.exists() {
        // Swap rather than delete-then-rename: a crash in between leaves
        // either the old tree or both trees, never nothing.
        let displaced = hidden_sibling(dest_root, "replaced")?;
        let _ = tokio::fs::remove_dir_all(&displaced).await;
        tokio::fs::rename(dest_root, &displaced).await?;
        tokio::fs::rename(stage, dest_root).await?;
        let _ = tokio::fs::remove_dir_all(&displaced).await;
    } else {
        tokio::fs::rename(stage, dest_root).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ArtifactSet {
        let mut set = ArtifactSet::new();
        set.insert("Makefile", b"all:\n\tcc main.c\n".to_vec());
        set.insert("src/main.c", b"int main(void) { return 0; }\n".to_vec());
        set
    }

    #[test]
    fn test_fragment_round_trip() {
        let fragment = ArtifactFragment::new("src/lib.rs", b"pub fn f() {}\n");
        assert_eq!(fragment.content().unwrap(), b"pub fn f() {}\n");
    }

    #[test]
    fn test_rejects_traversal_paths() {
        assert!(validated_rel_path(Path::new("../evil")).is_err());
        assert!(validated_rel_path(Path::new("/etc/passwd")).is_err());
        assert!(validated_rel_path(Path::new("")).is_err());
        assert_eq!(
            validated_rel_path(Path::new("./src/main.c")).unwrap(),
            PathBuf::from("src/main.c")
        );
    }

    #[test]
    fn test_later_fragment_wins() {
        let mut set = ArtifactSet::new();
        set.insert_fragment(&ArtifactFragment::new("a.txt", b"one")).unwrap();
        set.insert_fragment(&ArtifactFragment::new("a.txt", b"two")).unwrap();
        assert_eq!(set.get(Path::new("a.txt")), Some(&b"two"[..]));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_materialize_fresh_tree() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        let written = materialize(&sample_set(), &dest, false).await.unwrap();
        assert_eq!(written.len(), 2);
        assert!(dest.join("src/main.c").is_file());
        assert_eq!(load_tree(&dest).unwrap(), sample_set());

        // No stage directory survives.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_rematerialize_identical_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        materialize(&sample_set(), &dest, false).await.unwrap();
        let written = materialize(&sample_set(), &dest, false).await.unwrap();
        assert_eq!(written.len(), 2);
    }

    #[tokio::test]
    async fn test_conflict_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("Makefile"), b"something else").unwrap();

        let err = materialize(&sample_set(), &dest, false).await.unwrap_err();
        assert!(matches!(err, RunnerError::OutputConflict { .. }));
        // The differing file was not touched.
        assert_eq!(std::fs::read(dest.join("Makefile")).unwrap(), b"something else");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_tree() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), b"old").unwrap();

        materialize(&sample_set(), &dest, true).await.unwrap();
        assert!(!dest.join("stale.txt").exists());
        assert_eq!(load_tree(&dest).unwrap(), sample_set());
    }

    #[tokio::test]
    async fn test_empty_set_creates_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let written = materialize(&ArtifactSet::new(), &dest, false).await.unwrap();
        assert!(written.is_empty());
        assert!(dest.is_dir());
    }
}
