use crate::error::{Result, StoreError};
use serde::{Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};

/// Normalized identity of a physical store file, used as the cache key.
///
/// Two spellings of the same file (relative vs absolute, `..` segments,
/// symlinks, and on Windows letter case and separators) resolve to the same
/// key, so the cache never opens a second handle for one file.
#[derive(Debug, Clone)]
pub struct CanonicalPath {
    path: PathBuf,
    key: String,
}

impl CanonicalPath {
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let raw = path.as_ref();
        if raw.as_os_str().is_empty() {
            return Err(StoreError::unavailable("", "empty path"));
        }

        let absolute = std::path::absolute(raw)
            .map_err(|e| StoreError::unavailable(raw.display().to_string(), e))?;
        // Symlinks can only be resolved for files that exist; missing files
        // still get a stable key so dispose/list lookups work.
        let path = std::fs::canonicalize(&absolute).unwrap_or_else(|_| normalize(&absolute));
        let key = key_for(&path);

        Ok(Self { path, key })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// File stem, used as the default display name of a selection.
    pub fn file_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.key.clone())
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(windows)]
fn key_for(path: &Path) -> String {
    let key = path.to_string_lossy().replace('\\', "/").to_lowercase();
    if let Some(unc) = key.strip_prefix("//?/unc/") {
        format!("//{}", unc)
    } else if let Some(local) = key.strip_prefix("//?/") {
        local.to_string()
    } else {
        key
    }
}

#[cfg(not(windows))]
fn key_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl PartialEq for CanonicalPath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for CanonicalPath {}

impl Hash for CanonicalPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for CanonicalPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl Serialize for CanonicalPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dot_segments_resolve_to_same_key() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("office.db");
        std::fs::write(&file, b"").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let direct = CanonicalPath::resolve(&file).unwrap();
        let dotted =
            CanonicalPath::resolve(dir.path().join("sub").join("..").join(".").join("office.db"))
                .unwrap();
        assert_eq!(direct, dotted);
        assert_eq!(direct.file_name(), "office");
    }

    #[test]
    fn test_missing_file_still_normalizes() {
        let dir = TempDir::new().unwrap();
        let a = CanonicalPath::resolve(dir.path().join("x").join("..").join("gone.db")).unwrap();
        let b = CanonicalPath::resolve(dir.path().join("gone.db")).unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_resolves_to_target() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("real.db");
        std::fs::write(&file, b"").unwrap();
        let link = dir.path().join("alias.db");
        std::os::unix::fs::symlink(&file, &link).unwrap();

        assert_eq!(
            CanonicalPath::resolve(&file).unwrap(),
            CanonicalPath::resolve(&link).unwrap()
        );
    }

    #[test]
    fn test_empty_path_is_unavailable() {
        assert!(matches!(
            CanonicalPath::resolve(""),
            Err(StoreError::StoreUnavailable { .. })
        ));
    }
}
