use std::{
    borrow::Cow,
    fmt::{self, Formatter},
    fs, io,
    path::{Path, PathBuf},
    result,
};

use kiln_shared::{serde_json, thiserror};

/// Extension of the sidecar file that is stored next to every source file.
pub const META_EXTENSION: &str = "set";

/// Name of the bundle manifest in the import cache.
pub const INDEX_FILE_NAME: &str = "index";

/// Extension of the temporary files that are renamed into place by [`write_atomically`].
pub(crate) const TEMPORARY_EXTENSION: &str = "tmp";

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),
    #[error("Invalid extension '{0}' in path {1}")]
    InvalidExtension(String, PathBuf),
    #[error("IoError: {0}")]
    IoError(#[from] io::Error),
    #[error("JsonError: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YamlError: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Extension not registered: {0}")]
    ExtensionNotRegistered(String),
    #[error("Converter '{0}' doesn't declare any suffixes")]
    ConverterWithoutSuffixes(String),
    #[error("Failed to start directory watcher in directory: {0}")]
    FailedToStartDirectoryWatcher(PathBuf),
    #[error("Failed to read the asset: {0}")]
    InvalidAssetData(PathBuf),
    #[error("Invalid GUID: {0}")]
    InvalidGuid(String),
    #[error("Build of '{0}' failed: {1}")]
    BuildFailed(String, String),
    #[error("Other: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Identifies the asset. It's a relative path in the content directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetKey(PathBuf);

impl AssetKey {
    /// Create a new [`AssetKey`] from a path. No validation is done on the path.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_content::AssetKey;
    /// let asset_key = AssetKey::new("textures/character.png");
    /// assert_eq!(asset_key.as_str(), "textures/character.png");
    /// ```
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Returns the path of the asset.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Returns the path of the asset with forward slashes on every platform.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_content::AssetKey;
    /// let asset_key = AssetKey::new("models/tree.fbx").join("Trunk");
    /// assert_eq!(asset_key.as_str(), "models/tree.fbx/Trunk");
    /// ```
    pub fn as_str(&self) -> Cow<'_, str> {
        match self.0.to_string_lossy() {
            Cow::Borrowed(path) if !path.contains('\\') => Cow::Borrowed(path),
            path => Cow::Owned(path.replace('\\', "/")),
        }
    }

    /// Key of the sub-item `key` of this asset.
    pub fn join(&self, key: &str) -> Self {
        Self(self.0.join(key))
    }

    /// Returns true if this key is `prefix` or lies below `prefix`.
    pub fn starts_with(&self, prefix: &AssetKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "AssetKey({})", self.as_str())
    }
}

impl From<&str> for AssetKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<&Path> for AssetKey {
    fn from(value: &Path) -> Self {
        Self::new(value)
    }
}

impl From<&AssetKey> for AssetKey {
    fn from(value: &AssetKey) -> Self {
        value.clone()
    }
}

pub(crate) fn extract_extension_from_path(path: &Path) -> Result<String> {
    Ok(path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_lowercase())
        .ok_or(Error::InvalidPath(path.to_owned()))?
        .to_owned())
}

pub(crate) fn extract_file_name_from_path(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .and_then(|file_name| file_name.to_str())
        .ok_or(Error::InvalidPath(path.to_owned()))?
        .to_owned())
}

pub(crate) fn extract_base_name_from_path(path: &Path) -> Result<String> {
    Ok(path
        .file_stem()
        .and_then(|file_stem| file_stem.to_str())
        .ok_or(Error::InvalidPath(path.to_owned()))?
        .to_owned())
}

/// Path of the sidecar file of `source`.
pub fn meta_path(source: &Path) -> PathBuf {
    let mut path = source.as_os_str().to_owned();
    path.push(".");
    path.push(META_EXTENSION);
    PathBuf::from(path)
}

pub(crate) fn is_meta_file(path: &Path) -> bool {
    path.extension().and_then(|extension| extension.to_str()) == Some(META_EXTENSION)
}

/// Writes the content to a temporary file next to `path` and renames it into place so that
/// readers never observe a partially written file.
pub(crate) fn write_atomically(path: &Path, content: impl AsRef<[u8]>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut temporary_path = path.as_os_str().to_owned();
    temporary_path.push(".");
    temporary_path.push(TEMPORARY_EXTENSION);
    let temporary_path = PathBuf::from(temporary_path);
    fs::write(&temporary_path, content)?;
    fs::rename(&temporary_path, path)
}

/// Finds a name that doesn't exist in `directory` by appending a number to `base_name`.
pub(crate) fn find_free_name(base_name: &str, directory: &Path, suffix: &str) -> String {
    let mut name = base_name.to_owned();
    let mut counter = 1;
    while directory.join(format!("{name}{suffix}")).exists() {
        name = format!("{base_name}{counter}");
        counter += 1;
    }
    name
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn extension_is_lower_case() {
        let extension = extract_extension_from_path(Path::new("textures/Character.PNG")).unwrap();
        assert_eq!(extension, "png");
        assert!(extract_extension_from_path(Path::new("textures/readme")).is_err());
    }

    #[test]
    fn meta_path_appends_extension() {
        assert_eq!(meta_path(Path::new("/content/a.txt")), PathBuf::from("/content/a.txt.set"));
        assert!(is_meta_file(&meta_path(Path::new("/content/a.txt"))));
        assert!(!is_meta_file(Path::new("/content/a.txt")));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let root = TempDir::new("root").unwrap();
        let path = root.path().join("nested/file.json");
        write_atomically(&path, "first").unwrap();
        write_atomically(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn free_name_counts_up() {
        let root = TempDir::new("root").unwrap();
        assert_eq!(find_free_name("a", root.path(), ".txt"), "a");
        fs::write(root.path().join("a.txt"), "").unwrap();
        fs::write(root.path().join("a1.txt"), "").unwrap();
        assert_eq!(find_free_name("a", root.path(), ".txt"), "a2");
    }

    #[test]
    fn asset_key_join() {
        let key = AssetKey::new("models/tree.fbx");
        let sub = key.join("Trunk");
        assert!(sub.starts_with(&key));
        assert!(!key.starts_with(&sub));
    }
}
