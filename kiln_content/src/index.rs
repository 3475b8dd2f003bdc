use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use kiln_shared::{
    log::{info, trace, warn},
    pathdiff, serde_json,
};
use serde::{Deserialize, Serialize};

use crate::{
    common::{write_atomically, INDEX_FILE_NAME, TEMPORARY_EXTENSION},
    settings::CODE_TYPE_NAME,
    AssetKey, ContentHash, Guid, ProjectSettings, Result,
};

/// Version of the bundle manifest format.
pub const MANIFEST_VERSION: u32 = 2;

/// Prefix of the index paths of assets that are located outside of the content directory.
pub const EMBEDDED_PREFIX: &str = ".embedded";

/// Forward entry of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub type_name: String,
    pub guid: Guid,
    pub hash: Option<ContentHash>,
}

/// Maps the local paths of the assets to their artifacts and back.
///
/// An entry is only added when its artifact exists in the import cache, so the runtime never
/// sees an entry it can't load. Entries of code builders are persistent: they have no
/// artifact in the import cache and are never pruned.
#[derive(Debug)]
pub struct AssetIndex {
    content_path: PathBuf,
    import_path: PathBuf,
    forward: BTreeMap<AssetKey, IndexEntry>,
    reverse: BTreeMap<Guid, PathBuf>,
    labels: BTreeSet<String>,
    persistent: BTreeSet<Guid>,
}

impl AssetIndex {
    pub fn new(content_path: impl Into<PathBuf>, import_path: impl Into<PathBuf>) -> Self {
        Self {
            content_path: content_path.into(),
            import_path: import_path.into(),
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
            labels: BTreeSet::new(),
            persistent: BTreeSet::new(),
        }
    }

    /// Converts an absolute path into the path that is used as key in the index.
    ///
    /// Paths outside of the content directory are mapped into the embedded namespace.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::path::Path;
    /// use kiln_content::index::AssetIndex;
    /// let index = AssetIndex::new("/project/content", "/project/cache/import");
    /// assert_eq!(index.path_to_local(Path::new("/project/content/a/b.txt")).as_str(), "a/b.txt");
    /// assert_eq!(index.path_to_local(Path::new("/engine/materials/default.mtl")).as_str(), ".embedded/default.mtl");
    /// ```
    pub fn path_to_local(&self, path: &Path) -> AssetKey {
        if let Ok(relative) = path.strip_prefix(&self.content_path) {
            return AssetKey::new(relative);
        }
        if path.is_relative() {
            return AssetKey::new(path);
        }
        if let Some(relative) = pathdiff::diff_paths(path, &self.content_path).filter(|relative| !relative.starts_with("..")) {
            return AssetKey::new(relative);
        }

        let embedded = Path::new(EMBEDDED_PREFIX);
        let file_name = path.file_name().map(PathBuf::from).unwrap_or_default();
        match path.parent() {
            // Sub-items are addressed below the path of their source file.
            Some(parent) if parent.is_file() => {
                let parent_name = parent.file_name().map(PathBuf::from).unwrap_or_default();
                AssetKey::new(embedded.join(parent_name).join(file_name))
            }
            _ => AssetKey::new(embedded.join(file_name)),
        }
    }

    /// Adds the asset to the index. Returns false if its artifact doesn't exist.
    pub fn register_asset(&mut self, path: &Path, guid: Guid, type_name: &str, hash: Option<ContentHash>) -> bool {
        if !self.import_path.join(guid.to_string()).exists() {
            trace!("Not registering {path:?} because the artifact {guid} doesn't exist");
            return false;
        }
        self.insert(path, self.path_to_local(path), guid, type_name, hash);
        true
    }

    /// Adds an entry that has no artifact in the import cache, e.g. the library of a code builder.
    pub fn register_persistent(&mut self, key: &str, guid: Guid, type_name: &str) {
        self.persistent.insert(guid);
        self.insert(Path::new(key), AssetKey::new(key), guid, type_name, None);
    }

    /// Registers the entries of a manifest that was written in an earlier session.
    ///
    /// Entries whose source or artifact is gone are skipped. Entries of code builders are
    /// restored as persistent entries. Returns the number of restored entries.
    pub fn load_bundle(&mut self, manifest: &BundleManifest) -> usize {
        let mut loaded = 0;
        for (guid, ManifestEntry(key, type_name, hash)) in &manifest.content {
            let hash = ContentHash::parse(hash);
            if key.starts_with(EMBEDDED_PREFIX) {
                if type_name == CODE_TYPE_NAME {
                    self.register_persistent(key, *guid, type_name);
                    loaded += 1;
                } else if self.register_asset(Path::new(key), *guid, type_name, hash) {
                    loaded += 1;
                }
                continue;
            }

            let path = self.content_path.join(key);
            // Sub-items are addressed below their source file and don't exist on their own.
            let source_exists = path.exists() || path.parent().is_some_and(Path::is_file);
            if !source_exists {
                trace!("Not restoring {key} because its source was deleted");
                continue;
            }
            if self.register_asset(&path, *guid, type_name, hash) {
                loaded += 1;
            }
        }
        loaded
    }

    fn insert(&mut self, path: &Path, key: AssetKey, guid: Guid, type_name: &str, hash: Option<ContentHash>) {
        // Keep both directions consistent when the path or the GUID was registered before.
        if let Some(previous) = self.forward.get(&key) {
            if previous.guid != guid {
                self.reverse.remove(&previous.guid);
            }
        }
        if let Some(previous_path) = self.reverse.get(&guid) {
            let previous_key = self.path_to_local(previous_path);
            if previous_key != key {
                self.forward.remove(&previous_key);
            }
        }

        self.forward.insert(
            key,
            IndexEntry {
                type_name: type_name.to_owned(),
                guid,
                hash,
            },
        );
        self.reverse.insert(guid, path.to_owned());
        self.labels.insert(type_name.to_owned());
    }

    /// Removes the asset from the index and returns its [`Guid`].
    ///
    /// Returns `None` if the path is unknown or the reverse entry is missing.
    pub fn unregister_asset(&mut self, path: &Path) -> Option<Guid> {
        let key = self.path_to_local(path);
        let guid = self.forward.get(&key)?.guid;
        if !self.reverse.contains_key(&guid) {
            warn!("Index entry of {key} has no reverse entry for {guid}");
            return None;
        }
        self.forward.remove(&key);
        self.reverse.remove(&guid);
        self.persistent.remove(&guid);
        Some(guid)
    }

    pub fn path_to_guid(&self, path: &Path) -> Option<Guid> {
        self.forward.get(&self.path_to_local(path)).map(|entry| entry.guid)
    }

    pub fn guid_to_path(&self, guid: &Guid) -> Option<&Path> {
        self.reverse.get(guid).map(PathBuf::as_path)
    }

    pub fn entry(&self, path: &Path) -> Option<&IndexEntry> {
        self.forward.get(&self.path_to_local(path))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&AssetKey, &IndexEntry)> {
        self.forward.iter()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Type names of all registered assets.
    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn is_persistent(&self, guid: &Guid) -> bool {
        self.persistent.contains(guid)
    }

    /// Removes all entries whose absolute path lies below `prefix` and returns them with their absolute paths.
    pub fn remove_under(&mut self, prefix: &Path) -> Vec<(PathBuf, IndexEntry)> {
        let paths = self
            .reverse
            .iter()
            .filter(|(_, path)| path.starts_with(prefix))
            .map(|(guid, path)| (*guid, path.clone()))
            .collect::<Vec<_>>();
        let mut removed = Vec::new();
        for (guid, path) in paths {
            let key = self.path_to_local(&path);
            self.reverse.remove(&guid);
            if let Some(entry) = self.forward.remove(&key) {
                removed.push((path, entry));
            }
        }
        removed
    }

    /// Removes the entries whose artifacts don't exist anymore. Persistent entries are kept.
    pub fn prune_missing_artifacts(&mut self) -> Vec<AssetKey> {
        let missing = self
            .forward
            .iter()
            .filter(|(_, entry)| !self.persistent.contains(&entry.guid))
            .filter(|(_, entry)| !self.import_path.join(entry.guid.to_string()).exists())
            .map(|(key, entry)| (key.clone(), entry.guid))
            .collect::<Vec<_>>();
        for (key, guid) in &missing {
            trace!("Removing {key} from the index because its artifact is missing");
            self.forward.remove(key);
            self.reverse.remove(guid);
        }
        missing.into_iter().map(|(key, _)| key).collect()
    }

    /// Returns true if every forward entry has a reverse entry that points back to it.
    pub fn is_consistent(&self) -> bool {
        self.forward.len() == self.reverse.len()
            && self.forward.iter().all(|(key, entry)| {
                self.reverse
                    .get(&entry.guid)
                    .is_some_and(|path| &self.path_to_local(path) == key)
            })
    }

    /// Deletes all files in the import cache whose name isn't the [`Guid`] of a registered asset.
    ///
    /// Returns the number of deleted files.
    pub fn cleanup_bundle(&self) -> Result<usize> {
        let mut deleted = 0;
        for entry in fs::read_dir(&self.import_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_temporary = path.extension().and_then(|extension| extension.to_str()) == Some(TEMPORARY_EXTENSION);
            if name == INDEX_FILE_NAME || is_temporary {
                continue;
            }
            let is_registered = Guid::parse(&name).is_ok_and(|guid| self.reverse.contains_key(&guid));
            if !is_registered {
                trace!("Deleting orphaned artifact {path:?}");
                fs::remove_file(&path)?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!("Deleted {deleted} orphaned artifacts");
        }
        Ok(deleted)
    }

    /// Writes the manifest of the current index into the import cache.
    pub fn dump_bundle(&self, project: &ProjectSettings) -> Result<BundleManifest> {
        let manifest = BundleManifest::from_index(self, project);
        let content = serde_json::to_string_pretty(&manifest)?;
        write_atomically(&project.index_path(), content)?;
        trace!("Wrote manifest with {} entries", manifest.content.len());
        Ok(manifest)
    }
}

/// Entry of the manifest: local path, type name and content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry(pub String, pub String, pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSettings {
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub project: String,
}

/// Snapshot of the whole index that the runtime loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub version: u32,
    pub content: BTreeMap<Guid, ManifestEntry>,
    #[serde(default)]
    pub settings: ManifestSettings,
}

impl BundleManifest {
    pub fn from_index(index: &AssetIndex, project: &ProjectSettings) -> Self {
        let content = index
            .entries()
            .map(|(key, entry)| {
                let hash = entry.hash.map(|hash| hash.to_string()).unwrap_or_default();
                (entry.guid, ManifestEntry(key.as_str().into_owned(), entry.type_name.clone(), hash))
            })
            .collect();
        let config = project.config();
        Self {
            version: MANIFEST_VERSION,
            content,
            settings: ManifestSettings {
                entry: config.entry.clone(),
                company: config.company.clone(),
                project: config.name.clone(),
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Returns the manifest entry of the local path.
    pub fn find(&self, local_path: &str) -> Option<(&Guid, &ManifestEntry)> {
        self.content.iter().find(|(_, entry)| entry.0 == local_path)
    }
}

#[cfg(test)]
mod tests {
    use kiln_test::write_file;
    use tempdir::TempDir;

    use super::*;

    fn setup() -> (TempDir, ProjectSettings, AssetIndex) {
        let root = TempDir::new("root").unwrap();
        let project = ProjectSettings::new(root.path(), "Demo").unwrap();
        let index = AssetIndex::new(project.content_path(), project.import_path());
        (root, project, index)
    }

    fn write_artifact(project: &ProjectSettings) -> Guid {
        let guid = Guid::new();
        fs::write(project.artifact_path(&guid), "artifact").unwrap();
        guid
    }

    #[test]
    fn register_requires_artifact() {
        let (_root, project, mut index) = setup();
        let source = project.content_path().join("a.txt");
        assert!(!index.register_asset(&source, Guid::new(), "Text", None));
        assert!(index.is_empty());

        let guid = write_artifact(&project);
        assert!(index.register_asset(&source, guid, "Text", None));
        assert_eq!(index.path_to_guid(&source), Some(guid));
        assert_eq!(index.guid_to_path(&guid), Some(source.as_path()));
        assert!(index.labels().contains("Text"));
        assert!(index.is_consistent());
    }

    #[test]
    fn unregister_removes_both_directions() {
        let (_root, project, mut index) = setup();
        let source = project.content_path().join("a.txt");
        let guid = write_artifact(&project);
        index.register_asset(&source, guid, "Text", None);

        assert_eq!(index.unregister_asset(&source), Some(guid));
        assert_eq!(index.unregister_asset(&source), None);
        assert!(index.guid_to_path(&guid).is_none());
        assert!(index.is_consistent());
    }

    #[test]
    fn register_again_keeps_index_consistent() {
        let (_root, project, mut index) = setup();
        let a = project.content_path().join("a.txt");
        let b = project.content_path().join("b.txt");
        let first = write_artifact(&project);
        let second = write_artifact(&project);

        index.register_asset(&a, first, "Text", None);
        index.register_asset(&a, second, "Text", None);
        assert!(index.guid_to_path(&first).is_none());
        assert!(index.is_consistent());

        index.register_asset(&b, second, "Text", None);
        assert!(index.path_to_guid(&a).is_none());
        assert_eq!(index.len(), 1);
        assert!(index.is_consistent());
    }

    #[test]
    fn embedded_paths() {
        let (root, project, index) = setup();
        let outside = write_file(root.path(), "engine/cube.fbx", "mesh");
        assert_eq!(index.path_to_local(&outside).as_str(), ".embedded/cube.fbx");
        assert_eq!(index.path_to_local(&outside.join("Cube")).as_str(), ".embedded/cube.fbx/Cube");
        let sub = project.content_path().join("models/tree.fbx").join("Trunk");
        assert_eq!(index.path_to_local(&sub).as_str(), "models/tree.fbx/Trunk");
    }

    #[test]
    fn cleanup_deletes_orphans() {
        let (_root, project, mut index) = setup();
        let source = project.content_path().join("a.txt");
        let registered = write_artifact(&project);
        let orphan = write_artifact(&project);
        index.register_asset(&source, registered, "Text", None);
        index.dump_bundle(&project).unwrap();
        fs::write(project.import_path().join("garbage"), "").unwrap();

        assert_eq!(index.cleanup_bundle().unwrap(), 2);
        assert!(project.artifact_path(&registered).exists());
        assert!(!project.artifact_path(&orphan).exists());
        assert!(project.index_path().exists());

        let manifest = index.dump_bundle(&project).unwrap();
        assert!(!manifest.content.contains_key(&orphan));
        assert_eq!(BundleManifest::load(&project.index_path()).unwrap(), manifest);
    }

    #[test]
    fn prune_keeps_persistent_entries() {
        let (_root, project, mut index) = setup();
        let source = project.content_path().join("a.txt");
        let guid = write_artifact(&project);
        index.register_asset(&source, guid, "Text", None);
        let plugin = Guid::from_name("plugin");
        index.register_persistent(".embedded/plugin", plugin, "Code");

        fs::remove_file(project.artifact_path(&guid)).unwrap();
        let pruned = index.prune_missing_artifacts();
        assert_eq!(pruned, vec![AssetKey::new("a.txt")]);
        assert!(index.is_persistent(&plugin));
        assert_eq!(index.len(), 1);
        assert!(index.is_consistent());
    }

    #[test]
    fn remove_under_prefix() {
        let (_root, project, mut index) = setup();
        let inside = project.content_path().join("textures/wood.png");
        let outside = project.content_path().join("texts/a.txt");
        let first = write_artifact(&project);
        let second = write_artifact(&project);
        index.register_asset(&inside, first, "Texture", None);
        index.register_asset(&outside, second, "Text", None);

        let removed = index.remove_under(&project.content_path().join("textures"));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, inside);
        assert_eq!(removed[0].1.guid, first);
        assert_eq!(index.len(), 1);
        assert!(index.is_consistent());
    }

    #[test]
    fn load_bundle_restores_entries() {
        let (_root, project, mut index) = setup();
        let source = write_file(project.content_path(), "a.lines", "first");
        let deleted = project.content_path().join("deleted.txt");
        let primary = write_artifact(&project);
        let sub_item = write_artifact(&project);
        let orphan = write_artifact(&project);
        let plugin = Guid::from_name("plugin");
        index.register_asset(&source, primary, "Lines", Some(ContentHash::of_bytes(b"first")));
        index.register_asset(&source.join("first"), sub_item, "Line", None);
        index.register_asset(&deleted, orphan, "Text", None);
        index.register_persistent(".embedded/plugin", plugin, "Code");
        let manifest = index.dump_bundle(&project).unwrap();
        let missing = write_artifact(&project);
        let mut manifest_with_missing_artifact = manifest.clone();
        manifest_with_missing_artifact
            .content
            .insert(missing, ManifestEntry("b.txt".to_owned(), "Text".to_owned(), String::new()));
        fs::remove_file(project.artifact_path(&missing)).unwrap();
        write_file(project.content_path(), "b.txt", "b");

        let mut restored = AssetIndex::new(project.content_path(), project.import_path());
        assert_eq!(restored.load_bundle(&manifest_with_missing_artifact), 3);
        assert_eq!(restored.path_to_guid(&source), Some(primary));
        assert_eq!(restored.entry(&source).unwrap().hash, Some(ContentHash::of_bytes(b"first")));
        assert_eq!(restored.path_to_guid(&source.join("first")), Some(sub_item));
        assert!(restored.path_to_guid(&deleted).is_none());
        assert!(restored.guid_to_path(&missing).is_none());
        assert!(restored.is_persistent(&plugin));
        assert!(restored.is_consistent());
    }

    #[test]
    fn manifest_format() {
        let (_root, mut project, mut index) = setup();
        project.config_mut().entry = "maps/main.map".to_owned();
        let source = project.content_path().join("a.txt");
        let guid = write_artifact(&project);
        let hash = ContentHash::of_bytes(b"Hello");
        index.register_asset(&source, guid, "Text", Some(hash));
        index.dump_bundle(&project).unwrap();

        let json = serde_json::from_str::<serde_json::Value>(&fs::read_to_string(project.index_path()).unwrap()).unwrap();
        assert_eq!(json["version"], 2);
        assert_eq!(json["content"][guid.to_string()][0], "a.txt");
        assert_eq!(json["content"][guid.to_string()][1], "Text");
        assert_eq!(json["content"][guid.to_string()][2], hash.to_string());
        assert_eq!(json["settings"]["entry"], "maps/main.map");
        assert_eq!(json["settings"]["project"], "Demo");
    }
}
