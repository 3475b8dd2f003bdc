use std::{
    any::Any,
    collections::BTreeMap,
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
};

use kiln_shared::{
    log::{trace, warn},
    serde_json::{self, json, Map, Value},
};
use serde::Deserialize;

use crate::{
    builder::BuilderId,
    common::{meta_path, write_atomically},
    guid::type_id,
    ContentHash, Guid, Result,
};

/// Type name of assets that are handled by a code builder.
pub const CODE_TYPE_NAME: &str = "Code";

/// Type name of assets without a converter.
pub const INVALID_TYPE_NAME: &str = "Invalid";

/// Describes one import option of a settings type.
///
/// Every settings type lists its options in [`Schema::PROPERTIES`]. The sidecar
/// serialization only works with this list so adding an option to a settings type
/// doesn't require changes to the serializer.
pub struct PropertyDef<T> {
    pub name: &'static str,
    /// Older name under which the option might still be stored.
    pub alias: Option<&'static str>,
    pub get: fn(&T) -> Value,
    /// Returns false if the value has the wrong type.
    pub set: fn(&mut T, &Value) -> bool,
    pub default: fn() -> Value,
}

/// Static list of the import options of a settings type.
pub trait Schema: Debug + Send + Sync + Sized + 'static {
    const PROPERTIES: &'static [PropertyDef<Self>];
}

/// Object safe access to the import options of a converter.
pub trait ImportOptions: Debug + Send + Sync + Any {
    /// Returns all options by name.
    fn save(&self) -> Map<String, Value>;

    /// Applies all options that are present in `map`. Unknown keys are ignored.
    fn load(&mut self, map: &Map<String, Value>);

    /// Resets all options to their default values.
    fn reset(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Schema> ImportOptions for T {
    fn save(&self) -> Map<String, Value> {
        T::PROPERTIES
            .iter()
            .map(|property| (property.name.to_owned(), (property.get)(self)))
            .collect()
    }

    fn load(&mut self, map: &Map<String, Value>) {
        for property in T::PROPERTIES {
            let value = map
                .get(property.name)
                .or_else(|| property.alias.and_then(|alias| map.get(alias)));
            if let Some(value) = value {
                if !(property.set)(self, value) {
                    warn!("Ignoring value {value} of import option '{}'", property.name);
                }
            }
        }
    }

    fn reset(&mut self) {
        for property in T::PROPERTIES {
            (property.set)(self, &(property.default)());
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Import options of converters that don't have any.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoOptions;

impl Schema for NoOptions {
    const PROPERTIES: &'static [PropertyDef<Self>] = &[];
}

/// Artifact that is extracted from a source file in addition to the primary artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct SubItem {
    pub guid: Guid,
    pub type_name: String,
    /// Set before a conversion. A sub-item that is still dirty afterwards was not produced again.
    pub dirty: bool,
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct SidecarFile {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    guid: Option<Guid>,
    #[serde(default)]
    settings: Map<String, Value>,
    #[serde(default, rename = "subItems")]
    sub_items: BTreeMap<String, Vec<Value>>,
}

/// Import state of a single source file.
///
/// The durable copy lives in the sidecar file `<source>.set` next to the source file.
#[derive(Debug)]
pub struct AssetSettings {
    source: PathBuf,
    import_path: PathBuf,
    destination: Guid,
    hash: Option<ContentHash>,
    version: u32,
    current_version: u32,
    type_name: String,
    sub_items: BTreeMap<String, SubItem>,
    options: Box<dyn ImportOptions>,
    builder: Option<BuilderId>,
    is_directory: bool,
    is_read_only: bool,
    modified: bool,
}

impl AssetSettings {
    /// Creates settings with a fresh destination [`Guid`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_content::{AssetSettings, NoOptions};
    /// let settings = AssetSettings::new("/content/a.txt", "/cache/import", "Text", Box::new(NoOptions));
    /// assert_eq!(settings.type_name(), "Text");
    /// assert!(settings.artifact_path().starts_with("/cache/import"));
    /// ```
    pub fn new(
        source: impl Into<PathBuf>,
        import_path: impl Into<PathBuf>,
        type_name: impl Into<String>,
        options: Box<dyn ImportOptions>,
    ) -> Self {
        Self {
            source: source.into(),
            import_path: import_path.into(),
            destination: Guid::new(),
            hash: None,
            version: 0,
            current_version: 0,
            type_name: type_name.into(),
            sub_items: BTreeMap::new(),
            options,
            builder: None,
            is_directory: false,
            is_read_only: true,
            modified: false,
        }
    }

    /// Sets the format version that the converter currently produces.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Marks the settings as belonging to a source file that is compiled by the given builder.
    pub fn with_builder(mut self, builder: BuilderId) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_read_only(mut self, is_read_only: bool) -> Self {
        self.is_read_only = is_read_only;
        self
    }

    pub fn with_directory(mut self) -> Self {
        self.is_directory = true;
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> Guid {
        self.destination
    }

    pub fn set_destination(&mut self, destination: Guid) {
        self.destination = destination;
    }

    /// Path of the primary artifact in the import cache.
    pub fn artifact_path(&self) -> PathBuf {
        self.import_path.join(self.destination.to_string())
    }

    pub fn import_path(&self) -> &Path {
        &self.import_path
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn hash(&self) -> Option<ContentHash> {
        self.hash
    }

    pub fn set_hash(&mut self, hash: ContentHash) {
        self.hash = Some(hash);
    }

    /// Format version that the converter produces.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Format version of the artifacts on disk.
    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn set_current_version(&mut self, version: u32) {
        self.current_version = version;
    }

    pub fn builder(&self) -> Option<BuilderId> {
        self.builder
    }

    pub fn is_code(&self) -> bool {
        self.builder.is_some()
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Returns true if the asset can't be changed with an embedded editor.
    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Marks the import options as changed so that the user can decide to save and re-import them.
    pub fn set_modified(&mut self) {
        self.modified = true;
    }

    pub fn import_options(&self) -> &dyn ImportOptions {
        self.options.as_ref()
    }

    pub fn import_options_mut(&mut self) -> &mut dyn ImportOptions {
        self.options.as_mut()
    }

    /// Returns the typed import options of the converter.
    pub fn options<T: ImportOptions>(&self) -> Option<&T> {
        self.options.as_any().downcast_ref::<T>()
    }

    pub fn options_mut<T: ImportOptions>(&mut self) -> Option<&mut T> {
        self.options.as_any_mut().downcast_mut::<T>()
    }

    /// Returns true if the asset has to be converted again.
    ///
    /// That is the case when the converter produces a newer format version, when the
    /// source file changed since the last conversion, or when an artifact that belongs
    /// to the asset is missing in the import cache. Code assets don't have a primary
    /// artifact because they are compiled by a builder.
    pub fn is_outdated(&mut self) -> bool {
        if self.version > self.current_version {
            trace!("{:?} is outdated because version {} > {}", self.source, self.version, self.current_version);
            return true;
        }

        let live_hash = match ContentHash::of_file(&self.source) {
            Ok(live_hash) => live_hash,
            Err(err) => {
                trace!("{:?} is outdated because it can't be read: {err}", self.source);
                return true;
            }
        };
        if self.hash != Some(live_hash) {
            trace!("{:?} is outdated because the content changed", self.source);
            return true;
        }
        if !self.is_code() && !self.artifact_path().exists() {
            trace!("{:?} is outdated because the artifact {} is missing", self.source, self.destination);
            return true;
        }
        if let Some((key, _)) = self
            .sub_items
            .iter()
            .find(|(_, sub_item)| !sub_item.dirty && !self.import_path.join(sub_item.guid.to_string()).exists())
        {
            trace!("{:?} is outdated because the artifact of sub-item '{key}' is missing", self.source);
            return true;
        }
        false
    }

    /// Stores the hash of the converted source and the converted format version.
    ///
    /// The source is hashed again because it may have changed since the last
    /// [`is_outdated`](Self::is_outdated) check.
    pub fn commit_conversion(&mut self) -> Result<()> {
        self.hash = Some(ContentHash::of_file(&self.source)?);
        self.current_version = self.version;
        Ok(())
    }

    /// Writes the primary artifact.
    pub fn save_binary(&self, bytes: &[u8]) -> Result<()> {
        write_atomically(&self.artifact_path(), bytes)?;
        Ok(())
    }

    /// Writes the artifact of the sub-item `key` and returns its [`Guid`].
    ///
    /// An existing sub-item keeps its [`Guid`] so that references to it stay valid.
    pub fn save_sub_data(&mut self, bytes: &[u8], key: &str, type_name: &str) -> Result<Guid> {
        let guid = self.sub_item_or_new(key);
        write_atomically(&self.import_path.join(guid.to_string()), bytes)?;
        self.set_sub_item(key, guid, type_name);
        Ok(guid)
    }

    pub fn sub_keys(&self) -> Vec<String> {
        self.sub_items.keys().cloned().collect()
    }

    pub fn sub_items(&self) -> &BTreeMap<String, SubItem> {
        &self.sub_items
    }

    pub fn sub_item(&self, key: &str) -> Option<&SubItem> {
        self.sub_items.get(key)
    }

    /// Returns the [`Guid`] of the sub-item or a new one if it doesn't exist yet.
    pub fn sub_item_or_new(&self, key: &str) -> Guid {
        self.sub_items.get(key).map(|sub_item| sub_item.guid).unwrap_or_default()
    }

    pub fn sub_type_name(&self, key: &str) -> Option<&str> {
        self.sub_items.get(key).map(|sub_item| sub_item.type_name.as_str())
    }

    /// Inserts or replaces a clean sub-item. Existing extra data is kept.
    pub fn set_sub_item(&mut self, key: &str, guid: Guid, type_name: &str) {
        if key.is_empty() {
            return;
        }
        let data = self.sub_items.remove(key).and_then(|sub_item| sub_item.data);
        self.sub_items.insert(
            key.to_owned(),
            SubItem {
                guid,
                type_name: type_name.to_owned(),
                dirty: false,
                data,
            },
        );
    }

    pub fn set_sub_item_data(&mut self, key: &str, data: Map<String, Value>) {
        if let Some(sub_item) = self.sub_items.get_mut(key) {
            sub_item.data = Some(data);
        }
    }

    pub fn set_sub_items_dirty(&mut self) {
        for sub_item in self.sub_items.values_mut() {
            sub_item.dirty = true;
        }
    }

    /// Marks all sub-items as clean again after a conversion that didn't produce anything.
    pub fn clear_dirty_sub_items(&mut self) {
        for sub_item in self.sub_items.values_mut() {
            sub_item.dirty = false;
        }
    }

    /// Removes the sub-items that weren't produced by the last conversion.
    pub fn remove_dirty_sub_items(&mut self) -> Vec<(String, SubItem)> {
        let dirty = self
            .sub_items
            .iter()
            .filter(|(_, sub_item)| sub_item.dirty)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        dirty
            .into_iter()
            .filter_map(|key| self.sub_items.remove(&key).map(|sub_item| (key, sub_item)))
            .collect()
    }

    /// Reads the sidecar file. Returns false if it doesn't exist or can't be parsed.
    pub fn load_settings(&mut self) -> bool {
        let path = meta_path(&self.source);
        let Ok(content) = fs::read_to_string(&path) else {
            return false;
        };
        let sidecar = match serde_json::from_str::<SidecarFile>(&content) {
            Ok(sidecar) => sidecar,
            Err(err) => {
                warn!("Ignoring corrupt sidecar file {path:?}: {err}");
                return false;
            }
        };

        self.options.load(&sidecar.settings);
        if let Some(guid) = sidecar.guid {
            self.destination = guid;
        }
        if let Some(hash) = sidecar.md5.as_deref().and_then(ContentHash::parse) {
            self.hash = Some(hash);
        }
        if let Some(version) = sidecar.version {
            self.current_version = version;
        }
        for (key, values) in sidecar.sub_items {
            let Some(guid) = values.first().and_then(Value::as_str).and_then(|guid| Guid::parse(guid).ok()) else {
                warn!("Ignoring sub-item '{key}' without a valid GUID in {path:?}");
                continue;
            };
            let type_name = match (values.get(1), values.get(3).and_then(Value::as_str)) {
                (Some(Value::String(type_name)), _) => type_name.clone(),
                (_, Some(type_name)) => type_name.to_owned(),
                _ => INVALID_TYPE_NAME.to_owned(),
            };
            self.set_sub_item(&key, guid, &type_name);
            if let Some(Value::Object(data)) = values.get(2) {
                if !data.is_empty() {
                    self.set_sub_item_data(&key, data.clone());
                }
            }
        }

        self.modified = false;
        true
    }

    /// Writes the sidecar file. Dirty sub-items are not persisted.
    pub fn save_settings(&mut self) -> Result<()> {
        let sub_items = self
            .sub_items
            .iter()
            .filter(|(_, sub_item)| !sub_item.dirty)
            .map(|(key, sub_item)| {
                let data = sub_item.data.clone().unwrap_or_default();
                (
                    key.clone(),
                    json!([sub_item.guid, type_id(&sub_item.type_name), data, sub_item.type_name]),
                )
            })
            .collect::<Map<_, _>>();

        let sidecar = json!({
            "version": self.current_version,
            "md5": self.hash.map(|hash| hash.to_string()).unwrap_or_default(),
            "guid": self.destination,
            "type": type_id(&self.type_name),
            "settings": self.options.save(),
            "subItems": sub_items,
        });

        write_atomically(&meta_path(&self.source), serde_json::to_string_pretty(&sidecar)?)?;
        self.modified = false;
        Ok(())
    }

    /// Discards changed import options and reads the stored ones again.
    pub fn revert_options(&mut self) -> bool {
        self.options.reset();
        let loaded = self.load_settings();
        self.modified = false;
        loaded
    }
}

#[cfg(test)]
mod tests {
    use kiln_shared::indoc::indoc;
    use tempdir::TempDir;

    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct TestOptions {
        scale: f64,
        name: String,
    }

    impl Schema for TestOptions {
        const PROPERTIES: &'static [PropertyDef<Self>] = &[
            PropertyDef {
                name: "scale",
                alias: Some("Scale"),
                get: |options| json!(options.scale),
                set: |options, value| value.as_f64().map(|scale| options.scale = scale).is_some(),
                default: || json!(1.0),
            },
            PropertyDef {
                name: "name",
                alias: None,
                get: |options| json!(options.name),
                set: |options, value| value.as_str().map(|name| options.name = name.to_owned()).is_some(),
                default: || json!(""),
            },
        ];
    }

    struct Fixture {
        root: TempDir,
        import_path: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new("root").unwrap();
            let import_path = root.path().join("import");
            fs::create_dir_all(&import_path).unwrap();
            Self { root, import_path }
        }

        fn source(&self, content: &str) -> PathBuf {
            let path = self.root.path().join("a.txt");
            fs::write(&path, content).unwrap();
            path
        }

        fn settings(&self, source: &Path) -> AssetSettings {
            AssetSettings::new(source, &self.import_path, "Text", Box::new(TestOptions::default())).with_version(1)
        }
    }

    #[test]
    fn fresh_settings_are_outdated() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        assert!(!settings.load_settings());
        assert!(settings.is_outdated());
    }

    #[test]
    fn converted_asset_is_not_outdated() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        assert!(settings.is_outdated());
        settings.save_binary(b"Hello World!").unwrap();
        settings.commit_conversion().unwrap();
        assert!(!settings.is_outdated());
        assert!(!settings.is_outdated(), "checking must not change the result");
    }

    #[test]
    fn changed_source_is_outdated() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        settings.save_binary(b"Hello World!").unwrap();
        settings.commit_conversion().unwrap();

        fixture.source("Hello Universe!");
        assert!(settings.is_outdated());
    }

    #[test]
    fn commit_hashes_the_converted_source() {
        let fixture = Fixture::new();
        let source = fixture.source("one");
        let mut settings = fixture.settings(&source);
        settings.save_binary(b"one").unwrap();
        settings.commit_conversion().unwrap();
        assert!(!settings.is_outdated());

        // Converted without checking first, e.g. a forced import.
        fixture.source("two");
        settings.save_binary(b"two").unwrap();
        settings.commit_conversion().unwrap();

        fixture.source("one");
        assert!(settings.is_outdated());
    }

    #[test]
    fn missing_artifact_is_outdated() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        settings.save_binary(b"Hello World!").unwrap();
        settings.commit_conversion().unwrap();

        fs::remove_file(settings.artifact_path()).unwrap();
        assert!(settings.is_outdated());
    }

    #[test]
    fn code_doesnt_need_an_artifact() {
        let fixture = Fixture::new();
        let source = fixture.source("class Player {};");
        let mut settings = fixture.settings(&source).with_builder(BuilderId::new(0));
        settings.commit_conversion().unwrap();
        assert!(!settings.artifact_path().exists());
        assert!(!settings.is_outdated());
    }

    #[test]
    fn newer_version_is_outdated() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        settings.save_binary(b"Hello World!").unwrap();
        settings.commit_conversion().unwrap();
        assert_eq!(settings.current_version(), 1);

        settings.set_version(2);
        assert!(settings.is_outdated());
        settings.commit_conversion().unwrap();
        assert!(settings.current_version() <= settings.version());
        assert!(!settings.is_outdated());
    }

    #[test]
    fn missing_sub_item_artifact_is_outdated() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        settings.save_binary(b"Hello World!").unwrap();
        let guid = settings.save_sub_data(b"sub", "Sub", "Mesh").unwrap();
        settings.commit_conversion().unwrap();
        assert!(!settings.is_outdated());

        fs::remove_file(fixture.import_path.join(guid.to_string())).unwrap();
        assert!(settings.is_outdated());
    }

    #[test]
    fn save_sub_data_keeps_guid() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        let first = settings.save_sub_data(b"one", "Sub", "Mesh").unwrap();
        let second = settings.save_sub_data(b"two", "Sub", "Mesh").unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(fixture.import_path.join(first.to_string())).unwrap(), b"two");
        assert_eq!(settings.sub_type_name("Sub"), Some("Mesh"));
    }

    #[test]
    fn round_trip() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        settings.options_mut::<TestOptions>().unwrap().scale = 2.5;
        settings.save_binary(b"Hello World!").unwrap();
        settings.save_sub_data(b"sub1", "First", "Mesh").unwrap();
        settings.save_sub_data(b"sub2", "Second", "Texture").unwrap();
        settings.set_sub_item_data("First", Map::from_iter([("lod".to_owned(), json!(2))]));
        settings.commit_conversion().unwrap();
        settings.save_settings().unwrap();

        let mut loaded = fixture.settings(&source);
        assert!(loaded.load_settings());
        assert_eq!(loaded.destination(), settings.destination());
        assert_eq!(loaded.hash(), settings.hash());
        assert_eq!(loaded.current_version(), settings.current_version());
        assert_eq!(loaded.sub_items(), settings.sub_items());
        assert_eq!(loaded.options::<TestOptions>().unwrap().scale, 2.5);
        assert!(!loaded.is_outdated());
    }

    #[test]
    fn dirty_sub_items_are_not_saved() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let mut settings = fixture.settings(&source);
        settings.save_sub_data(b"sub1", "First", "Mesh").unwrap();
        settings.set_sub_items_dirty();
        settings.save_sub_data(b"sub2", "Second", "Mesh").unwrap();
        settings.save_settings().unwrap();

        let mut loaded = fixture.settings(&source);
        assert!(loaded.load_settings());
        assert_eq!(loaded.sub_keys(), vec!["Second".to_owned()]);

        let removed = settings.remove_dirty_sub_items();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "First");
    }

    #[test]
    fn load_handwritten_sidecar() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        let sidecar = indoc! {r#"
            {
                "version": 3,
                "md5": "{00000000-0000-0000-0000-000000000000}",
                "guid": "{67e55044-10b1-426f-9247-bb680e5fe0c8}",
                "type": 7,
                "settings": { "Scale": 4.0, "name": 12 },
                "subItems": {
                    "Trunk": ["{a1a2a3a4-b1b2-c1c2-d1d2-d3d4d5d6d7d8}", "Mesh"],
                    "Broken": ["not a guid", 1]
                }
            }
        "#};
        fs::write(meta_path(&source), sidecar).unwrap();

        let mut settings = fixture.settings(&source);
        assert!(settings.load_settings());
        assert_eq!(settings.destination().to_string(), "{67e55044-10b1-426f-9247-bb680e5fe0c8}");
        assert_eq!(settings.current_version(), 3);
        assert_eq!(settings.options::<TestOptions>().unwrap().scale, 4.0);
        assert_eq!(settings.options::<TestOptions>().unwrap().name, "");
        assert_eq!(settings.sub_keys(), vec!["Trunk".to_owned()]);
        assert_eq!(settings.sub_type_name("Trunk"), Some("Mesh"));
        assert!(settings.is_outdated());
    }

    #[test]
    fn corrupt_sidecar_is_ignored() {
        let fixture = Fixture::new();
        let source = fixture.source("Hello World!");
        fs::write(meta_path(&source), "{ this is not json").unwrap();
        let mut settings = fixture.settings(&source);
        let guid = settings.destination();
        assert!(!settings.load_settings());
        assert_eq!(settings.destination(), guid);
    }

    #[test]
    fn reset_options() {
        let mut options = TestOptions {
            scale: 3.0,
            name: "tree".to_owned(),
        };
        options.reset();
        assert_eq!(options, TestOptions { scale: 1.0, name: String::new() });
        assert_eq!(options.save().get("scale"), Some(&json!(1.0)));
    }
}
