//! Converters that are registered by [`AssetManager::with_default_converters`](crate::AssetManager::with_default_converters).

use std::fs;

use kiln_shared::{
    log::{error, warn},
    serde_json::{self, json, Value},
};

use crate::{
    converter::{Converter, ReturnCode},
    settings::{ImportOptions, PropertyDef, Schema},
    AssetSettings,
};

/// Type name of the artifacts of the [`PrefabConverter`].
pub const PREFAB_TYPE_NAME: &str = "Prefab";

/// Suffix of prefab files.
pub const PREFAB_SUFFIX: &str = "fab";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TextOptions {
    /// Removes the whitespace at the start and the end of the text.
    pub trim: bool,
}

impl Schema for TextOptions {
    const PROPERTIES: &'static [PropertyDef<Self>] = &[PropertyDef {
        name: "trim",
        alias: Some("Trim"),
        get: |options| json!(options.trim),
        set: |options, value| value.as_bool().map(|trim| options.trim = trim).is_some(),
        default: || json!(false),
    }];
}

/// Stores text files as UTF-8 artifacts.
#[derive(Debug, Default)]
pub struct TextConverter;

impl Converter for TextConverter {
    fn name(&self) -> &str {
        "TextConverter"
    }

    fn suffixes(&self) -> Vec<String> {
        ["txt", "json", "html", "htm", "xml", "csv", "md", "yaml"]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    fn type_name(&self) -> &str {
        "Text"
    }

    fn convert_file(&self, settings: &mut AssetSettings) -> ReturnCode {
        let bytes = match fs::read(settings.source()) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Failed to read {:?}: {err}", settings.source());
                return ReturnCode::InternalError;
            }
        };
        let Ok(text) = String::from_utf8(bytes) else {
            error!("{:?} is not valid UTF-8", settings.source());
            return ReturnCode::InternalError;
        };
        let trim = settings.options::<TextOptions>().is_some_and(|options| options.trim);
        let text = if trim { text.trim() } else { text.as_str() };
        match settings.save_binary(text.as_bytes()) {
            Ok(()) => ReturnCode::Success,
            Err(err) => {
                error!("Failed to write the artifact of {:?}: {err}", settings.source());
                ReturnCode::InternalError
            }
        }
    }

    fn create_options(&self) -> Box<dyn ImportOptions> {
        Box::new(TextOptions::default())
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

/// Hands the source files to the engine as they are.
#[derive(Debug)]
pub struct RawConverter {
    suffixes: Vec<String>,
    type_name: String,
}

impl RawConverter {
    pub fn new(suffixes: &[&str], type_name: impl Into<String>) -> Self {
        Self {
            suffixes: suffixes.iter().map(|suffix| suffix.to_lowercase()).collect(),
            type_name: type_name.into(),
        }
    }
}

impl Converter for RawConverter {
    fn name(&self) -> &str {
        "RawConverter"
    }

    fn suffixes(&self) -> Vec<String> {
        self.suffixes.clone()
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn convert_file(&self, _settings: &mut AssetSettings) -> ReturnCode {
        ReturnCode::CopyAsIs
    }
}

/// Stores prefabs, i.e. JSON descriptions of object hierarchies.
#[derive(Debug, Default)]
pub struct PrefabConverter;

impl PrefabConverter {
    /// Returns the serialized prefab file for the given object hierarchy.
    pub fn payload(root: &Value) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&json!({ "version": 1, "root": root }))
    }
}

impl Converter for PrefabConverter {
    fn name(&self) -> &str {
        "PrefabConverter"
    }

    fn suffixes(&self) -> Vec<String> {
        vec![PREFAB_SUFFIX.to_owned()]
    }

    fn type_name(&self) -> &str {
        PREFAB_TYPE_NAME
    }

    fn convert_file(&self, settings: &mut AssetSettings) -> ReturnCode {
        let content = match fs::read_to_string(settings.source()) {
            Ok(content) => content,
            Err(err) => {
                error!("Failed to read {:?}: {err}", settings.source());
                return ReturnCode::InternalError;
            }
        };
        let prefab = match serde_json::from_str::<Value>(&content) {
            Ok(prefab) => prefab,
            Err(err) => {
                warn!("{:?} is not a prefab: {err}", settings.source());
                return ReturnCode::Unsupported;
            }
        };
        let Some(root) = prefab.get("root") else {
            warn!("Prefab {:?} has no root object", settings.source());
            return ReturnCode::Unsupported;
        };
        match serde_json::to_vec(root).map(|bytes| settings.save_binary(&bytes)) {
            Ok(Ok(())) => ReturnCode::Success,
            Ok(Err(err)) => {
                error!("Failed to write the artifact of {:?}: {err}", settings.source());
                ReturnCode::InternalError
            }
            Err(err) => {
                error!("Failed to serialize prefab {:?}: {err}", settings.source());
                ReturnCode::InternalError
            }
        }
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use kiln_test::write_file;
    use tempdir::TempDir;

    use super::*;

    fn settings(root: &TempDir, name: &str, content: &[u8], converter: &dyn Converter) -> AssetSettings {
        let source = write_file(root.path(), name, content);
        AssetSettings::new(source, root.path().join("import"), converter.type_name(), converter.create_options())
    }

    #[test]
    fn text_is_stored() {
        let root = TempDir::new("root").unwrap();
        let mut settings = settings(&root, "a.txt", b"  Hello World!\n", &TextConverter);
        assert_eq!(TextConverter.convert_file(&mut settings), ReturnCode::Success);
        assert_eq!(fs::read_to_string(settings.artifact_path()).unwrap(), "  Hello World!\n");
    }

    #[test]
    fn text_option_trims() {
        let root = TempDir::new("root").unwrap();
        let mut settings = settings(&root, "a.txt", b"  Hello World!\n", &TextConverter);
        settings.options_mut::<TextOptions>().unwrap().trim = true;
        assert_eq!(TextConverter.convert_file(&mut settings), ReturnCode::Success);
        assert_eq!(fs::read_to_string(settings.artifact_path()).unwrap(), "Hello World!");
        assert_eq!(settings.import_options().save().get("trim"), Some(&json!(true)));
    }

    #[test]
    fn invalid_text_fails() {
        let root = TempDir::new("root").unwrap();
        let mut settings = settings(&root, "a.txt", &[0xff, 0xfe, 0x00], &TextConverter);
        assert_eq!(TextConverter.convert_file(&mut settings), ReturnCode::InternalError);
        assert!(!settings.artifact_path().exists());
    }

    #[test]
    fn raw_is_copied() {
        let root = TempDir::new("root").unwrap();
        let converter = RawConverter::new(&["PNG"], "Texture");
        assert_eq!(converter.suffixes(), vec!["png".to_owned()]);
        let mut settings = settings(&root, "a.png", b"\x89PNG", &converter);
        assert_eq!(converter.convert_file(&mut settings), ReturnCode::CopyAsIs);
    }

    #[test]
    fn prefab_root_is_stored() {
        let root = TempDir::new("root").unwrap();
        let payload = PrefabConverter::payload(&json!({ "name": "Player" })).unwrap();
        let mut settings = settings(&root, "player.fab", payload.as_bytes(), &PrefabConverter);
        assert_eq!(PrefabConverter.convert_file(&mut settings), ReturnCode::Success);
        let artifact = fs::read_to_string(settings.artifact_path()).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&artifact).unwrap(), json!({ "name": "Player" }));

        let mut broken = self::settings(&root, "broken.fab", b"{", &PrefabConverter);
        assert_eq!(PrefabConverter.convert_file(&mut broken), ReturnCode::Unsupported);
    }
}
