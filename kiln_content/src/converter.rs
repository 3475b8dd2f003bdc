use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use kiln_shared::{
    crossbeam_channel::Sender,
    log::{info, trace, warn},
};

use crate::{
    builder::{BuildFinished, BuilderId, CodeBuilder},
    common::{extract_base_name_from_path, extract_extension_from_path},
    settings::{ImportOptions, NoOptions},
    AssetSettings, Error, Result,
};

const TEMPLATE_NAME: &str = "${templateName}";

/// Result of [`Converter::convert_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// The artifacts were written to the import cache.
    Success,
    /// An unexpected error occurred during the conversion.
    InternalError,
    /// The content of the source file is not supported.
    Unsupported,
    /// The conversion was intentionally skipped.
    Skipped,
    /// The engine consumes the source file as it is. The source is copied into the import cache.
    CopyAsIs,
}

/// Produces engine-usable artifacts from the source files with the declared suffixes.
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    /// Lower case file suffixes without the dot, e.g. `["png", "jpg"]`.
    fn suffixes(&self) -> Vec<String>;

    /// Type name of the primary artifact.
    fn type_name(&self) -> &str;

    /// Format version of the produced artifacts. Raising it re-imports every asset of this converter.
    fn version(&self) -> u32 {
        1
    }

    fn convert_file(&self, settings: &mut AssetSettings) -> ReturnCode;

    /// Creates the import options with their default values.
    fn create_options(&self) -> Box<dyn ImportOptions> {
        Box::new(NoOptions)
    }

    /// Returns true if the asset can't be changed with an embedded editor.
    fn is_read_only(&self) -> bool {
        true
    }

    /// Reacts on the rename of a source file from `old_name` to `new_name` (base names).
    fn rename_asset(&self, _settings: &mut AssetSettings, _old_name: &str, _new_name: &str) {}

    /// File that new assets of this type are created from.
    fn template_path(&self) -> Option<PathBuf> {
        None
    }

    /// Icon shown for assets of this type when no thumbnail exists.
    fn icon_path(&self) -> Option<PathBuf> {
        None
    }

    /// Creates a new asset at `destination` from the template.
    fn create_from_template(&self, destination: &Path) -> Result<()> {
        let Some(template_path) = self.template_path() else {
            return Ok(());
        };
        create_from_template(&template_path, destination)
    }
}

pub(crate) fn create_from_template(template_path: &Path, destination: &Path) -> Result<()> {
    let content = fs::read_to_string(template_path)?;
    let base_name = extract_base_name_from_path(destination)?;
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(destination, content.replace(TEMPLATE_NAME, &base_name))?;
    info!("Created {destination:?} from template {template_path:?}");
    Ok(())
}

/// Registration of a converter. The builder facet is declared explicitly.
pub enum Registration {
    Converter(Box<dyn Converter>),
    Builder(Box<dyn CodeBuilder>),
}

impl Registration {
    pub fn converter(converter: impl Converter + 'static) -> Self {
        Self::Converter(Box::new(converter))
    }

    pub fn builder(builder: impl CodeBuilder + 'static) -> Self {
        Self::Builder(Box::new(builder))
    }
}

/// Result of a suffix lookup.
#[derive(Clone)]
pub enum Handler {
    Converter(Arc<dyn Converter>),
    Builder(BuilderId),
}

impl Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converter(converter) => write!(f, "Handler::Converter({})", converter.name()),
            Self::Builder(id) => write!(f, "Handler::Builder({id:?})"),
        }
    }
}

#[derive(Clone)]
enum SuffixEntry {
    Converter(Arc<dyn Converter>),
    Builder(BuilderId),
}

/// Maps file suffixes to the registered converters and keeps the ordered list of code builders.
pub struct ConverterRegistry {
    suffixes: BTreeMap<String, SuffixEntry>,
    builders: Vec<Box<dyn CodeBuilder>>,
    build_finished_sender: Sender<BuildFinished>,
}

impl ConverterRegistry {
    /// Creates an empty registry. Builders report finished builds to `build_finished_sender`.
    pub fn new(build_finished_sender: Sender<BuildFinished>) -> Self {
        Self {
            suffixes: BTreeMap::new(),
            builders: Vec::new(),
            build_finished_sender,
        }
    }

    /// Registers a converter for all of its suffixes. A converter without suffixes is rejected.
    ///
    /// When two converters claim the same suffix, the last registration wins.
    pub fn register(&mut self, registration: Registration) -> Result<()> {
        match registration {
            Registration::Converter(converter) => {
                let suffixes = converter.suffixes();
                if suffixes.is_empty() {
                    return Err(Error::ConverterWithoutSuffixes(converter.name().to_owned()));
                }
                let converter: Arc<dyn Converter> = Arc::from(converter);
                for suffix in suffixes {
                    self.insert(suffix, SuffixEntry::Converter(converter.clone()));
                }
                info!("Registered converter '{}'", converter.name());
            }
            Registration::Builder(mut builder) => {
                let suffixes = builder.suffixes();
                if suffixes.is_empty() {
                    return Err(Error::ConverterWithoutSuffixes(builder.name().to_owned()));
                }
                let id = BuilderId::new(self.builders.len());
                builder.state_mut().connect(id, self.build_finished_sender.clone());
                for suffix in suffixes {
                    self.insert(suffix, SuffixEntry::Builder(id));
                }
                info!("Registered code builder '{}' as {id:?}", builder.name());
                self.builders.push(builder);
            }
        }
        Ok(())
    }

    fn insert(&mut self, suffix: String, entry: SuffixEntry) {
        let suffix = suffix.to_lowercase();
        if self.suffixes.insert(suffix.clone(), entry).is_some() {
            warn!("Suffix '{suffix}' was registered again. The last registration wins.");
        }
    }

    /// Looks up the handler for the suffix of `path`.
    pub fn resolve(&self, path: &Path) -> Option<Handler> {
        let extension = extract_extension_from_path(path).ok()?;
        let handler = match self.suffixes.get(&extension)? {
            SuffixEntry::Converter(converter) => Handler::Converter(converter.clone()),
            SuffixEntry::Builder(id) => Handler::Builder(*id),
        };
        trace!("Resolved {path:?} to {handler:?}");
        Some(handler)
    }

    /// Looks up the handler for the source file of the settings.
    pub fn resolve_settings(&self, settings: &AssetSettings) -> Option<Handler> {
        self.resolve(settings.source())
    }

    /// Returns the converter for `path`. Code builders are not returned.
    pub fn converter(&self, path: &Path) -> Option<Arc<dyn Converter>> {
        match self.resolve(path)? {
            Handler::Converter(converter) => Some(converter),
            Handler::Builder(_) => None,
        }
    }

    pub fn is_registered(&self, extension: &str) -> bool {
        self.suffixes.contains_key(&extension.to_lowercase())
    }

    pub fn builder(&self, id: BuilderId) -> Option<&dyn CodeBuilder> {
        self.builders.get(id.index()).map(|builder| builder.as_ref())
    }

    pub fn builder_mut(&mut self, id: BuilderId) -> Option<&mut Box<dyn CodeBuilder>> {
        self.builders.get_mut(id.index())
    }

    pub fn builders(&self) -> impl Iterator<Item = (BuilderId, &dyn CodeBuilder)> {
        self.builders
            .iter()
            .enumerate()
            .map(|(index, builder)| (BuilderId::new(index), builder.as_ref()))
    }

    pub fn builder_ids(&self) -> Vec<BuilderId> {
        (0..self.builders.len()).map(BuilderId::new).collect()
    }

    /// Returns the sorted template paths of all converters and builders.
    pub fn templates(&self) -> Vec<PathBuf> {
        let mut templates = BTreeSet::new();
        for entry in self.suffixes.values() {
            if let SuffixEntry::Converter(converter) = entry {
                templates.extend(converter.template_path());
            }
        }
        for builder in &self.builders {
            templates.extend(builder.template_path());
        }
        templates.into_iter().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use kiln_shared::crossbeam_channel;
    use tempdir::TempDir;

    use super::*;
    use crate::builder::{BuilderState, CodeBuilder};

    /// Converter that writes the source bytes as artifact and reports the configured code.
    pub(crate) struct FakeConverter {
        pub suffixes: Vec<String>,
        pub type_name: String,
        pub return_code: ReturnCode,
    }

    impl FakeConverter {
        pub(crate) fn new(suffixes: &[&str], type_name: &str) -> Self {
            Self {
                suffixes: suffixes.iter().map(|suffix| suffix.to_string()).collect(),
                type_name: type_name.to_owned(),
                return_code: ReturnCode::Success,
            }
        }
    }

    impl Converter for FakeConverter {
        fn name(&self) -> &str {
            "FakeConverter"
        }

        fn suffixes(&self) -> Vec<String> {
            self.suffixes.clone()
        }

        fn type_name(&self) -> &str {
            &self.type_name
        }

        fn convert_file(&self, settings: &mut AssetSettings) -> ReturnCode {
            if self.return_code == ReturnCode::Success {
                let Ok(bytes) = fs::read(settings.source()) else {
                    return ReturnCode::InternalError;
                };
                if settings.save_binary(&bytes).is_err() {
                    return ReturnCode::InternalError;
                }
            }
            self.return_code
        }
    }

    #[derive(Default)]
    struct NoSourcesBuilder {
        state: BuilderState,
    }

    impl CodeBuilder for NoSourcesBuilder {
        fn name(&self) -> &str {
            "NoSourcesBuilder"
        }

        fn suffixes(&self) -> Vec<String> {
            vec!["cpp".to_owned(), "h".to_owned()]
        }

        fn state(&self) -> &BuilderState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut BuilderState {
            &mut self.state
        }

        fn build_project(&mut self, _project: &crate::ProjectSettings) -> Result<bool> {
            Ok(false)
        }
    }

    fn registry() -> ConverterRegistry {
        let (sender, _receiver) = crossbeam_channel::unbounded();
        ConverterRegistry::new(sender)
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let mut registry = registry();
        registry
            .register(Registration::converter(FakeConverter::new(&["TXT", "json"], "Text")))
            .unwrap();
        assert!(matches!(registry.resolve(Path::new("/content/a.txt")), Some(Handler::Converter(_))));
        assert!(matches!(registry.resolve(Path::new("/content/B.Json")), Some(Handler::Converter(_))));
        assert!(registry.resolve(Path::new("/content/c.png")).is_none());
        assert!(registry.resolve(Path::new("/content/readme")).is_none());
        assert!(registry.is_registered("TXT"));
    }

    #[test]
    fn converter_without_suffixes_is_rejected() {
        let mut registry = registry();
        let result = registry.register(Registration::converter(FakeConverter::new(&[], "Text")));
        assert!(matches!(result, Err(Error::ConverterWithoutSuffixes(_))));
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = registry();
        registry
            .register(Registration::converter(FakeConverter::new(&["txt"], "Text")))
            .unwrap();
        registry
            .register(Registration::converter(FakeConverter::new(&["txt"], "Script")))
            .unwrap();
        let converter = registry.converter(Path::new("a.txt")).unwrap();
        assert_eq!(converter.type_name(), "Script");
    }

    #[test]
    fn builders_are_listed_in_order() {
        let mut registry = registry();
        registry.register(Registration::builder(NoSourcesBuilder::default())).unwrap();
        registry.register(Registration::builder(NoSourcesBuilder::default())).unwrap();
        let ids = registry.builder_ids();
        assert_eq!(ids, vec![BuilderId::new(0), BuilderId::new(1)]);
        assert!(matches!(registry.resolve(Path::new("src/player.cpp")), Some(Handler::Builder(id)) if id == BuilderId::new(1)));
        assert!(registry.converter(Path::new("src/player.cpp")).is_none());
        assert_eq!(registry.builder(BuilderId::new(0)).unwrap().state().id(), Some(BuilderId::new(0)));
    }

    #[test]
    fn create_from_template_replaces_name() {
        let root = TempDir::new("root").unwrap();
        let template = root.path().join("template.txt");
        fs::write(&template, "class ${templateName} {};").unwrap();
        let destination = root.path().join("scripts/Player.txt");
        create_from_template(&template, &destination).unwrap();
        assert_eq!(fs::read_to_string(&destination).unwrap(), "class Player {};");
    }
}
