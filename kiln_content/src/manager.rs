use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use kiln_shared::{
    crossbeam_channel::{self, Receiver, Sender},
    log::{error, info, trace, warn},
    parking_lot::Mutex,
    serde_json::Value,
    walkdir::WalkDir,
};

use crate::{
    builder::{BuildFinished, BuilderId, CodeBuilder, CommandToolchain, NativeCodeBuilder},
    common::{
        extract_base_name_from_path, extract_extension_from_path, extract_file_name_from_path, find_free_name, is_meta_file, meta_path,
    },
    converter::{create_from_template, ConverterRegistry, Handler, Registration, ReturnCode},
    converters::{PrefabConverter, TextConverter, PREFAB_SUFFIX, PREFAB_TYPE_NAME},
    index::{AssetIndex, BundleManifest},
    queue::{ImportQueue, PumpState, SharedSettings},
    runtime::Runtime,
    settings::{AssetSettings, NoOptions, CODE_TYPE_NAME, INVALID_TYPE_NAME},
    watcher::{ContentWatcher, WatchEvent},
    Error, Guid, ProjectSettings, Result,
};

/// Interval in which [`AssetManager::tick`] should be called while an import is running.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Time that a file has to be unchanged before the watcher reports it.
const WATCH_DELAY: Duration = Duration::from_millis(500);

/// Notifications of the [`AssetManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DirectoryChanged(PathBuf),
    FileChanged(PathBuf),
    ImportStarted { count: usize, message: String },
    Imported { path: PathBuf, type_name: String },
    ImportFinished,
    BuildSuccessful(bool),
    PrefabCreated { id: u32, guid: Guid },
}

/// Answer of the user when the import options of an asset were changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportDecision {
    /// Save the options and import the asset again.
    SaveAndReimport,
    /// Discard the changes.
    Revert,
    /// Keep the changes without saving them.
    Cancel,
}

/// Keeps the artifacts of a project in sync with its content directory.
///
/// The manager owns the converters, the index of the imported assets and the import
/// queue. Imports run cooperatively: [`AssetManager::tick`] converts at most one asset
/// per call and has to be called regularly (see [`TICK_INTERVAL`]) until the
/// [`Event::ImportFinished`] notification arrives.
///
/// # Example
///
/// ```rust
/// use kiln_content::{AssetManager, Event, ProjectSettings, runtime::NullRuntime};
/// let root = std::env::temp_dir().join("kiln_manager_doc");
/// let project = ProjectSettings::new(&root, "Demo").unwrap();
/// std::fs::write(project.content_path().join("readme.txt"), "Hello World!").unwrap();
///
/// let mut asset_manager = AssetManager::new(project, Box::new(NullRuntime))
///     .with_default_converters()
///     .unwrap();
/// let events = asset_manager.observe();
/// asset_manager.rescan(false);
/// while asset_manager.is_busy() {
///     asset_manager.tick();
/// }
/// assert!(events.try_iter().any(|event| event == Event::ImportFinished));
/// ```
pub struct AssetManager {
    project: ProjectSettings,
    registry: ConverterRegistry,
    runtime: Box<dyn Runtime>,
    index: AssetIndex,
    settings: BTreeMap<PathBuf, SharedSettings>,
    queue: ImportQueue,
    state: PumpState,
    attempted_builds: BTreeSet<BuilderId>,
    senders: Vec<Sender<Event>>,
    build_finished: Receiver<BuildFinished>,
    watcher: Option<ContentWatcher>,
    watch_changes: bool,
}

impl AssetManager {
    pub fn new(project: ProjectSettings, runtime: Box<dyn Runtime>) -> Self {
        let (build_finished_sender, build_finished) = crossbeam_channel::unbounded();
        info!("Creating AssetManager for project '{}'", project.project_name());
        let mut index = AssetIndex::new(project.content_path(), project.import_path());
        let index_path = project.index_path();
        if index_path.exists() {
            // Assets that fail to convert again keep the artifacts of the last session.
            match BundleManifest::load(&index_path) {
                Ok(manifest) => {
                    let loaded = index.load_bundle(&manifest);
                    info!("Restored {loaded} of {} entries from {index_path:?}", manifest.content.len());
                }
                Err(err) => warn!("Failed to load the manifest {index_path:?}: {err}"),
            }
        }
        Self {
            project,
            registry: ConverterRegistry::new(build_finished_sender),
            runtime,
            index,
            settings: BTreeMap::new(),
            queue: ImportQueue::new(),
            state: PumpState::Idle,
            attempted_builds: BTreeSet::new(),
            senders: Vec::new(),
            build_finished,
            watcher: None,
            watch_changes: false,
        }
    }

    /// Registers the built-in converters and, when the project configures a toolchain, the native code builder.
    pub fn with_default_converters(mut self) -> Result<Self> {
        self.register(Registration::converter(TextConverter))?;
        self.register(Registration::converter(PrefabConverter))?;
        if let Some(command) = self.project.config().build.clone() {
            self.register(Registration::builder(NativeCodeBuilder::new(Box::new(CommandToolchain::new(command)))))?;
        }
        Ok(self)
    }

    pub fn register(&mut self, registration: Registration) -> Result<()> {
        self.registry.register(registration)
    }

    /// Starts watching the content directory when the next import finished.
    pub fn set_watching(&mut self, watch_changes: bool) {
        self.watch_changes = watch_changes;
        if !watch_changes {
            self.watcher = None;
        }
    }

    /// Returns a channel that can be used to observe [`Event`]s.
    pub fn observe(&mut self) -> Receiver<Event> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.senders.push(sender);
        receiver
    }

    fn emit(&mut self, event: Event) {
        trace!("Sending {event:?}");
        self.senders.retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn project(&self) -> &ProjectSettings {
        &self.project
    }

    pub fn index(&self) -> &AssetIndex {
        &self.index
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Returns true while an import or a build is running.
    pub fn is_busy(&self) -> bool {
        self.state != PumpState::Idle
    }

    /// Returns true if assets wait for their import or a code builder has to build.
    pub fn is_outdated(&self) -> bool {
        !self.queue.is_empty()
            || self
                .registry
                .builders()
                .any(|(_, builder)| !builder.is_empty() && builder.is_outdated())
    }

    pub fn converter_for(&self, path: &Path) -> Option<Handler> {
        self.registry.resolve(path)
    }

    pub fn builders(&self) -> impl Iterator<Item = (BuilderId, &dyn CodeBuilder)> {
        self.registry.builders()
    }

    pub fn templates(&self) -> Vec<PathBuf> {
        self.registry.templates()
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        self.index.labels()
    }

    pub fn path_to_guid(&self, path: &Path) -> Option<Guid> {
        self.index.path_to_guid(path)
    }

    pub fn guid_to_path(&self, guid: &Guid) -> Option<&Path> {
        self.index.guid_to_path(guid)
    }

    pub fn register_asset(&mut self, path: &Path, guid: Guid, type_name: &str) -> bool {
        let hash = self.settings.get(path).and_then(|settings| settings.lock().hash());
        self.index.register_asset(path, guid, type_name, hash)
    }

    pub fn unregister_asset(&mut self, path: &Path) -> Option<Guid> {
        self.index.unregister_asset(path)
    }

    /// Scans the content directory and imports everything that is outdated.
    ///
    /// With `force` every asset is imported again.
    pub fn rescan(&mut self, force: bool) {
        let force = if self.project.is_exporting() {
            true
        } else {
            // Without a loadable manifest the runtime can't use any of the existing artifacts.
            !self.runtime.reload_bundle() || force
        };
        info!("Scanning the content of project '{}' (force: {force})", self.project.project_name());

        let content_path = self.project.content_path().to_owned();
        self.on_directory_changed(&content_path, force);
        self.emit(Event::DirectoryChanged(content_path));
        self.reimport();
    }

    /// Returns the settings of the source file or the sub-item. They are created on first access.
    pub fn fetch_settings(&mut self, source: &Path) -> Option<SharedSettings> {
        if let Some(settings) = self.settings.get(source) {
            return Some(settings.clone());
        }
        if !source.exists() {
            return None;
        }

        let import_path = self.project.import_path().to_owned();
        let mut settings = match self.registry.resolve(source) {
            Some(Handler::Converter(converter)) => {
                AssetSettings::new(source, import_path, converter.type_name(), converter.create_options())
                    .with_version(converter.version())
                    .with_read_only(converter.is_read_only())
            }
            Some(Handler::Builder(id)) => AssetSettings::new(source, import_path, CODE_TYPE_NAME, Box::new(NoOptions))
                .with_builder(id)
                .with_read_only(false),
            None if source.is_dir() => {
                AssetSettings::new(source, import_path, INVALID_TYPE_NAME, Box::new(NoOptions)).with_directory()
            }
            None => AssetSettings::new(source, import_path, INVALID_TYPE_NAME, Box::new(NoOptions)),
        };
        if !settings.load_settings() {
            trace!("{source:?} has no sidecar file yet");
        }

        let sub_keys = settings.sub_keys();
        let settings = Arc::new(Mutex::new(settings));
        self.settings.insert(source.to_owned(), settings.clone());
        for key in sub_keys {
            self.settings.insert(source.join(key), settings.clone());
        }
        Some(settings)
    }

    /// Queues the source file for import regardless of its state.
    pub fn push_to_import_path(&mut self, source: &Path) -> bool {
        self.on_file_changed(source, true);
        true
    }

    /// Queues the settings for import. Settings that are already queued are not added again.
    pub fn push_to_import(&mut self, settings: SharedSettings) -> bool {
        self.queue.push(settings);
        true
    }

    /// Starts converting the queued assets.
    pub fn reimport(&mut self) {
        self.queue.sort_by_type();
        let count = self.queue.len();
        info!("Importing {count} assets");
        self.emit(Event::ImportStarted {
            count,
            message: "Importing resources".to_owned(),
        });
        self.state = PumpState::Draining;
    }

    /// Advances the import by one step.
    pub fn tick(&mut self) {
        self.process_watch_events();
        self.process_build_results();

        match self.state {
            PumpState::Idle | PumpState::Rebuilding => {}
            PumpState::Draining => match self.queue.pop() {
                Some(settings) => {
                    let source = settings.lock().source().to_owned();
                    if source.exists() {
                        self.convert(&settings);
                    } else {
                        trace!("{source:?} was deleted before it could be imported");
                    }
                }
                None => self.finish_draining(),
            },
        }
    }

    /// Converts a single asset and registers its artifacts.
    pub fn convert(&mut self, shared: &SharedSettings) -> ReturnCode {
        let mut settings = shared.lock();
        let source = settings.source().to_owned();

        let converter = match self.registry.resolve(&source) {
            Some(Handler::Converter(converter)) => converter,
            Some(Handler::Builder(id)) => {
                // Code is compiled when all other assets are imported.
                if let Some(builder) = self.registry.builder_mut(id) {
                    trace!("{source:?} makes '{}' outdated", builder.name());
                    builder.make_outdated();
                }
                return ReturnCode::Skipped;
            }
            None => {
                trace!("No converter is registered for {source:?}");
                return ReturnCode::Skipped;
            }
        };

        info!("Converting {source:?} with '{}'", converter.name());
        settings.set_sub_items_dirty();
        let mut return_code = converter.convert_file(&mut settings);
        if return_code == ReturnCode::CopyAsIs {
            return_code = match fs::copy(&source, settings.artifact_path()) {
                Ok(_) => ReturnCode::Success,
                Err(err) => {
                    error!("Failed to copy {source:?} into the import cache: {err}");
                    ReturnCode::InternalError
                }
            };
        }

        match return_code {
            ReturnCode::Success => {
                if let Err(err) = settings.commit_conversion() {
                    error!("Failed to hash {source:?}: {err}");
                    settings.clear_dirty_sub_items();
                    return ReturnCode::InternalError;
                }
                self.register_conversion(&mut settings, shared);
            }
            ReturnCode::Skipped => {
                trace!("Conversion of {source:?} was skipped");
                settings.clear_dirty_sub_items();
            }
            ReturnCode::Unsupported | ReturnCode::InternalError => {
                error!("Failed to convert {source:?}: {return_code:?}");
                settings.clear_dirty_sub_items();
            }
            ReturnCode::CopyAsIs => unreachable!("CopyAsIs is replaced by the result of the copy"),
        }
        return_code
    }

    fn register_conversion(&mut self, settings: &mut AssetSettings, shared: &SharedSettings) {
        let source = settings.source().to_owned();
        let hash = settings.hash();

        for (key, _) in settings.remove_dirty_sub_items() {
            let path = source.join(&key);
            trace!("Sub-item '{key}' of {source:?} wasn't produced again");
            self.index.unregister_asset(&path);
            self.settings.remove(&path);
            self.runtime.unload_resource(&path);
        }

        self.index
            .register_asset(&source, settings.destination(), settings.type_name(), hash);
        let mut imported = Vec::new();
        for (key, sub_item) in settings.sub_items() {
            let path = source.join(key);
            self.index.register_asset(&path, sub_item.guid, &sub_item.type_name, hash);
            self.settings.insert(path.clone(), shared.clone());
            if self.project.artifact_path(&sub_item.guid).exists() {
                self.runtime.reload_resource(&sub_item.guid);
                imported.push((path, sub_item.type_name.clone()));
            }
        }
        self.runtime.reload_resource(&settings.destination());
        imported.push((source.clone(), settings.type_name().to_owned()));

        for (path, type_name) in imported {
            self.emit(Event::Imported { path, type_name });
        }
        if let Err(err) = settings.save_settings() {
            error!("Failed to save the settings of {source:?}: {err}");
        }
    }

    fn finish_draining(&mut self) {
        let content_path = self.project.content_path().to_owned();
        for id in self.registry.builder_ids() {
            let Some(builder) = self.registry.builder_mut(id) else {
                continue;
            };
            builder.rescan_sources(&content_path);
            if builder.is_empty() {
                continue;
            }
            if let (Some(asset), Some(guid)) = (builder.persistent_asset(), builder.persistent_uuid()) {
                self.index.register_persistent(&asset, guid, CODE_TYPE_NAME);
            }
        }

        if let Err(err) = self.index.cleanup_bundle() {
            error!("Failed to clean up the import cache: {err}");
        }
        for key in self.index.prune_missing_artifacts() {
            trace!("Removed {key} because its artifact is missing");
        }
        if let Err(err) = self.dump_bundle() {
            error!("Failed to write the manifest: {err}");
        }

        self.attempted_builds.clear();
        if self.start_next_build() {
            return;
        }
        self.finish_import();
    }

    /// Starts the first outdated builder that wasn't started during this import.
    fn start_next_build(&mut self) -> bool {
        for id in self.registry.builder_ids() {
            let Some(builder) = self.registry.builder_mut(id) else {
                continue;
            };
            if builder.is_empty() || !builder.is_outdated() || self.attempted_builds.contains(&id) {
                continue;
            }
            self.attempted_builds.insert(id);
            match builder.build_project(&self.project) {
                Ok(true) => {
                    info!("Waiting for '{}'", builder.name());
                    self.state = PumpState::Rebuilding;
                    return true;
                }
                Ok(false) => error!("Failed to start the build of '{}'", builder.name()),
                Err(err) => error!("Failed to start the build of '{}': {err}", builder.name()),
            }
        }
        false
    }

    fn finish_import(&mut self) {
        if !self.queue.is_empty() {
            trace!("{} assets were queued while building", self.queue.len());
            self.reimport();
            return;
        }
        if self.watch_changes && self.watcher.is_none() {
            match ContentWatcher::new(WATCH_DELAY) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(err) => error!("{err}"),
            }
        }
        let content_path = self.project.content_path().to_owned();
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(err) = watcher.watch(&content_path) {
                error!("{err}");
            }
        }
        info!("Import finished");
        self.state = PumpState::Idle;
        self.emit(Event::ImportFinished);
    }

    fn process_build_results(&mut self) {
        let results = self.build_finished.try_iter().collect::<Vec<_>>();
        for result in results {
            self.on_build_finished(result.builder, result.success);
        }
    }

    /// Handles the end of a build. The settings of the compiled sources are stored when the build succeeded.
    pub fn on_build_finished(&mut self, id: BuilderId, success: bool) {
        let Some(builder) = self.registry.builder_mut(id) else {
            warn!("Unknown builder {id:?} finished");
            return;
        };
        builder.finish_build(success);
        info!("'{}' finished (success: {success})", builder.name());
        let sources = builder.sources();

        if success {
            for source in sources {
                let Some(settings) = self.fetch_settings(&source) else {
                    continue;
                };
                let mut settings = settings.lock();
                if let Err(err) = settings.commit_conversion().and_then(|()| settings.save_settings()) {
                    error!("Failed to save the settings of {source:?}: {err}");
                }
            }
        }
        self.emit(Event::BuildSuccessful(success));

        if self.state == PumpState::Rebuilding && !self.start_next_build() {
            self.finish_import();
        }
    }

    fn process_watch_events(&mut self) {
        let Some(watcher) = self.watcher.as_ref() else {
            return;
        };
        let events = watcher.try_iter().collect::<Vec<_>>();
        if events.is_empty() {
            return;
        }
        for event in events {
            match event {
                WatchEvent::FileChanged(path) => {
                    self.on_file_changed(&path, false);
                    self.emit(Event::FileChanged(path));
                }
                WatchEvent::DirectoryChanged(path) => {
                    self.on_directory_changed(&path, false);
                    self.emit(Event::DirectoryChanged(path));
                }
                WatchEvent::Removed(path) => {
                    if path.exists() {
                        continue;
                    }
                    if let Err(err) = self.remove_resource(&path) {
                        error!("Failed to remove {path:?}: {err}");
                    }
                    self.emit(Event::FileChanged(path));
                }
            }
        }
        if !self.queue.is_empty() && self.state == PumpState::Idle {
            self.reimport();
        }
    }

    /// Queues the file when `force` is set or when it's outdated. Otherwise its existing artifacts are registered.
    pub fn on_file_changed(&mut self, path: &Path, force: bool) {
        if is_meta_file(path) || path.is_dir() {
            return;
        }
        if self.registry.resolve(path).is_none() {
            trace!("Ignoring {path:?} because no converter is registered for it");
            return;
        }
        let Some(shared) = self.fetch_settings(path) else {
            return;
        };
        let mut settings = shared.lock();
        if force || settings.is_outdated() {
            drop(settings);
            trace!("Queueing {path:?}");
            self.queue.push(shared);
        } else if !settings.is_code() {
            register_artifacts(&mut self.index, &settings);
        }
    }

    /// Handles all files below `path`.
    pub fn on_directory_changed(&mut self, path: &Path, force: bool) {
        let files = WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Failed to read directory entry: {err}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect::<Vec<_>>();
        for file in files {
            self.on_file_changed(&file, force);
        }
    }

    /// Copies `source` into the directory `target` of the content. Returns the path of the copy.
    ///
    /// A number is appended to the name when the file already exists.
    pub fn import(&mut self, source: &Path, target: &Path) -> Result<PathBuf> {
        let directory = if target.is_absolute() {
            target.to_owned()
        } else {
            self.project.content_path().join(target)
        };
        fs::create_dir_all(&directory)?;
        let base_name = extract_base_name_from_path(source)?;
        let suffix = dotted_extension(source);
        let name = find_free_name(&base_name, &directory, &suffix);
        let destination = directory.join(format!("{name}{suffix}"));
        fs::copy(source, &destination)?;
        info!("Imported {source:?} as {destination:?}");
        Ok(destination)
    }

    /// Deletes the source file with its sidecar and artifacts. Directories are removed recursively.
    pub fn remove_resource(&mut self, path: &Path) -> Result<()> {
        if path.is_dir() {
            let mut entries = fs::read_dir(path)?.map(|entry| entry.map(|entry| entry.path())).collect::<std::io::Result<Vec<_>>>()?;
            entries.sort();
            for entry in entries.iter().filter(|entry| !is_meta_file(entry)) {
                self.remove_resource(entry)?;
            }
            fs::remove_dir_all(path)?;
            self.remove_cached_settings(path);
            return self.dump_bundle();
        }

        info!("Removing {path:?}");
        self.runtime.unload_resource(path);
        for (removed_path, entry) in self.index.remove_under(path) {
            trace!("Unregistered {removed_path:?}");
            remove_file_if_exists(&self.project.artifact_path(&entry.guid))?;
            remove_file_if_exists(&self.project.icon_path(&entry.guid))?;
        }
        self.remove_cached_settings(path);
        remove_file_if_exists(&meta_path(path))?;
        remove_file_if_exists(path)?;

        if let Some(Handler::Builder(id)) = self.registry.resolve(path) {
            let content_path = self.project.content_path().to_owned();
            if let Some(builder) = self.registry.builder_mut(id) {
                builder.rescan_sources(&content_path);
                if !builder.is_empty() {
                    builder.make_outdated();
                    if !builder.build_project(&self.project)? {
                        error!("Failed to start the build of '{}'", builder.name());
                    }
                }
            }
        }
        self.dump_bundle()
    }

    fn remove_cached_settings(&mut self, path: &Path) {
        self.settings.retain(|cached, _| !cached.starts_with(path));
    }

    /// Moves a source file or a directory. The assets keep their [`Guid`]s.
    pub fn rename_resource(&mut self, old_path: &Path, new_path: &Path) -> Result<()> {
        if old_path == new_path {
            return Ok(());
        }
        if new_path.exists() || meta_path(new_path).exists() {
            warn!("Can't rename {old_path:?} because {new_path:?} already exists");
            return Err(Error::InvalidPath(new_path.to_owned()));
        }
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if old_path.is_dir() {
            fs::rename(old_path, new_path)?;
            self.move_index_entries(old_path, new_path);
            self.remove_cached_settings(old_path);
            return self.dump_bundle();
        }

        let settings = self
            .fetch_settings(old_path)
            .ok_or_else(|| Error::InvalidPath(old_path.to_owned()))?;
        let old_meta_path = meta_path(old_path);
        if !old_meta_path.exists() {
            // The GUID has to survive the rename even if the asset was never imported.
            settings.lock().save_settings()?;
        }
        info!("Renaming {old_path:?} to {new_path:?}");
        fs::rename(old_path, new_path)?;
        fs::rename(&old_meta_path, meta_path(new_path))?;

        self.move_index_entries(old_path, new_path);
        self.remove_cached_settings(old_path);
        self.dump_bundle()?;

        let Some(settings) = self.fetch_settings(new_path) else {
            return Err(Error::InvalidPath(new_path.to_owned()));
        };
        let old_name = extract_base_name_from_path(old_path)?;
        let new_name = extract_base_name_from_path(new_path)?;
        let mut settings = settings.lock();
        match self.registry.resolve(new_path) {
            Some(Handler::Converter(converter)) => converter.rename_asset(&mut settings, &old_name, &new_name),
            Some(Handler::Builder(id)) => {
                if let Some(builder) = self.registry.builder(id) {
                    builder.rename_asset(&mut settings, &old_name, &new_name)?;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn move_index_entries(&mut self, old_path: &Path, new_path: &Path) {
        for (path, entry) in self.index.remove_under(old_path) {
            let moved = match path.strip_prefix(old_path) {
                Ok(relative) if relative.as_os_str().is_empty() => new_path.to_owned(),
                Ok(relative) => new_path.join(relative),
                Err(_) => continue,
            };
            trace!("Moving {path:?} to {moved:?}");
            self.index.register_asset(&moved, entry.guid, &entry.type_name, entry.hash);
        }
    }

    /// Copies the source file with its artifacts. The copy gets new [`Guid`]s.
    pub fn duplicate_resource(&mut self, path: &Path) -> Result<PathBuf> {
        if !path.is_file() {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        let directory = path.parent().ok_or_else(|| Error::InvalidPath(path.to_owned()))?;
        let base_name = extract_base_name_from_path(path)?;
        let suffix = dotted_extension(path);
        let name = find_free_name(&base_name, directory, &suffix);
        let target = directory.join(format!("{name}{suffix}"));

        let original = self
            .fetch_settings(path)
            .ok_or_else(|| Error::InvalidPath(path.to_owned()))?;
        let original_destination = original.lock().destination();

        fs::copy(path, &target)?;
        if meta_path(path).exists() {
            fs::copy(meta_path(path), meta_path(&target))?;
        }
        let copy = self
            .fetch_settings(&target)
            .ok_or_else(|| Error::InvalidPath(target.clone()))?;
        let mut settings = copy.lock();
        let destination = Guid::new();
        settings.set_destination(destination);
        for key in settings.sub_keys() {
            let Some(sub_item) = settings.sub_item(&key).cloned() else {
                continue;
            };
            let guid = Guid::new();
            copy_file_if_exists(&self.project.artifact_path(&sub_item.guid), &self.project.artifact_path(&guid))?;
            settings.set_sub_item(&key, guid, &sub_item.type_name);
        }
        settings.save_settings()?;

        copy_file_if_exists(&self.project.icon_path(&original_destination), &self.project.icon_path(&destination))?;
        copy_file_if_exists(&self.project.artifact_path(&original_destination), &self.project.artifact_path(&destination))?;
        register_artifacts(&mut self.index, &settings);
        drop(settings);

        info!("Duplicated {path:?} as {target:?}");
        self.dump_bundle()?;
        Ok(target)
    }

    /// Applies the decision of the user about changed import options.
    ///
    /// Returns false if the user cancelled. Settings without changes are always accepted.
    pub fn check_import_settings(&mut self, settings: &SharedSettings, decision: ImportDecision) -> Result<bool> {
        let mut guard = settings.lock();
        if !guard.is_modified() {
            return Ok(true);
        }
        match decision {
            ImportDecision::SaveAndReimport => {
                guard.save_settings()?;
                drop(guard);
                self.push_to_import(settings.clone());
                self.reimport();
                Ok(true)
            }
            ImportDecision::Revert => {
                guard.revert_options();
                Ok(true)
            }
            ImportDecision::Cancel => Ok(false),
        }
    }

    /// Creates a prefab asset `name.fab` in the content directory `target` from the object hierarchy `root`.
    ///
    /// `id` identifies the object that the prefab was made from and is passed on in [`Event::PrefabCreated`].
    pub fn make_prefab(&mut self, id: u32, name: &str, target: &Path, root: &Value) -> Result<Guid> {
        let path = self.project.content_path().join(target).join(format!("{name}.{PREFAB_SUFFIX}"));
        let Some(Handler::Converter(converter)) = self.registry.resolve(&path) else {
            return Err(Error::ExtensionNotRegistered(PREFAB_SUFFIX.to_owned()));
        };
        if converter.type_name() != PREFAB_TYPE_NAME {
            return Err(Error::ExtensionNotRegistered(PREFAB_SUFFIX.to_owned()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = PrefabConverter::payload(root)?;
        fs::write(&path, payload)?;

        self.remove_cached_settings(&path);
        let shared = self.fetch_settings(&path).ok_or_else(|| Error::InvalidPath(path.clone()))?;
        let guid = shared.lock().destination();
        if self.convert(&shared) != ReturnCode::Success {
            return Err(Error::InvalidAssetData(path));
        }
        self.dump_bundle()?;
        self.emit(Event::PrefabCreated { id, guid });
        Ok(guid)
    }

    /// Creates a new asset at `destination` from the template of its converter.
    pub fn create_from_template(&self, destination: &Path) -> Result<()> {
        match self.registry.resolve(destination) {
            Some(Handler::Converter(converter)) => converter.create_from_template(destination),
            Some(Handler::Builder(id)) => match self.registry.builder(id).and_then(|builder| builder.template_path()) {
                Some(template_path) => create_from_template(&template_path, destination),
                None => Ok(()),
            },
            None => Err(Error::ExtensionNotRegistered(
                extract_extension_from_path(destination).unwrap_or_default(),
            )),
        }
    }

    /// Returns the type name of the asset or of the sub-item.
    pub fn asset_type_name(&mut self, path: &Path) -> Option<String> {
        if let Some(settings) = self.fetch_settings(path) {
            let settings = settings.lock();
            if settings.source() == path {
                return Some(settings.type_name().to_owned());
            }
            let key = path.strip_prefix(settings.source()).ok()?.to_string_lossy().into_owned();
            return settings.sub_type_name(&key).map(str::to_owned);
        }
        let source = path.parent()?;
        let key = extract_file_name_from_path(path).ok()?;
        let settings = self.fetch_settings(source)?;
        let settings = settings.lock();
        settings.sub_type_name(&key).map(str::to_owned)
    }

    /// Returns the thumbnail of the asset or the default icon of its converter.
    pub fn icon(&self, path: &Path) -> Option<PathBuf> {
        if let Some(guid) = self.index.path_to_guid(path) {
            let icon_path = self.project.icon_path(&guid);
            if icon_path.exists() {
                return Some(icon_path);
            }
        }
        match self.registry.resolve(path)? {
            Handler::Converter(converter) => converter.icon_path(),
            Handler::Builder(_) => None,
        }
    }

    /// Writes the manifest and tells the runtime to load it.
    pub fn dump_bundle(&mut self) -> Result<()> {
        self.index.dump_bundle(&self.project)?;
        if !self.runtime.reload_bundle() {
            warn!("The runtime failed to reload the manifest");
        }
        Ok(())
    }

    /// Deletes the artifacts that don't belong to a registered asset and writes the manifest.
    pub fn cleanup_bundle(&mut self) -> Result<()> {
        self.index.cleanup_bundle()?;
        self.dump_bundle()
    }
}

fn register_artifacts(index: &mut AssetIndex, settings: &AssetSettings) {
    let source = settings.source();
    let hash = settings.hash();
    index.register_asset(source, settings.destination(), settings.type_name(), hash);
    for (key, sub_item) in settings.sub_items().iter().filter(|(_, sub_item)| !sub_item.dirty) {
        index.register_asset(&source.join(key), sub_item.guid, &sub_item.type_name, hash);
    }
}

/// Returns the extension of the path including the dot or an empty string.
fn dotted_extension(path: &Path) -> String {
    path.extension()
        .map(|extension| format!(".{}", extension.to_string_lossy()))
        .unwrap_or_default()
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn copy_file_if_exists(from: &Path, to: &Path) -> Result<()> {
    if from.exists() {
        fs::copy(from, to)?;
    }
    Ok(())
}
