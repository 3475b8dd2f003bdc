use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
};

use kiln_shared::{
    crossbeam_channel::Sender,
    indoc::indoc,
    log::{error, info, trace, warn},
    walkdir::WalkDir,
};

use crate::{
    common::{extract_extension_from_path, is_meta_file},
    project::BuildCommand,
    AssetSettings, Error, Guid, ProjectSettings, Result,
};

/// Marker that registers a class in the generated plugin loader: `KILN_OBJECT(Class, Base, Group)`.
const CLASS_MARKER: &str = "KILN_OBJECT(";

const PLUGIN_TEMPLATE_NAME: &str = "plugin.cpp";
const APPLICATION_TEMPLATE_NAME: &str = "application.cpp";

const DEFAULT_PLUGIN_TEMPLATE: &str = indoc! {r#"
    // Generated by kiln for ${projectName}. Code between the markers is overwritten.
    #include <engine.h>

    //+Includes
    //-

    extern "C" void registerPlugin(Engine *m_engine) {
    //+RegisterComponents
    //-
    }

    extern "C" void unregisterPlugin(Engine *m_engine) {
    //+UnregisterComponents
    //-
    }

    static const char *gComponents[] = {
    //+ComponentNames
    //-
    };
"#};

const DEFAULT_APPLICATION_TEMPLATE: &str = indoc! {r#"
    // Generated by kiln for ${projectName} (${company}).
    #include <engine.h>

    //+ModuleIncludes
    //-

    void registerModules(Engine *engine) {
    //+RegisterModules
    //-
    }

    static const char *gLibraries[] = {
    //+LibrariesList
    //-
    };

    static const char *gFiles[] = {
    //+FilesList
    //-
    };
"#};

/// Index of a code builder in the converter registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuilderId(usize);

impl BuilderId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Sent by a builder when the external toolchain finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildFinished {
    pub builder: BuilderId,
    pub success: bool,
}

/// Reports the end of one build to the owner of the registry.
pub struct BuildNotifier {
    builder: BuilderId,
    sender: Sender<BuildFinished>,
}

impl BuildNotifier {
    pub fn notify(self, success: bool) {
        if let Err(err) = self.sender.send(BuildFinished {
            builder: self.builder,
            success,
        }) {
            error!("Failed to report the finished build of {:?}: {err}", self.builder);
        }
    }
}

/// State that every code builder has.
#[derive(Default)]
pub struct BuilderState {
    id: Option<BuilderId>,
    sources: BTreeSet<PathBuf>,
    outdated: bool,
    building: bool,
    sender: Option<Sender<BuildFinished>>,
}

impl BuilderState {
    pub(crate) fn connect(&mut self, id: BuilderId, sender: Sender<BuildFinished>) {
        self.id = Some(id);
        self.sender = Some(sender);
    }

    pub fn id(&self) -> Option<BuilderId> {
        self.id
    }

    pub fn is_building(&self) -> bool {
        self.building
    }

    /// Marks a build as running and returns the notifier that has to be called when it's finished.
    pub fn start_build(&mut self) -> Option<BuildNotifier> {
        let notifier = BuildNotifier {
            builder: self.id?,
            sender: self.sender.clone()?,
        };
        self.building = true;
        Some(notifier)
    }
}

impl fmt::Debug for BuilderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderState")
            .field("id", &self.id)
            .field("sources", &self.sources.len())
            .field("outdated", &self.outdated)
            .field("building", &self.building)
            .finish()
    }
}

/// A converter for source code. Converting a code asset only marks the builder as outdated;
/// the code is compiled by [`CodeBuilder::build_project`] after all other assets are imported.
pub trait CodeBuilder: Send + Sync {
    fn name(&self) -> &str;

    /// Lower case suffixes of the source files.
    fn suffixes(&self) -> Vec<String>;

    fn state(&self) -> &BuilderState;

    fn state_mut(&mut self) -> &mut BuilderState;

    /// Starts the build of the project. Returns false if the build couldn't be started.
    ///
    /// The end of a started build is reported through [`BuilderState::start_build`].
    fn build_project(&mut self, project: &ProjectSettings) -> Result<bool>;

    /// Index path of the artifact that the builder produces, e.g. the plugin library.
    fn persistent_asset(&self) -> Option<String> {
        None
    }

    fn persistent_uuid(&self) -> Option<Guid> {
        None
    }

    fn template_path(&self) -> Option<PathBuf> {
        None
    }

    fn platforms(&self) -> Vec<String> {
        Vec::new()
    }

    /// Collects all files below `root` with one of the suffixes of this builder.
    fn rescan_sources(&mut self, root: &Path) {
        let suffixes = self.suffixes().into_iter().map(|suffix| suffix.to_lowercase()).collect::<BTreeSet<_>>();
        let mut sources = BTreeSet::new();
        for entry in WalkDir::new(root) {
            let Ok(entry) = entry else {
                warn!("Failed to read directory entry while scanning sources of '{}'", self.name());
                continue;
            };
            let path = entry.path();
            if !entry.file_type().is_file() || is_meta_file(path) {
                continue;
            }
            if let Ok(extension) = extract_extension_from_path(path) {
                if suffixes.contains(&extension) {
                    sources.insert(path.to_owned());
                }
            }
        }
        trace!("Builder '{}' found {} sources", self.name(), sources.len());
        self.state_mut().sources = sources;
    }

    /// Returns true if there are no sources. Such a builder is inert.
    fn is_empty(&self) -> bool {
        self.state().sources.is_empty()
    }

    fn sources(&self) -> Vec<PathBuf> {
        self.state().sources.iter().cloned().collect()
    }

    fn make_outdated(&mut self) {
        self.state_mut().outdated = true;
    }

    fn is_outdated(&self) -> bool {
        self.state().outdated
    }

    /// Called when the toolchain reported the end of the build. A failed build stays outdated.
    fn finish_build(&mut self, success: bool) {
        let state = self.state_mut();
        state.building = false;
        if success {
            state.outdated = false;
        }
    }

    /// Replaces the class name in the source file after it was renamed.
    fn rename_asset(&self, settings: &mut AssetSettings, old_name: &str, new_name: &str) -> Result<()> {
        let content = fs::read_to_string(settings.source())?;
        let mut renamed = content.clone();
        for (old, new) in [
            (format!("class {old_name}"), format!("class {new_name}")),
            (format!("{old_name}()"), format!("{new_name}()")),
            (format!("({old_name}"), format!("({new_name}")),
        ] {
            renamed = renamed.replace(&old, &new);
        }
        if renamed != content {
            fs::write(settings.source(), renamed)?;
        }
        Ok(())
    }
}

/// Invokes the native toolchain for a generated project.
pub trait Toolchain: Send + Sync {
    /// Starts the build in `project_directory`. `on_finished` is called with the result
    /// once the build ended, possibly from another thread.
    fn spawn(&self, project_directory: &Path, label: &str, on_finished: Box<dyn FnOnce(bool) + Send>) -> Result<()>;
}

/// Runs an external program as toolchain and forwards its output to the log.
pub struct CommandToolchain {
    command: BuildCommand,
}

impl CommandToolchain {
    pub fn new(command: BuildCommand) -> Self {
        Self { command }
    }
}

impl Toolchain for CommandToolchain {
    fn spawn(&self, project_directory: &Path, label: &str, on_finished: Box<dyn FnOnce(bool) + Send>) -> Result<()> {
        info!("{label} Running '{}' in {project_directory:?}", self.command.program);
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(project_directory)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::BuildFailed(label.to_owned(), format!("could not execute '{}': {err}", self.command.program)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let label = label.to_owned();
        thread::Builder::new()
            .name(format!("Toolchain {label}"))
            .spawn(move || {
                let stderr_label = label.clone();
                let stderr_thread = stderr.map(|stderr| thread::spawn(move || forward_output(stderr, &stderr_label)));
                if let Some(stdout) = stdout {
                    forward_output(stdout, &label);
                }
                if let Some(Err(err)) = stderr_thread.map(JoinHandle::join) {
                    error!("{label} Forwarding the error output of the toolchain panicked: {err:?}");
                }
                let success = match child.wait() {
                    Ok(status) => {
                        info!("{label} Toolchain exited with {status}");
                        status.success()
                    }
                    Err(err) => {
                        error!("{label} Failed to wait for the toolchain: {err}");
                        false
                    }
                };
                on_finished(success);
            })?;
        Ok(())
    }
}

fn forward_output(output: impl Read, label: &str) {
    for line in BufReader::new(output).lines() {
        match line {
            Ok(line) => log_build_line(label, &line),
            Err(err) => {
                warn!("{label} Failed to read toolchain output: {err}");
                break;
            }
        }
    }
}

/// Severity of a line of the build log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildLogLevel {
    Error,
    Warning,
    Info,
}

pub fn classify_build_line(line: &str) -> BuildLogLevel {
    if line.contains(" error ") || line.contains(" error:") {
        BuildLogLevel::Error
    } else if line.contains(" warning ") || line.contains(" warning:") {
        BuildLogLevel::Warning
    } else {
        BuildLogLevel::Info
    }
}

/// Logs all non-empty lines of a build log with the severity the line reports.
pub fn parse_logs(label: &str, log: &str) {
    for line in log.split(['\r', '\n']) {
        log_build_line(label, line);
    }
}

fn log_build_line(label: &str, line: &str) {
    if line.is_empty() {
        return;
    }
    match classify_build_line(line) {
        BuildLogLevel::Error => error!("{label} {line}"),
        BuildLogLevel::Warning => warn!("{label} {line}"),
        BuildLogLevel::Info => info!("{label} {line}"),
    }
}

/// Finds all classes that are registered with the class marker. Commented code is ignored.
///
/// # Example
///
/// ```rust
/// use kiln_content::builder::find_registered_classes;
/// let source = "class Player {\n    KILN_OBJECT(Player, Component, Components)\n};\n// KILN_OBJECT(Old, Component, Components)";
/// assert_eq!(find_registered_classes(source), vec!["Player".to_owned()]);
/// ```
pub fn find_registered_classes(source: &str) -> Vec<String> {
    let mut classes = Vec::new();
    let mut in_block_comment = false;
    for line in source.lines() {
        let code = strip_comments(line, &mut in_block_comment);
        let mut rest = code.as_str();
        while let Some(start) = rest.find(CLASS_MARKER) {
            rest = &rest[start + CLASS_MARKER.len()..];
            let Some(end) = rest.find(')') else {
                break;
            };
            let arguments = rest[..end].split(',').map(str::trim).collect::<Vec<_>>();
            let is_identifier = |value: &str| !value.is_empty() && value.chars().all(|c| c.is_alphanumeric() || c == '_');
            if arguments.len() == 3 && arguments.iter().all(|argument| is_identifier(*argument)) {
                classes.push(arguments[0].to_owned());
            }
            rest = &rest[end..];
        }
    }
    classes
}

fn strip_comments(line: &str, in_block_comment: &mut bool) -> String {
    let mut code = String::new();
    let mut rest = line;
    loop {
        if *in_block_comment {
            match rest.find("*/") {
                Some(end) => {
                    *in_block_comment = false;
                    rest = &rest[end + 2..];
                }
                None => return code,
            }
        } else {
            let line_comment = rest.find("//");
            let block_comment = rest.find("/*");
            match (line_comment, block_comment) {
                (Some(line_start), Some(block_start)) if line_start < block_start => {
                    code.push_str(&rest[..line_start]);
                    return code;
                }
                (_, Some(block_start)) => {
                    code.push_str(&rest[..block_start]);
                    *in_block_comment = true;
                    rest = &rest[block_start + 2..];
                }
                (Some(line_start), None) => {
                    code.push_str(&rest[..line_start]);
                    return code;
                }
                (None, None) => {
                    code.push_str(rest);
                    return code;
                }
            }
        }
    }
}

/// Replaces `${Key}` placeholders and fills the regions between `//+Key` and `//-` with the value of `${Key}`.
///
/// The content outside of the regions is kept so that an existing generated file can be
/// used as its own template.
pub fn update_template(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut output = String::new();
    let mut in_region = false;
    for line in template.split_inclusive('\n') {
        if in_region {
            if line.contains("//-") {
                in_region = false;
                output.push_str(line);
            }
        } else {
            let mut line = line.to_owned();
            for (key, value) in values.iter().filter(|(key, _)| key.starts_with('$')) {
                line = line.replace(key.as_str(), value);
            }
            output.push_str(&line);

            if let Some(index) = line.find("//+") {
                let key = line[index + 3..].trim();
                if let Some(value) = values.get(&format!("${{{key}}}")) {
                    output.push_str(value);
                }
                in_region = true;
            }
        }
    }
    output
}

fn format_list<T: AsRef<str>>(items: &[T], prefix: &str, suffix: &str, separator: &str) -> String {
    let mut result = String::new();
    for (index, item) in items.iter().enumerate() {
        result.push_str(prefix);
        result.push_str(item.as_ref());
        result.push_str(suffix);
        if index + 1 < items.len() {
            result.push_str(separator);
        }
        result.push('\n');
    }
    result
}

/// Builds native plugins from C++ sources.
///
/// Before every build the plugin loader is generated from the classes that are
/// registered with `KILN_OBJECT(Class, Base, Group)`. The generated project is built
/// by the [`Toolchain`].
pub struct NativeCodeBuilder {
    name: String,
    state: BuilderState,
    toolchain: Box<dyn Toolchain>,
    template_directory: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl NativeCodeBuilder {
    pub fn new(toolchain: Box<dyn Toolchain>) -> Self {
        Self {
            name: "NativeCodeBuilder".to_owned(),
            state: BuilderState::default(),
            toolchain,
            template_directory: None,
            values: BTreeMap::new(),
        }
    }

    /// Directory containing `plugin.cpp` and `application.cpp` templates that replace the built-in ones.
    pub fn with_template_directory(mut self, template_directory: impl Into<PathBuf>) -> Self {
        self.template_directory = Some(template_directory.into());
        self
    }

    /// Values that are substituted in the templates, keyed like `${Key}`.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Writes the plugin loader and the application sources into the generated directory of the project.
    pub fn generate_project(&mut self, project: &ProjectSettings) -> Result<PathBuf> {
        info!("{} Generating project", self.name);
        let config = project.config();
        let id_name = config.name.replace([' ', '_'], "").to_lowercase();
        self.values.insert("${idName}".to_owned(), id_name);
        self.values.insert("${projectName}".to_owned(), config.name.clone());
        self.values.insert("${company}".to_owned(), config.company.clone());
        self.values.insert(
            "${sdkPath}".to_owned(),
            config.sdk.as_ref().map(|sdk| sdk.to_string_lossy().into_owned()).unwrap_or_default(),
        );
        let files = self
            .state
            .sources
            .iter()
            .map(|source| source.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        self.values
            .insert("${FilesList}".to_owned(), format_list(&files, "        \"", "\"", ","));

        self.generate_loader(&config.modules)?;

        let directory = project.generated_path().to_owned();
        for name in [PLUGIN_TEMPLATE_NAME, APPLICATION_TEMPLATE_NAME] {
            let destination = directory.join(name);
            let template = self.read_template(name, &destination)?;
            fs::write(&destination, update_template(&template, &self.values))?;
        }
        Ok(directory)
    }

    fn read_template(&self, name: &str, destination: &Path) -> Result<String> {
        if destination.exists() {
            return Ok(fs::read_to_string(destination)?);
        }
        if let Some(path) = self.template_directory.as_ref().map(|directory| directory.join(name)) {
            if path.exists() {
                return Ok(fs::read_to_string(path)?);
            }
        }
        Ok(match name {
            PLUGIN_TEMPLATE_NAME => DEFAULT_PLUGIN_TEMPLATE,
            _ => DEFAULT_APPLICATION_TEMPLATE,
        }
        .to_owned())
    }

    fn generate_loader(&mut self, modules: &[String]) -> Result<()> {
        let mut classes = BTreeMap::new();
        for source in &self.state.sources {
            let content = match fs::read_to_string(source) {
                Ok(content) => content,
                Err(err) => {
                    warn!("{} Failed to read {source:?}: {err}", self.name);
                    continue;
                }
            };
            for class in find_registered_classes(&content) {
                classes.insert(class, source.clone());
            }
        }

        let includes = classes
            .values()
            .map(|source| format!("#include \"{}\"\n", source.to_string_lossy()))
            .collect::<BTreeSet<_>>();
        let mut register = String::new();
        let mut unregister = String::new();
        for class in classes.keys() {
            register.push_str(&format!("    {class}::registerClassFactory(m_engine);\n"));
            unregister.push_str(&format!("    {class}::unregisterClassFactory(m_engine);\n"));
        }
        let names = classes.keys().map(String::as_str).collect::<Vec<_>>();
        let names = format_list(&names, "    \"", "\"", ",");

        let mut register_modules = String::new();
        let mut module_includes = String::new();
        let mut libraries = String::new();
        for module in modules {
            let name = module.replace(' ', "");
            if name.is_empty() {
                continue;
            }
            register_modules.push_str(&format!("    engine->addModule(new {name}(engine));\n"));
            module_includes.push_str(&format!("#include <{}.h>\n", name.to_lowercase()));
            libraries.push_str(&format!("    \"{}\",\n", name.to_lowercase()));
        }

        self.values.insert("${Includes}".to_owned(), includes.into_iter().collect());
        self.values.insert("${RegisterComponents}".to_owned(), register);
        self.values.insert("${UnregisterComponents}".to_owned(), unregister);
        self.values.insert("${ComponentNames}".to_owned(), names);
        self.values.insert("${RegisterModules}".to_owned(), register_modules);
        self.values.insert("${ModuleIncludes}".to_owned(), module_includes);
        self.values.insert("${LibrariesList}".to_owned(), libraries);
        trace!("{} Found {} registered classes", self.name, classes.len());
        Ok(())
    }
}

impl CodeBuilder for NativeCodeBuilder {
    fn name(&self) -> &str {
        &self.name
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

    fn build_project(&mut self, project: &ProjectSettings) -> Result<bool> {
        if !self.is_outdated() || self.state.is_building() {
            return Ok(true);
        }
        info!("{} Build started", self.name);
        let directory = self.generate_project(project)?;
        let Some(notifier) = self.state.start_build() else {
            warn!("{} is not registered and can't report the end of the build", self.name);
            return Ok(false);
        };
        let label = self.name.clone();
        let result = self.toolchain.spawn(
            &directory,
            &self.name,
            Box::new(move |success| {
                info!("{label} Build finished");
                notifier.notify(success);
            }),
        );
        if let Err(err) = result {
            error!("{} {err}", self.name);
            self.state.building = false;
            return Ok(false);
        }
        Ok(true)
    }

    fn persistent_asset(&self) -> Option<String> {
        Some(format!(".embedded/{}", self.name))
    }

    fn persistent_uuid(&self) -> Option<Guid> {
        Some(Guid::from_name(&self.name))
    }

    fn template_path(&self) -> Option<PathBuf> {
        self.template_directory.as_ref().map(|directory| directory.join("class.h"))
    }

    fn platforms(&self) -> Vec<String> {
        vec![std::env::consts::OS.to_owned()]
    }
}
