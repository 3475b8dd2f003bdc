use std::{
    fs,
    path::{Path, PathBuf},
};

use kiln_shared::log::info;
use serde::{Deserialize, Serialize};

use crate::{common::INDEX_FILE_NAME, Error, Guid, Result};

const CONTENT_FOLDER: &str = "content";
const PLUGINS_FOLDER: &str = "plugins";
const CACHE_FOLDER: &str = "cache";
const IMPORT_FOLDER: &str = "import";
const THUMBNAILS_FOLDER: &str = "thumbnails";
const GENERATED_FOLDER: &str = "generated";

/// External command that builds the generated native project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Content of the project file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub company: String,
    /// Asset that the runtime opens first.
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub sdk: Option<PathBuf>,
    /// Engine modules that the generated plugin loader registers.
    #[serde(default)]
    pub modules: Vec<String>,
    /// When set, the project is exported to this directory instead of being edited.
    #[serde(default)]
    pub target: Option<PathBuf>,
    #[serde(default)]
    pub build: Option<BuildCommand>,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            company: String::new(),
            entry: String::new(),
            sdk: None,
            modules: Vec::new(),
            target: None,
            build: None,
        }
    }
}

/// Directory layout and configuration of a project.
///
/// All directories are derived from the location of the project file:
///
/// ```text
/// demo.kiln
/// content/
/// plugins/
/// cache/
/// ├─ import/        artifacts named by GUID and the `index` manifest
/// ├─ thumbnails/    icons named by GUID
/// ├─ generated/     generated native build project
/// ```
#[derive(Debug, Clone)]
pub struct ProjectSettings {
    project_file: PathBuf,
    config: ProjectConfig,
    content_path: PathBuf,
    plugins_path: PathBuf,
    import_path: PathBuf,
    icon_path: PathBuf,
    generated_path: PathBuf,
}

impl ProjectSettings {
    /// Loads the project file and creates the directories of the project.
    pub fn load(project_file: impl AsRef<Path>) -> Result<Self> {
        let project_file = project_file.as_ref();
        let content = fs::read_to_string(project_file)?;
        let config = serde_yaml::from_str::<ProjectConfig>(&content)?;
        info!("Loaded project '{}' from {project_file:?}", config.name);
        Self::with_config(project_file, config)
    }

    /// Creates the settings for a project file that is located in `root` and named after the project.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_content::ProjectSettings;
    /// let root = std::env::temp_dir().join("kiln_project_doc");
    /// let project = ProjectSettings::new(&root, "Demo").unwrap();
    /// assert!(project.content_path().is_dir());
    /// assert!(project.import_path().ends_with("cache/import"));
    /// ```
    pub fn new(root: impl AsRef<Path>, name: &str) -> Result<Self> {
        let project_file = root.as_ref().join(format!("{name}.kiln"));
        Self::with_config(&project_file, ProjectConfig::new(name))
    }

    pub fn with_config(project_file: &Path, config: ProjectConfig) -> Result<Self> {
        let root = project_file
            .parent()
            .ok_or_else(|| Error::InvalidPath(project_file.to_owned()))?
            .to_owned();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        let cache_path = root.join(CACHE_FOLDER);
        let settings = Self {
            project_file: root.join(project_file.file_name().ok_or_else(|| Error::InvalidPath(project_file.to_owned()))?),
            config,
            content_path: root.join(CONTENT_FOLDER),
            plugins_path: root.join(PLUGINS_FOLDER),
            import_path: cache_path.join(IMPORT_FOLDER),
            icon_path: cache_path.join(THUMBNAILS_FOLDER),
            generated_path: cache_path.join(GENERATED_FOLDER),
        };
        for path in [
            &settings.content_path,
            &settings.plugins_path,
            &settings.import_path,
            &settings.icon_path,
            &settings.generated_path,
        ] {
            fs::create_dir_all(path)?;
        }
        Ok(settings)
    }

    /// Writes the configuration back to the project file.
    pub fn save(&self) -> Result<()> {
        let content = serde_yaml::to_string(&self.config)?;
        fs::write(&self.project_file, content)?;
        Ok(())
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProjectConfig {
        &mut self.config
    }

    pub fn project_file(&self) -> &Path {
        &self.project_file
    }

    pub fn project_name(&self) -> &str {
        &self.config.name
    }

    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    pub fn plugins_path(&self) -> &Path {
        &self.plugins_path
    }

    /// Directory containing the artifacts, each named by its [`Guid`].
    pub fn import_path(&self) -> &Path {
        &self.import_path
    }

    pub fn generated_path(&self) -> &Path {
        &self.generated_path
    }

    pub fn icon_directory(&self) -> &Path {
        &self.icon_path
    }

    pub fn artifact_path(&self, guid: &Guid) -> PathBuf {
        self.import_path.join(guid.to_string())
    }

    pub fn icon_path(&self, guid: &Guid) -> PathBuf {
        self.icon_path.join(format!("{guid}.png"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.import_path.join(INDEX_FILE_NAME)
    }

    /// Returns true if the project is exported to a target directory instead of being edited.
    pub fn is_exporting(&self) -> bool {
        self.config.target.is_some()
    }
}

#[cfg(test)]
mod tests {
    use kiln_shared::indoc::indoc;
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn load_project_file() {
        let root = TempDir::new("root").unwrap();
        let project_file = root.path().join("demo.kiln");
        fs::write(
            &project_file,
            indoc! {"
                name: Demo
                company: Acme
                entry: maps/main.map
                modules: [Physics, Audio]
                build:
                  program: cmake
                  args: [\"--build\", \".\"]
            "},
        )
        .unwrap();

        let project = ProjectSettings::load(&project_file).unwrap();
        assert_eq!(project.project_name(), "Demo");
        assert_eq!(project.config().company, "Acme");
        assert_eq!(project.config().modules, vec!["Physics".to_owned(), "Audio".to_owned()]);
        assert_eq!(project.config().build.as_ref().unwrap().program, "cmake");
        assert!(!project.is_exporting());
        assert!(project.content_path().is_dir());
        assert!(project.import_path().is_dir());
        assert!(project.icon_directory().is_dir());
        assert!(project.generated_path().is_dir());
        assert_eq!(project.index_path(), project.import_path().join("index"));
    }

    #[test]
    fn save_and_load() {
        let root = TempDir::new("root").unwrap();
        let mut project = ProjectSettings::new(root.path(), "Demo").unwrap();
        project.config_mut().company = "Acme".to_owned();
        project.save().unwrap();

        let loaded = ProjectSettings::load(project.project_file()).unwrap();
        assert_eq!(loaded.config(), project.config());
    }

    #[test]
    fn missing_project_file() {
        assert!(ProjectSettings::load("the/wrong/path/demo.kiln").is_err());
    }
}
