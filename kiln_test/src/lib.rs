use std::{
    fs,
    path::{Path, PathBuf},
    sync::Once,
};

use kiln_shared::log::LevelFilter;

/// Installs a logger that prints everything the tests log. Can be called from every test.
pub fn setup_logger() {
    static LOGGER: Once = Once::new();
    LOGGER.call_once(|| {
        simple_logger::SimpleLogger::new()
            .with_level(LevelFilter::Trace)
            .init()
            .expect("failed to initialize the logger");
    });
}

/// Writes `content` to `root/relative_path` and creates the parent directories. Returns the absolute path.
pub fn write_file(root: impl AsRef<Path>, relative_path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> PathBuf {
    let path = root.as_ref().join(relative_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap_or_else(|_| panic!("Failed to create directory \"{}\"", parent.to_string_lossy()));
    }
    fs::write(&path, content).unwrap_or_else(|_| panic!("Failed to write file \"{}\"", path.to_string_lossy()));
    path
}

/// Reads a file that the test expects to exist.
pub fn read_file(path: impl AsRef<Path>) -> String {
    fs::read_to_string(&path).unwrap_or_else(|err| panic!("Failed to read file \"{}\": {err}", path.as_ref().to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read() {
        let root = std::env::temp_dir().join("kiln_test_write_and_read");
        let path = write_file(&root, "nested/file.txt", "Hello World!");
        assert_eq!(read_file(&path), "Hello World!");
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    #[should_panic]
    fn read_missing_file() {
        read_file("the/wrong/path/to/the/file");
    }
}
