//! # Overview
//!
//! Crate for [importing](AssetManager) the source files of a project into artifacts
//! that the engine can load.
//!
//! A project has a content directory with the source files and an import cache that
//! contains one artifact per imported asset. The artifacts are named after their
//! [`Guid`], so renaming a source file never touches the import cache. Next to every
//! source file there is a sidecar file (`<source>.set`) with the import options and
//! the state of the last conversion.
//!
//! ## Example:
//!
//! **Content Directory:**
//!
//! ```text
//! content/
//! ├─ texts/
//! │  ├─ intro.txt
//! │  ├─ intro.txt.set
//! ├─ src/
//! │  ├─ player.cpp
//! │  ├─ player.cpp.set
//! ```
//!
//! **Import Cache:**
//!
//! ```text
//! cache/import/
//! ├─ {67e55044-10b1-426f-9247-bb680e5fe0c8}
//! ├─ index
//! ```
//!
//! The `index` file is the manifest of all registered assets which the runtime loads.
//!
//! # Components
//!
//! * [`ConverterRegistry`] maps file suffixes to [`Converter`]s and [`CodeBuilder`]s.
//! * [`AssetSettings`] tracks whether an asset is outdated.
//! * [`index::AssetIndex`] maps the paths of the assets to their artifacts.
//! * [`AssetManager`] drives the import one asset per [`tick`](AssetManager::tick).
//!   Source code is not converted per file. A [`CodeBuilder`] compiles all sources
//!   of the project after the other assets are imported.

mod common;
mod guid;
mod project;

pub mod builder;
pub mod converter;
pub mod converters;
pub mod index;
pub mod manager;
pub mod queue;
pub mod runtime;
pub mod settings;
pub mod watcher;

pub use builder::{BuilderId, CodeBuilder, NativeCodeBuilder, Toolchain};
pub use common::{meta_path, AssetKey, Error, Result, INDEX_FILE_NAME, META_EXTENSION};
pub use converter::{Converter, ConverterRegistry, Handler, Registration, ReturnCode};
pub use guid::{type_id, ContentHash, Guid};
pub use manager::{AssetManager, Event, ImportDecision, TICK_INTERVAL};
pub use project::{BuildCommand, ProjectConfig, ProjectSettings};
pub use queue::{ImportQueue, PumpState, SharedSettings};
pub use settings::{AssetSettings, ImportOptions, NoOptions, PropertyDef, Schema, SubItem};
