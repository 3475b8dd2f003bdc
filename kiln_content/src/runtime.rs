use std::path::Path;

use kiln_shared::log::trace;

use crate::Guid;

/// The part of the engine that loads the artifacts.
///
/// The [`AssetManager`](crate::AssetManager) tells the runtime when the manifest was
/// rewritten and when single artifacts changed.
pub trait Runtime: Send {
    /// Reloads the bundle manifest. Returns false if the manifest couldn't be loaded.
    fn reload_bundle(&mut self) -> bool;

    /// Reloads the resource if it's currently loaded.
    fn reload_resource(&mut self, guid: &Guid);

    /// Unloads the resource of a deleted source file.
    fn unload_resource(&mut self, path: &Path);
}

/// Runtime that doesn't load anything. Used by command line tools.
#[derive(Debug, Default)]
pub struct NullRuntime;

impl Runtime for NullRuntime {
    fn reload_bundle(&mut self) -> bool {
        true
    }

    fn reload_resource(&mut self, guid: &Guid) {
        trace!("Resource {guid} changed");
    }

    fn unload_resource(&mut self, path: &Path) {
        trace!("Resource {path:?} was removed");
    }
}
