use std::{collections::VecDeque, sync::Arc};

use kiln_shared::parking_lot::Mutex;

use crate::AssetSettings;

/// Settings that are shared between the settings cache and the import queue.
pub type SharedSettings = Arc<Mutex<AssetSettings>>;

/// State of the import pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PumpState {
    /// Nothing to do.
    #[default]
    Idle,
    /// Converting the queued assets one per tick.
    Draining,
    /// Waiting for a code builder to finish.
    Rebuilding,
}

/// Ordered queue of the assets that have to be converted.
///
/// The same settings instance is never queued twice.
#[derive(Debug, Default)]
pub struct ImportQueue {
    items: VecDeque<SharedSettings>,
}

impl ImportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the settings. Returns false if they were already queued.
    pub fn push(&mut self, settings: SharedSettings) -> bool {
        if self.contains(&settings) {
            return false;
        }
        self.items.push_back(settings);
        true
    }

    pub fn pop(&mut self) -> Option<SharedSettings> {
        self.items.pop_front()
    }

    pub fn contains(&self, settings: &SharedSettings) -> bool {
        self.items.iter().any(|item| Arc::ptr_eq(item, settings))
    }

    /// Sorts the queue by type name. Assets of the same type keep their order.
    pub fn sort_by_type(&mut self) {
        self.items
            .make_contiguous()
            .sort_by_cached_key(|settings| settings.lock().type_name().to_owned());
    }

    pub fn retain(&mut self, mut f: impl FnMut(&AssetSettings) -> bool) {
        self.items.retain(|settings| f(&settings.lock()));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoOptions;

    fn settings(source: &str, type_name: &str) -> SharedSettings {
        Arc::new(Mutex::new(AssetSettings::new(source, "/cache/import", type_name, Box::new(NoOptions))))
    }

    #[test]
    fn push_deduplicates_by_identity() {
        let mut queue = ImportQueue::new();
        let a = settings("/content/a.txt", "Text");
        let same_path = settings("/content/a.txt", "Text");
        assert!(queue.push(a.clone()));
        assert!(!queue.push(a.clone()));
        assert!(queue.push(same_path));
        assert_eq!(queue.len(), 2);
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &a));
    }

    #[test]
    fn sort_is_stable() {
        let mut queue = ImportQueue::new();
        for (source, type_name) in [("/c/1", "Text"), ("/c/2", "Mesh"), ("/c/3", "Text"), ("/c/4", "Mesh")] {
            queue.push(settings(source, type_name));
        }
        queue.sort_by_type();
        let mut order = Vec::new();
        while let Some(settings) = queue.pop() {
            order.push(settings.lock().source().to_string_lossy().into_owned());
        }
        assert_eq!(order, vec!["/c/2", "/c/4", "/c/1", "/c/3"]);
    }

    #[test]
    fn retain_removes_items() {
        let mut queue = ImportQueue::new();
        queue.push(settings("/c/a.txt", "Text"));
        queue.push(settings("/c/b.txt", "Text"));
        queue.retain(|settings| !settings.source().ends_with("a.txt"));
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
        queue.clear();
        assert!(queue.is_empty());
    }
}
