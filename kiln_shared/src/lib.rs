//! Third-party stack shared by all kiln crates.
//!
//! The crates of the workspace import these dependencies through `kiln_shared` so
//! that every crate uses the same versions.

pub use chrono;
pub use crossbeam_channel;
pub use indoc;
pub use log;
pub use parking_lot;
pub use pathdiff;
pub use serde_json;
pub use thiserror;
pub use uuid;
pub use walkdir;
