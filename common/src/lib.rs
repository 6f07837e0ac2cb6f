//! Shared types for chanfs: the error taxonomy, configuration, the entry
//! data model and path helpers.

pub mod config;
pub mod entry;
pub mod error;
pub mod path;
pub mod utils;

pub use config::*;
pub use entry::{Entry, EntryState, Part, FOLDER_TYPE, ROOT_ID};
pub use error::{Error, Result, Transient};
pub use path::*;
