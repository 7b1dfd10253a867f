//! SFTP data types

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// One directory entry as shown in the file browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// File name (not full path)
    pub name: String,
    pub is_directory: bool,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, is_directory: bool) -> Self {
        Self {
            name: name.into(),
            is_directory,
        }
    }
}

/// Directories first, then bytewise by name (case-sensitive, locale-independent)
pub fn listing_order(a: &FileEntry, b: &FileEntry) -> Ordering {
    b.is_directory
        .cmp(&a.is_directory)
        .then_with(|| a.name.as_bytes().cmp(b.name.as_bytes()))
}
