//! Records shared with peers: files, directories and the browse shapes built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol type tag given to every file unless something says otherwise.
pub const DEFAULT_FILE_CODE: i32 = 1;

// ============================================================================
// Files & Directories
// ============================================================================

/// Protocol-defined attribute kinds carried alongside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeKind {
    BitRate,
    Length,
    VariableBitRate,
    SampleRate,
    BitDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttribute {
    pub kind: AttributeKind,
    pub value: u32,
}

impl FileAttribute {
    pub fn new(kind: AttributeKind, value: u32) -> Self {
        Self { kind, value }
    }
}

/// The part of a shared file that travels to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub code: i32,
    /// Extension without the leading dot; empty when the file has none.
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

impl FileMetadata {
    pub fn new(size: u64, extension: impl Into<String>) -> Self {
        Self {
            size,
            code: DEFAULT_FILE_CODE,
            extension: extension.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<FileAttribute>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// A file exposed to the network, keyed by its masked filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFile {
    pub masked_filename: String,
    /// Local filesystem path. Never sent to peers.
    pub original_filename: String,
    pub touched_at: DateTime<Utc>,
    /// Scan generation that last observed this file.
    pub timestamp: i64,
    pub metadata: FileMetadata,
}

impl SharedFile {
    /// Browse entry for this file, reduced to its basename.
    pub fn entry(&self, separator: char) -> FileEntry {
        FileEntry {
            filename: file_name(&self.masked_filename, separator).to_string(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedDirectory {
    pub name: String,
    pub timestamp: i64,
}

// ============================================================================
// Browse
// ============================================================================

/// A file as it appears inside a browse response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub metadata: FileMetadata,
}

/// One directory of a browse response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseDirectory {
    pub name: String,
    pub files: Vec<FileEntry>,
}

// ============================================================================
// Masked path helpers
// ============================================================================

/// Final component of a masked path.
pub fn file_name(masked: &str, separator: char) -> &str {
    masked
        .rsplit_once(separator)
        .map(|(_, name)| name)
        .unwrap_or(masked)
}

/// Parent directory of a masked path, if it has one.
pub fn parent(masked: &str, separator: char) -> Option<&str> {
    masked
        .rsplit_once(separator)
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}

/// Every ancestor directory of a masked path, nearest first.
pub fn ancestors(masked: &str, separator: char) -> impl Iterator<Item = &str> {
    std::iter::successors(parent(masked, separator), move |&dir| parent(dir, separator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_and_parent() {
        assert_eq!(file_name("Music\\Album\\01.mp3", '\\'), "01.mp3");
        assert_eq!(parent("Music\\Album\\01.mp3", '\\'), Some("Music\\Album"));
        assert_eq!(file_name("loose.txt", '\\'), "loose.txt");
        assert_eq!(parent("loose.txt", '\\'), None);
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let found: Vec<&str> = ancestors("A/B/C/d.flac", '/').collect();
        assert_eq!(found, vec!["A/B/C", "A/B", "A"]);
    }

    #[test]
    fn test_entry_strips_directory() {
        let file = SharedFile {
            masked_filename: "Music/Album/01.mp3".to_string(),
            original_filename: "/srv/music/Album/01.mp3".to_string(),
            touched_at: Utc::now(),
            timestamp: 1,
            metadata: FileMetadata::new(1024, "mp3"),
        };
        let entry = file.entry('/');
        assert_eq!(entry.filename, "01.mp3");
        assert_eq!(entry.metadata.code, DEFAULT_FILE_CODE);
    }
}
