//! Directory tree reconstruction for browse responses.
//!
//! Peers lay out browse results by directory name, so every known directory is emitted
//! even when it holds no files. Otherwise anything nested beneath a file-less directory
//! would show up at the root.

use std::collections::BTreeMap;

use crate::model::{parent, BrowseDirectory, FileEntry, SharedFile};

/// Build one [`BrowseDirectory`] per known directory, ordered by name.
///
/// A directory's file list is rebuilt from scratch out of `files`; directories with no
/// files keep an empty list.
pub fn synthesize<'a, D, F>(directories: D, files: F, separator: char) -> Vec<BrowseDirectory>
where
    D: IntoIterator<Item = &'a str>,
    F: IntoIterator<Item = &'a SharedFile>,
{
    let mut tree: BTreeMap<String, Vec<FileEntry>> = directories
        .into_iter()
        .map(|name| (name.to_string(), Vec::new()))
        .collect();

    let mut groups: BTreeMap<&str, Vec<&SharedFile>> = BTreeMap::new();
    for file in files {
        let dir = parent(&file.masked_filename, separator).unwrap_or_default();
        groups.entry(dir).or_default().push(file);
    }

    for (dir, mut group) in groups {
        group.sort_by(|a, b| a.masked_filename.cmp(&b.masked_filename));
        let entries = group.iter().map(|f| f.entry(separator)).collect();
        tree.insert(dir.to_string(), entries);
    }

    tree.into_iter()
        .map(|(name, files)| BrowseDirectory { name, files })
        .collect()
}
