//! Share scanner: walks configured roots and produces a masked snapshot.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, info_span, warn, Span};
use walkdir::{DirEntry, WalkDir};

use crate::config::{Config, ScanFailurePolicy, ShareConfig, DEFAULT_SEPARATOR};
use crate::error::{Error, Result};
use crate::model::{ancestors, FileMetadata, SharedFile};

/// Non-fatal problems found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanWarning {
    /// Two roots produced the same masked filename; the later root won.
    Collision {
        masked: String,
        kept: String,
        replaced: String,
    },
    /// A root could not be enumerated and was left out.
    RootUnavailable { root: PathBuf, message: String },
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collision {
                masked,
                kept,
                replaced,
            } => write!(
                f,
                "Masked filename {masked} is shared twice; {kept} replaces {replaced}"
            ),
            Self::RootUnavailable { root, message } => {
                write!(f, "Share root {} skipped: {message}", root.display())
            }
        }
    }
}

/// A complete, normalised snapshot of every share.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Scan generation stamped on every record.
    pub generation: i64,
    pub directories: BTreeSet<String>,
    pub files: HashMap<String, SharedFile>,
    pub warnings: Vec<ScanWarning>,
}

/// Hands out scan generations: wall-clock milliseconds, strictly increasing.
#[derive(Debug, Default)]
pub struct GenerationClock {
    last: AtomicI64,
}

impl GenerationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose first generation is greater than `floor`.
    pub fn starting_after(floor: i64) -> Self {
        Self {
            last: AtomicI64::new(floor),
        }
    }

    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

/// Everything one root contributed.
#[derive(Default)]
struct RootScan {
    directories: Vec<String>,
    files: Vec<SharedFile>,
}

pub struct Scanner {
    shares: Vec<ShareConfig>,
    separator: char,
    filters: Vec<Regex>,
    policy: ScanFailurePolicy,
    span: Span,
}

impl Scanner {
    pub fn new(shares: Vec<ShareConfig>) -> Self {
        Self {
            shares,
            separator: DEFAULT_SEPARATOR,
            filters: Vec::new(),
            policy: ScanFailurePolicy::default(),
            span: info_span!("scanner"),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let filters = config
            .compile_filters()
            .map_err(|e| Error::config("filters", e.to_string()))?;
        Ok(Self::new(config.shares.clone())
            .with_separator(config.separator)
            .with_filters(filters)
            .with_policy(config.on_root_failure))
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_filters(mut self, filters: Vec<Regex>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_policy(mut self, policy: ScanFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn shares(&self) -> &[ShareConfig] {
        &self.shares
    }

    /// Scan every share root, stamping records with `generation`.
    pub fn scan(&self, generation: i64) -> Result<ScanResult> {
        let start = Instant::now();
        let excluded: Vec<&Path> = self
            .shares
            .iter()
            .filter(|s| s.exclude)
            .map(|s| s.path.as_path())
            .collect();

        let mut result = ScanResult {
            generation,
            ..ScanResult::default()
        };

        for share in self.shares.iter().filter(|s| !s.exclude) {
            info!(parent: &self.span, root = %share.path.display(), "Scanning share");

            let root = match self.scan_root(share, generation, &excluded) {
                Ok(root) => root,
                Err(e) => match self.policy {
                    ScanFailurePolicy::Abort => return Err(Error::scan(&share.path, e)),
                    ScanFailurePolicy::Skip => {
                        warn!(parent: &self.span, root = %share.path.display(), "Skipping share root: {}", e);
                        result.warnings.push(ScanWarning::RootUnavailable {
                            root: share.path.clone(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                },
            };

            result.directories.extend(root.directories);
            for file in root.files {
                let kept = file.original_filename.clone();
                if let Some(previous) = result.files.insert(file.masked_filename.clone(), file) {
                    let warning = ScanWarning::Collision {
                        masked: previous.masked_filename,
                        kept,
                        replaced: previous.original_filename,
                    };
                    warn!(parent: &self.span, "{}", warning);
                    result.warnings.push(warning);
                }
            }
        }

        // Every ancestor of every masked path must be browsable
        let mut parents = BTreeSet::new();
        for name in result.files.keys().chain(result.directories.iter()) {
            for dir in ancestors(name, self.separator) {
                if !result.directories.contains(dir) {
                    parents.insert(dir.to_string());
                }
            }
        }
        result.directories.extend(parents);

        info!(
            parent: &self.span,
            "Scanned {} directories and {} files in {:?}",
            result.directories.len(),
            result.files.len(),
            start.elapsed()
        );

        Ok(result)
    }

    fn scan_root(&self, share: &ShareConfig, generation: i64, excluded: &[&Path]) -> io::Result<RootScan> {
        let root = share.path.as_path();
        if !root.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a readable directory"));
        }

        let alias = share.remote_name();
        let mut scan = RootScan::default();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_excluded(e.path(), excluded));

        for entry in walker {
            let entry = entry?;
            let masked = self.mask(&alias, root, entry.path());

            if entry.file_type().is_dir() {
                scan.directories.push(masked);
            } else if entry.file_type().is_file() {
                if self.is_filtered(entry.path()) {
                    debug!(parent: &self.span, path = %entry.path().display(), "Filtered");
                    continue;
                }
                scan.files.push(shared_file(&entry, masked, generation)?);
            }
        }

        Ok(scan)
    }

    /// Masked form of `path`: the alias followed by the path relative to `root`.
    fn mask(&self, alias: &str, root: &Path, path: &Path) -> String {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let mut masked = alias.to_string();
        for component in relative.components() {
            masked.push(self.separator);
            masked.push_str(&component.as_os_str().to_string_lossy());
        }
        masked
    }

    fn is_filtered(&self, path: &Path) -> bool {
        let local = path.to_string_lossy();
        self.filters.iter().any(|f| f.is_match(&local))
    }
}

fn is_excluded(path: &Path, excluded: &[&Path]) -> bool {
    excluded.iter().any(|x| path.starts_with(x))
}

fn shared_file(entry: &DirEntry, masked: String, generation: i64) -> io::Result<SharedFile> {
    let meta = entry.metadata()?;
    let touched_at: DateTime<Utc> = meta.modified().unwrap_or(UNIX_EPOCH).into();
    let extension = entry
        .path()
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(SharedFile {
        masked_filename: masked,
        original_filename: entry.path().to_string_lossy().into_owned(),
        touched_at,
        timestamp: generation,
        metadata: FileMetadata::new(meta.len(), extension),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn share_tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("music");
        fs::create_dir_all(root.join("album/disc1")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("album/disc1/01.flac"), b"flac").unwrap();
        fs::write(root.join("album/cover.jpg"), b"jpeg!").unwrap();
        fs::write(root.join("README"), b"x").unwrap();
        temp
    }

    #[test]
    fn test_scan_masks_paths_under_alias() {
        let temp = share_tree();
        let scanner = Scanner::new(vec![ShareConfig::new(temp.path().join("music"))]);
        let result = scanner.scan(7).unwrap();

        let file = &result.files["music\\album\\disc1\\01.flac"];
        assert_eq!(file.metadata.size, 4);
        assert_eq!(file.metadata.extension, "flac");
        assert_eq!(file.timestamp, 7);
        assert!(file.original_filename.ends_with("01.flac"));
        assert_eq!(result.files["music\\README"].metadata.extension, "");

        for dir in ["music", "music\\album", "music\\album\\disc1", "music\\empty"] {
            assert!(result.directories.contains(dir), "missing {dir}");
        }
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_alias_ancestors_are_directories() {
        let temp = share_tree();
        let share = ShareConfig::new(temp.path().join("music")).with_alias("users/alice");
        let result = Scanner::new(vec![share]).with_separator('/').scan(1).unwrap();
        assert!(result.directories.contains("users"));
        assert!(result.directories.contains("users/alice/album"));
    }

    #[test]
    fn test_excluded_subtree_and_filters() {
        let temp = share_tree();
        let root = temp.path().join("music");
        let scanner = Scanner::new(vec![
            ShareConfig::new(&root),
            ShareConfig::excluded(root.join("album/disc1")),
        ])
        .with_filters(vec![Regex::new(r"\.jpg$").unwrap()]);

        let result = scanner.scan(1).unwrap();
        assert!(!result.directories.contains("music\\album\\disc1"));
        assert!(!result.files.contains_key("music\\album\\disc1\\01.flac"));
        assert!(!result.files.contains_key("music\\album\\cover.jpg"));
        assert!(result.files.contains_key("music\\README"));
    }

    #[test]
    fn test_generations_strictly_increase() {
        let clock = GenerationClock::starting_after(i64::MAX - 10);
        let first = clock.next();
        assert_eq!(first, i64::MAX - 9);
        assert_eq!(clock.next(), first + 1);

        let wall = GenerationClock::new();
        let a = wall.next();
        let b = wall.next();
        assert!(b > a);
    }

    #[test]
    fn test_missing_root_skip_and_abort() {
        let temp = share_tree();
        let shares = vec![
            ShareConfig::new(temp.path().join("missing")),
            ShareConfig::new(temp.path().join("music")),
        ];

        let skipped = Scanner::new(shares.clone()).scan(1).unwrap();
        assert_eq!(skipped.files.len(), 3);
        assert!(matches!(
            skipped.warnings.as_slice(),
            [ScanWarning::RootUnavailable { .. }]
        ));

        let aborted = Scanner::new(shares)
            .with_policy(ScanFailurePolicy::Abort)
            .scan(1);
        assert!(matches!(aborted, Err(Error::Scan { .. })));
    }
}
