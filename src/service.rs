//! Share service: one scan feeds both the cache and the repository.

use serde::Serialize;
use tracing::{debug, info, info_span, warn, Span};

use crate::cache::ShareCache;
use crate::config::Config;
use crate::error::Result;
use crate::model::{BrowseDirectory, SharedFile};
use crate::query::SearchQuery;
use crate::repository::Repository;
use crate::scan::{ScanWarning, Scanner};

/// Outcome of a rescan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RescanSummary {
    pub generation: i64,
    pub directories: usize,
    pub files: usize,
    pub pruned_directories: usize,
    pub pruned_files: usize,
    #[serde(skip)]
    pub warnings: Vec<ScanWarning>,
}

pub struct ShareService {
    cache: ShareCache,
    repository: Repository,
    span: Span,
}

impl ShareService {
    pub fn new(cache: ShareCache, repository: Repository) -> Self {
        Self {
            cache,
            repository,
            span: info_span!("share_service"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Open the configured repository, recreating it if its schema has drifted.
    pub fn open(config: &Config) -> Result<Self> {
        let span = info_span!("share_service");
        let repository = Repository::new(&config.database)
            .with_separator(config.separator)
            .with_span(info_span!(parent: &span, "repository"));

        let valid = repository.is_valid();
        if !valid {
            warn!(parent: &span, path = %config.database.display(), "Share repository missing or invalid, recreating");
        }
        repository.create(!valid)?;

        let floor = repository.latest_generation()?.unwrap_or_default();
        let scanner = Scanner::from_config(config)?.with_span(info_span!(parent: &span, "scanner"));
        let cache = ShareCache::new(scanner, config.cache_ttl())
            .with_generation_floor(floor)
            .with_span(info_span!(parent: &span, "share_cache"));

        Ok(Self {
            cache,
            repository,
            span,
        })
    }

    pub fn cache(&self) -> &ShareCache {
        &self.cache
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Scan once, publish into the cache, persist, then prune what the scan did not see.
    pub fn rescan(&self) -> Result<RescanSummary> {
        let (event, scan) = self.cache.rescan()?;

        self.repository.insert_scan(&scan)?;
        let pruned_directories = self.repository.prune_directories(scan.generation)?;
        let pruned_files = self.repository.prune_files(scan.generation)?;

        let summary = RescanSummary {
            generation: scan.generation,
            directories: event.directories,
            files: event.files,
            pruned_directories,
            pruned_files,
            warnings: scan.warnings,
        };
        info!(
            parent: &self.span,
            generation = summary.generation,
            directories = summary.directories,
            files = summary.files,
            pruned_directories,
            pruned_files,
            warnings = summary.warnings.len(),
            "Rescan complete"
        );
        Ok(summary)
    }

    /// Search the cache once it has been filled, the repository before that.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SharedFile>> {
        if self.cache.is_filled() {
            return self.cache.search(query);
        }
        debug!(parent: &self.span, "Share cache cold, searching repository");
        self.repository.search(query)
    }

    pub fn browse(&self) -> Result<Vec<BrowseDirectory>> {
        self.cache.browse()
    }

    /// Local path for a masked filename requested by a peer.
    pub fn resolve(&self, masked: &str) -> Result<Option<String>> {
        match self.repository.find_filename(masked)? {
            Some(original) => Ok(Some(original)),
            None => Ok(self.cache.find(masked)),
        }
    }
}
