use std::fs;
use std::path::PathBuf;

use rusqlite::Connection;
use shareindex::{Config, Repository, SearchQuery, ShareConfig, ShareService};
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    config: Config,
}

/// A single share named `music` holding two albums.
fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("music");
    fs::create_dir_all(root.join("album")).unwrap();
    fs::create_dir_all(root.join("live")).unwrap();
    fs::write(root.join("album/intro.mp3"), b"intro").unwrap();
    fs::write(root.join("album/outro.mp3"), b"outro").unwrap();
    fs::write(root.join("live/encore.mp3"), b"encore").unwrap();

    let config = Config {
        shares: vec![ShareConfig::new(&root)],
        database: temp.path().join("db/shares.db"),
        separator: '/',
        ..Config::default()
    };
    Fixture {
        _temp: temp,
        root,
        config,
    }
}

#[test]
fn test_open_creates_repository() {
    let fx = fixture();
    let service = ShareService::open(&fx.config).unwrap();

    assert!(service.repository().is_valid());
    assert!(!service.cache().is_filled());
}

#[test]
fn test_rescan_persists_scan() {
    let fx = fixture();
    let service = ShareService::open(&fx.config).unwrap();

    let summary = service.rescan().unwrap();
    assert_eq!(summary.files, 3);
    assert_eq!(summary.directories, 3);
    assert_eq!((summary.pruned_files, summary.pruned_directories), (0, 0));
    assert!(summary.warnings.is_empty());

    let repo = service.repository();
    assert_eq!(repo.count_files(None).unwrap(), 3);
    assert_eq!(repo.count_directories(Some("music/")).unwrap(), 2);
    assert_eq!(repo.latest_generation().unwrap(), Some(summary.generation));
    assert!(service.cache().is_filled());
}

#[test]
fn test_rescan_prunes_removed_files() {
    let fx = fixture();
    let service = ShareService::open(&fx.config).unwrap();
    service.rescan().unwrap();

    fs::remove_dir_all(fx.root.join("live")).unwrap();
    let summary = service.rescan().unwrap();

    assert_eq!(summary.pruned_files, 1);
    assert_eq!(summary.pruned_directories, 1);
    assert_eq!(service.resolve("music/live/encore.mp3").unwrap(), None);
    assert!(service
        .search(&SearchQuery::terms(["encore"]))
        .unwrap()
        .is_empty());
}

#[test]
fn test_cold_cache_searches_repository() {
    let fx = fixture();
    let generation = {
        let service = ShareService::open(&fx.config).unwrap();
        service.rescan().unwrap().generation
    };

    // Files removed after the last rescan are still served from the repository
    fs::remove_file(fx.root.join("album/outro.mp3")).unwrap();

    let service = ShareService::open(&fx.config).unwrap();
    assert!(!service.cache().is_filled());

    let results = service.search(&SearchQuery::terms(["album"])).unwrap();
    let names: Vec<&str> = results.iter().map(|f| f.masked_filename.as_str()).collect();
    assert_eq!(names, vec!["music/album/intro.mp3", "music/album/outro.mp3"]);
    assert!(!service.cache().is_filled());

    let summary = service.rescan().unwrap();
    assert!(summary.generation > generation);
    assert_eq!(summary.pruned_files, 1);
}

#[test]
fn test_resolve_masked_filename() {
    let fx = fixture();
    let service = ShareService::open(&fx.config).unwrap();
    service.rescan().unwrap();

    let local = service.resolve("music/album/intro.mp3").unwrap().unwrap();
    assert_eq!(PathBuf::from(local), fx.root.join("album/intro.mp3"));
    assert_eq!(service.resolve("music/album/missing.mp3").unwrap(), None);
}

#[test]
fn test_browse_after_rescan() {
    let fx = fixture();
    let service = ShareService::open(&fx.config).unwrap();
    service.rescan().unwrap();

    let browse = service.browse().unwrap();
    let album = browse.iter().find(|d| d.name == "music/album").unwrap();
    let files: Vec<&str> = album.files.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(files, vec!["intro.mp3", "outro.mp3"]);
}

#[test]
fn test_open_recreates_invalid_schema() {
    let fx = fixture();
    fs::create_dir_all(fx.config.database.parent().unwrap()).unwrap();
    Connection::open(&fx.config.database)
        .unwrap()
        .execute_batch("CREATE TABLE files (maskedFilename TEXT)")
        .unwrap();
    assert!(!Repository::new(&fx.config.database).is_valid());

    let service = ShareService::open(&fx.config).unwrap();
    assert!(service.repository().is_valid());
    assert_eq!(service.rescan().unwrap().files, 3);
}

#[test]
fn test_accented_search_agrees_before_and_after_warm_up() {
    let fx = fixture();
    fs::write(fx.root.join("album/Beyoncé - Halo.mp3"), b"halo").unwrap();
    fs::write(fx.root.join("live/Café del Mar.mp3"), b"cafe").unwrap();
    {
        let service = ShareService::open(&fx.config).unwrap();
        service.rescan().unwrap();
    }

    let queries = [
        SearchQuery::terms(["beyonce"]),
        SearchQuery::terms(["BEYONCÉ", "halo"]),
        SearchQuery::new(["mp3"], ["cafe"]),
        SearchQuery::new(Vec::<String>::new(), ["café", "album"]),
    ];

    let service = ShareService::open(&fx.config).unwrap();
    let cold: Vec<Vec<String>> = queries
        .iter()
        .map(|q| masked_names(&service.search(q).unwrap()))
        .collect();
    assert!(!service.cache().is_filled());

    service.cache().fill().unwrap();
    let warm: Vec<Vec<String>> = queries
        .iter()
        .map(|q| masked_names(&service.search(q).unwrap()))
        .collect();

    assert_eq!(cold, warm);
    assert_eq!(cold[0], vec!["music/album/Beyoncé - Halo.mp3"]);
    assert_eq!(cold[3], vec!["music/live/encore.mp3"]);
}

fn masked_names(files: &[shareindex::SharedFile]) -> Vec<String> {
    let mut names: Vec<String> = files.iter().map(|f| f.masked_filename.clone()).collect();
    names.sort();
    names
}
