//! Integration tests for the persistence backends behind a live registry.
//!
//! Tests the full lifecycle: edit → sweep saves → eviction → reload, and
//! nullified documents disappearing from storage.

use std::sync::Arc;
use std::time::Duration;

use mobwrite_sync::storage::{
    FileStore, Persister, RocksStore, Storage, StorageConfig, StorageMode,
};
use mobwrite_sync::{SessionRegistry, SyncConfig, SyncService};

fn service_on(persister: Arc<dyn Persister>) -> SyncService {
    SyncService::new(Arc::new(SessionRegistry::new(SyncConfig::for_testing(), persister)))
}

/// Let every view idle out, then sweep.
fn idle_sweep(service: &SyncService) {
    std::thread::sleep(Duration::from_millis(80));
    service.registry().cleanup();
}

fn open(mode: StorageMode, dir: &tempfile::TempDir) -> Arc<Storage> {
    let config = StorageConfig::new(mode, dir.path().join("data"));
    Arc::new(Storage::open(&config).unwrap())
}

#[test]
fn test_every_backend_round_trips() {
    for mode in [StorageMode::Memory, StorageMode::File, StorageMode::Rocks] {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(mode, &dir);
        assert_eq!(storage.mode(), mode);

        assert_eq!(storage.load("notes").unwrap(), None);
        storage.save("notes", Some("héllo\nwörld")).unwrap();
        assert_eq!(storage.load("notes").unwrap().as_deref(), Some("héllo\nwörld"));
        storage.save("notes", None).unwrap();
        assert_eq!(storage.load("notes").unwrap(), None, "{mode} delete");
        // Deleting twice is fine.
        storage.save("notes", None).unwrap();
    }
}

#[test]
fn test_evicted_text_reloads_from_rocks() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open(StorageMode::Rocks, &dir);
    let service = service_on(storage.clone());

    service.handle_request("u:alice\nf:0:doc\nr:0:Saved%20text\n\n");
    idle_sweep(&service);
    assert_eq!(service.registry().stats().texts, 0);
    assert_eq!(storage.load("doc").unwrap().as_deref(), Some("Saved text"));

    let reply = service.handle_request("u:bob\nf:0:doc\nr:0:Saved%20text\n\n");
    assert_eq!(reply, "F:0:doc\nd:0:=10\n");
}

#[test]
fn test_nullified_file_is_deleted_at_next_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let service = service_on(store.clone());

    service.handle_request("u:alice\nf:0:doc\nr:0:Hello\n\n");
    service.registry().cleanup();
    let path = store.file_path("doc");
    assert!(path.exists());

    service.handle_request("u:alice\nn:doc\n\n");
    assert!(path.exists());
    service.registry().cleanup();
    assert!(!path.exists());
}

#[test]
fn test_documents_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = open(StorageMode::Rocks, &dir);
        let service = service_on(storage);
        service.handle_request("u:alice\nf:0:a\nr:0:first\nf:0:b\nr:0:second\n\n");
        assert_eq!(service.registry().flush(), 0);
    }

    let rocks = RocksStore::open(dir.path().join("data")).unwrap();
    let mut names = rocks.list_texts().unwrap();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(rocks.load("b").unwrap().as_deref(), Some("second"));
}

#[test]
fn test_purge_expired_file_documents() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open(StorageMode::File, &dir);
    storage.save("old", Some("stale")).unwrap();
    assert_eq!(storage.purge_expired(Duration::from_secs(3600)).unwrap(), 0);

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(storage.purge_expired(Duration::from_millis(1)).unwrap(), 1);
    assert_eq!(storage.load("old").unwrap(), None);
}
