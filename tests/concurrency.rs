//! Cross-helper and cross-lock behavior under concurrent use

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use token_cache_persistence::{
    CacheHelper, CrossPlatLock, FileAccessor, InMemoryTokenCache, LockOptions, Storage,
    StorageCreationProperties, StorageCreationPropertiesBuilder,
};

fn append(log: &Path, line: String) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .unwrap();
    writeln!(file, "{line}").unwrap();
}

fn props(dir: &TempDir) -> StorageCreationProperties {
    StorageCreationPropertiesBuilder::new("msal.cache", dir.path())
        .with_lock_retry(Duration::from_millis(5), 2000)
        .build()
        .unwrap()
}

fn file_helper(props: &StorageCreationProperties) -> CacheHelper {
    let path = props.cache_file_path();
    let storage = Storage::with_accessor(Box::new(FileAccessor::new(&path)), &path);
    CacheHelper::with_storage(props, Arc::new(storage))
}

#[test]
fn lock_holders_never_overlap() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("msal.cache.lockfile");
    let log = dir.path().join("access.log");

    let workers: Vec<_> = (0..8)
        .map(|id| {
            let lock_path = lock_path.clone();
            let log = log.clone();
            thread::spawn(move || run_lock_rounds(&lock_path, &log, &format!("t{id}"), 5))
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_no_interleaving(&log, 8 * 5 * 2);
    assert!(!lock_path.exists());
}

const LOCK_WORKER_ENV: &str = "TOKEN_CACHE_LOCK_WORKER";

fn run_lock_rounds(lock_path: &Path, log: &Path, id: &str, rounds: usize) {
    let options = LockOptions::new(Duration::from_millis(5), 2000);
    for round in 0..rounds {
        let mut lock = CrossPlatLock::acquire(lock_path, options).unwrap();
        append(log, format!("enter {id}-{round}"));
        thread::sleep(Duration::from_millis(2));
        append(log, format!("exit {id}-{round}"));
        lock.release();
    }
}

fn assert_no_interleaving(log: &Path, expected_lines: usize) {
    let content = std::fs::read_to_string(log).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), expected_lines);
    for pair in lines.chunks(2) {
        let enter = pair[0].strip_prefix("enter ").unwrap();
        let exit = pair[1].strip_prefix("exit ").unwrap();
        assert_eq!(enter, exit, "interleaved access: {pair:?}");
    }
}

/// Entry point for child processes spawned by `lock_excludes_other_processes`
#[test]
fn lock_worker_process() {
    let Ok(job) = std::env::var(LOCK_WORKER_ENV) else {
        return;
    };
    let mut parts = job.splitn(3, '|');
    let (Some(id), Some(lock_path), Some(log)) = (parts.next(), parts.next(), parts.next()) else {
        panic!("malformed worker job: {job}");
    };
    run_lock_rounds(Path::new(lock_path), Path::new(log), id, 5);
}

#[test]
fn lock_excludes_other_processes() {
    let dir = TempDir::new().unwrap();
    let lock_path: PathBuf = dir.path().join("msal.cache.lockfile");
    let log = dir.path().join("access.log");
    let exe = std::env::current_exe().unwrap();

    let children: Vec<_> = (0..4)
        .map(|id| {
            Command::new(&exe)
                .args(["lock_worker_process", "--exact", "--test-threads=1"])
                .env(
                    LOCK_WORKER_ENV,
                    format!("p{id}|{}|{}", lock_path.display(), log.display()),
                )
                .spawn()
                .unwrap()
        })
        .collect();

    // This process competes for the same lock while the children run
    run_lock_rounds(&lock_path, &log, "parent", 5);

    for mut child in children {
        assert!(child.wait().unwrap().success());
    }

    assert_no_interleaving(&log, 5 * 5 * 2);
    assert!(!lock_path.exists());
}

#[test]
fn concurrent_helpers_merge_every_write() {
    let dir = TempDir::new().unwrap();
    let props = props(&dir);

    let workers: Vec<_> = (0..4)
        .map(|id| {
            let props = props.clone();
            thread::spawn(move || {
                let helper = file_helper(&props);
                let cache = Arc::new(InMemoryTokenCache::new());
                helper.register_cache(cache.clone()).unwrap();
                for n in 0..5 {
                    cache
                        .insert(format!("account-{id}-{n}"), format!("token-{n}"))
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let persisted: BTreeMap<String, String> =
        serde_json::from_slice(&std::fs::read(props.cache_file_path()).unwrap()).unwrap();
    assert_eq!(persisted.len(), 4 * 5);
    assert_eq!(persisted.get("account-3-4"), Some(&"token-4".to_string()));
}

#[test]
fn late_helper_sees_earlier_writes() {
    let dir = TempDir::new().unwrap();
    let props = props(&dir);

    let writer = file_helper(&props);
    let cache = Arc::new(InMemoryTokenCache::new());
    writer.register_cache(cache.clone()).unwrap();
    cache.insert("account", "token").unwrap();
    drop(writer);

    let reader = file_helper(&props);
    let fresh = Arc::new(InMemoryTokenCache::new());
    reader.register_cache(fresh.clone()).unwrap();
    assert_eq!(fresh.get("account").unwrap(), Some("token".to_string()));
}

#[test]
fn corrupt_blob_is_reset_by_next_reader() {
    let dir = TempDir::new().unwrap();
    let props = props(&dir);

    let helper_a = file_helper(&props);
    let helper_b = file_helper(&props);
    let cache_a = Arc::new(InMemoryTokenCache::new());
    let cache_b = Arc::new(InMemoryTokenCache::new());
    helper_a.register_cache(cache_a.clone()).unwrap();
    helper_b.register_cache(cache_b.clone()).unwrap();

    cache_a.insert("account", "token").unwrap();
    std::fs::write(props.cache_file_path(), b"not json").unwrap();

    assert!(cache_b.get("account").is_err());
    assert!(!props.cache_file_path().exists());

    // Both helpers keep working against the emptied store
    assert_eq!(cache_b.get("account").unwrap(), None);
    cache_a.insert("other", "token").unwrap();
    assert_eq!(cache_b.get("other").unwrap(), Some("token".to_string()));
}
