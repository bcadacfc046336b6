//! Buffered writes through the adapter, committed into an in-memory store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use filer_core::hash::hash_bytes;
use filer_core::types::MKDIR_MODE;
use filer_core::FilerError;
use filer_fuse::WriteBufferAdapter;
use filer_store::{ContentStore, OpendalStore};

async fn store() -> Arc<OpendalStore> {
    let store = OpendalStore::memory().unwrap();
    store.create_dir_all("/objects", MKDIR_MODE).await.unwrap();
    Arc::new(store)
}

async fn adapter(store: Arc<OpendalStore>, dir: &std::path::Path, wait: Duration) -> WriteBufferAdapter {
    WriteBufferAdapter::new(store, dir, wait, false).await.unwrap()
}

#[tokio::test]
async fn create_write_release_commits_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let a = adapter(store.clone(), dir.path(), Duration::from_secs(1)).await;
    let mut persisted = a.subscribe_persisted();

    let fh = a.create("/objects/a.txt", 0o644).await.unwrap();
    assert_eq!(a.write("/objects/a.txt", fh, b"abc", 0).await.unwrap(), 3);
    a.release("/objects/a.txt", fh).await.unwrap();

    assert_eq!(persisted.recv().await.unwrap(), "/objects/a.txt");
    let stat = store.stat("/objects/a.txt").await.unwrap();
    assert_eq!(stat.size, 3);
    assert_eq!(stat.content_hash.as_deref(), Some(hash_bytes(b"abc").as_str()));
    assert_eq!(&store.read_file("/objects/a.txt").await.unwrap()[..], b"abc");
    assert_eq!(a.getattr("/objects/a.txt").await.unwrap().size, 3);

    let stats = a.stats();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.open_writes, 0);
    assert_eq!(stats.buffered, 0);
}

#[tokio::test]
async fn large_buffer_commits_intact() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let a = adapter(store.clone(), dir.path(), Duration::from_secs(1)).await;

    let block: Vec<u8> = (0..256 * 1024).map(|i| (i % 199) as u8).collect();
    let fh = a.create("/objects/big.bin", 0o644).await.unwrap();
    let mut offset = 0u64;
    for _ in 0..10 {
        a.write("/objects/big.bin", fh, &block, offset).await.unwrap();
        offset += block.len() as u64;
    }
    a.release("/objects/big.bin", fh).await.unwrap();

    let expected = block.repeat(10);
    let stat = store.stat("/objects/big.bin").await.unwrap();
    assert_eq!(stat.size, expected.len() as u64);
    assert_eq!(stat.content_hash.as_deref(), Some(hash_bytes(&expected).as_str()));
    assert_eq!(&store.read_file("/objects/big.bin").await.unwrap()[..], &expected[..]);
}

#[tokio::test]
async fn getattr_mid_write_reports_buffer_size() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let a = adapter(store.clone(), dir.path(), Duration::from_secs(1)).await;

    let fh = a.create("/objects/draft.md", 0o644).await.unwrap();
    a.write("/objects/draft.md", fh, b"# title\n", 0).await.unwrap();
    assert_eq!(a.getattr("/objects/draft.md").await.unwrap().size, 8);
    assert!(store.stat("/objects/draft.md").await.unwrap_err().is_not_found());

    a.write("/objects/draft.md", fh, b"body", 8).await.unwrap();
    assert_eq!(a.getattr("/objects/draft.md").await.unwrap().size, 12);
}

#[tokio::test]
async fn release_recovers_buffer_left_by_previous_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    {
        let first = adapter(store.clone(), dir.path(), Duration::from_secs(1)).await;
        let fh = first.create("/objects/carry.txt", 0o644).await.unwrap();
        first.write("/objects/carry.txt", fh, b"carried", 0).await.unwrap();
    }

    let second = adapter(store.clone(), dir.path(), Duration::from_secs(1)).await;
    assert_eq!(second.stats().buffered, 1);
    second.release("/objects/carry.txt", 4242).await.unwrap();

    assert_eq!(&store.read_file("/objects/carry.txt").await.unwrap()[..], b"carried");
    assert!(second.temps().lookup("carry.txt").is_none());
}

#[tokio::test]
async fn getattr_waits_for_commit_when_buffer_vanishes() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let a = Arc::new(adapter(store.clone(), dir.path(), Duration::from_secs(2)).await);

    let fh = a.create("/objects/late.txt", 0o644).await.unwrap();
    a.write("/objects/late.txt", fh, b"x", 0).await.unwrap();
    a.temps().discard("late.txt").await.unwrap();

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move { a.getattr("/objects/late.txt").await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    a.temps().create("/objects/late.txt").await.unwrap();
    a.temps().write("late.txt", 0, b"late!").await.unwrap();
    a.release("/objects/late.txt", 777).await.unwrap();

    let stat = waiter.await.unwrap().unwrap();
    assert_eq!(stat.size, 5);
}

#[tokio::test]
async fn getattr_gives_up_after_persist_wait() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let a = adapter(store, dir.path(), Duration::from_millis(100)).await;

    let fh = a.create("/objects/lost.txt", 0o644).await.unwrap();
    a.write("/objects/lost.txt", fh, b"x", 0).await.unwrap();
    a.temps().discard("lost.txt").await.unwrap();

    let started = Instant::now();
    let err = a.getattr("/objects/lost.txt").await.unwrap_err();
    assert!(matches!(err, FilerError::NotFound(_)));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn namespace_operations_reach_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let a = adapter(store.clone(), dir.path(), Duration::from_secs(1)).await;

    a.mkdir("/objects/sub", 0o755).await.unwrap();
    store.put_file("/objects/sub/f", &b"1"[..]).await.unwrap();
    a.rename("/objects/sub/f", "/objects/sub/g").await.unwrap();
    assert_eq!(a.readdir("/objects/sub").await.unwrap(), vec!["g".to_string()]);

    let err = a.rmdir("/objects/sub").await.unwrap_err();
    assert_eq!(filer_fuse::errno(&err), libc::ENOTEMPTY);
    a.unlink("/objects/sub/g").await.unwrap();
    a.rmdir("/objects/sub").await.unwrap();
    assert!(a.getattr("/objects/sub").await.unwrap_err().is_not_found());

    a.symlink("/objects", "/objects/link").await.unwrap();
    assert_eq!(&a.readlink("/objects/link").await.unwrap()[..], b"/objects");
}
