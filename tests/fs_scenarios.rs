//! End-to-end scenarios against the in-memory backend: the node operations
//! are driven exactly as the kernel glue drives them.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use objfs::config::Config;
use objfs::fs::object::SetattrRequest;
use objfs::fs::{EntryKind, FsError, Node, ObjFs};
use objfs::store::{
    Headers, LINK_CONTENT_TYPE, MANIFEST_HEADER, MTIME_HEADER, MemStore, NONCE_HEADER,
    ORIGIN_SIZE_HEADER, SYMLINK_HEADER,
};

const O_RDONLY: u32 = libc::O_RDONLY as u32;
const O_WRONLY: u32 = libc::O_WRONLY as u32;
const O_WRONLY_CREATE: u32 = (libc::O_WRONLY | libc::O_CREAT) as u32;

fn volume_with(config: Config) -> (ObjFs, Arc<MemStore>) {
    let store = Arc::new(MemStore::new(["data", "segments"]));
    let fs = ObjFs::new(store.clone(), config, "data", "segments");
    (fs, store)
}

fn volume() -> (ObjFs, Arc<MemStore>) {
    let mut config = Config::default();
    config.lister_concurrency = 4;
    volume_with(config)
}

fn small_segment_volume(segment_size: u64) -> (ObjFs, Arc<MemStore>) {
    let mut config = Config::default();
    config.lister_concurrency = 4;
    config.segment_size = segment_size;
    volume_with(config)
}

/// Drive a segmented "big" object into existence: three writes of 5+5+2
/// bytes against a 5-byte segment threshold.
async fn write_big(fs: &ObjFs) {
    let root = fs.root();
    let (_, mut handle, _) = root.create("big", O_WRONLY_CREATE).await.unwrap();
    handle.write(b"AAAAA").await.unwrap();
    handle.write(b"BBBBB").await.unwrap();
    handle.write(b"CC").await.unwrap();
    handle.release().await.unwrap();
}

async fn read_object(parent: &Arc<objfs::fs::Directory>, name: &str) -> Vec<u8> {
    let node = parent.lookup(name).await.unwrap();
    let Node::Object(object) = node else {
        panic!("{name} is not an object");
    };
    let (mut handle, _) = object.open(O_RDONLY).await.unwrap();
    handle.read(0, 1 << 16).await.unwrap()
}

#[tokio::test]
async fn mkdir_create_write_read() {
    let (fs, _) = volume();
    let root = fs.root();

    let dir = root.mkdir("dir").await.unwrap();
    let (_, mut handle, _) = dir.create("f", O_WRONLY_CREATE).await.unwrap();
    handle.write(b"hello world").await.unwrap();
    handle.release().await.unwrap();

    assert_eq!(read_object(&dir, "f").await, b"hello world");
}

#[tokio::test]
async fn small_write_stays_a_single_object() {
    let (fs, store) = volume();
    let root = fs.root();

    let (_, mut handle, _) = root.create("f", O_WRONLY_CREATE).await.unwrap();
    handle.write(b"hello").await.unwrap();
    handle.release().await.unwrap();

    assert_eq!(store.object_paths("data"), vec!["f".to_string()]);
    assert!(store.object_paths("segments").is_empty());
    assert!(!store.object_headers("data", "f").unwrap().contains_key(MANIFEST_HEADER));
}

#[tokio::test]
async fn segmented_write_builds_manifest_and_segments() {
    let (fs, store) = small_segment_volume(5);
    write_big(&fs).await;

    let headers = store.object_headers("data", "big").unwrap();
    let manifest = headers.get(MANIFEST_HEADER).expect("manifest header");
    let prefix = manifest.strip_prefix("segments/").expect("segments container");
    assert!(prefix.starts_with("big/"));

    let segments = store.object_paths("segments");
    assert_eq!(
        segments,
        vec![
            format!("{prefix}/00000000"),
            format!("{prefix}/00000001"),
            format!("{prefix}/00000002"),
        ]
    );
    assert_eq!(
        store.object_bytes("segments", &segments[0]).unwrap(),
        b"AAAAA"
    );
    assert_eq!(
        store.object_bytes("segments", &segments[1]).unwrap(),
        b"BBBBB"
    );
    assert_eq!(store.object_bytes("segments", &segments[2]).unwrap(), b"CC");

    let root = fs.root();
    assert_eq!(read_object(&root, "big").await, b"AAAAABBBBBCC");
}

#[tokio::test]
async fn rewrite_of_segmented_object_truncates_segments() {
    let (fs, store) = small_segment_volume(5);
    write_big(&fs).await;

    let root = fs.root();
    let Node::Object(object) = root.lookup("big").await.unwrap() else {
        panic!("big is not an object");
    };
    assert!(object.segmented());

    // Re-open without O_CREAT: the first write must tear the old body down.
    let (mut handle, _) = object.open(O_WRONLY).await.unwrap();
    handle.write(b"tiny").await.unwrap();
    handle.release().await.unwrap();

    assert!(!object.segmented());
    assert!(store.object_paths("segments").is_empty());
    assert_eq!(read_object(&root, "big").await, b"tiny");
}

#[tokio::test]
async fn truncate_to_zero_removes_segments() {
    let (fs, store) = small_segment_volume(5);
    write_big(&fs).await;

    let root = fs.root();
    let Node::Object(object) = root.lookup("big").await.unwrap() else {
        panic!("big is not an object");
    };
    object
        .setattr(SetattrRequest {
            size: Some(0),
            mtime: None,
        })
        .await
        .unwrap();

    assert!(!object.segmented());
    assert_eq!(object.bytes(), 0);
    assert!(store.object_paths("segments").is_empty());
}

#[tokio::test]
async fn pseudo_directory_synthesis() {
    let (fs, store) = volume();
    store.seed_object("data", "a/b.txt", b"hi", "text/plain", Headers::new());

    let root = fs.root();
    let entries = root.read_dir_all().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a");
    assert_eq!(entries[0].kind, EntryKind::Directory);

    let Node::Directory(a) = root.lookup("a").await.unwrap() else {
        panic!("a is not a directory");
    };
    let children = a.read_dir_all().await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "b.txt");
    assert_eq!(children[0].kind, EntryKind::File);
}

#[tokio::test]
async fn real_marker_suppresses_pseudo_directory() {
    let (fs, store) = volume();
    store.seed_object(
        "data",
        "a",
        b"",
        objfs::store::DIR_CONTENT_TYPE,
        Headers::new(),
    );
    store.seed_object("data", "a/b.txt", b"hi", "text/plain", Headers::new());

    let root = fs.root();
    let entries = root.read_dir_all().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a");
    assert_eq!(entries[0].kind, EntryKind::Directory);
}

#[tokio::test]
async fn segmented_rename_preserves_segments() {
    let (fs, store) = small_segment_volume(5);
    write_big(&fs).await;

    let root = fs.root();
    let other = root.mkdir("other").await.unwrap();
    root.rename("big", &Node::Directory(other.clone()), "big2")
        .await
        .unwrap();

    assert!(store.object_bytes("data", "big").is_none());
    let headers = store.object_headers("data", "other/big2").unwrap();
    assert!(headers.contains_key(MANIFEST_HEADER));
    assert_eq!(read_object(&other, "big2").await, b"AAAAABBBBBCC");

    assert!(matches!(
        root.lookup("big").await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test]
async fn plain_rename_round_trips() {
    let (fs, store) = volume();
    let root = fs.root();

    let (_, mut handle, _) = root.create("a", O_WRONLY_CREATE).await.unwrap();
    handle.write(b"payload").await.unwrap();
    handle.release().await.unwrap();

    let before_bytes = store.object_bytes("data", "a").unwrap();
    let before_headers = store.object_headers("data", "a").unwrap();

    let target = Node::Directory(root.clone());
    root.rename("a", &target, "b").await.unwrap();
    root.rename("b", &target, "a").await.unwrap();

    assert_eq!(store.object_bytes("data", "a").unwrap(), before_bytes);
    assert_eq!(store.object_headers("data", "a").unwrap(), before_headers);
    assert!(store.object_bytes("data", "b").is_none());

    let Node::Object(object) = root.lookup("a").await.unwrap() else {
        panic!("a is not an object");
    };
    assert_eq!(object.name(), "a");
    assert_eq!(object.path(), "a");
}

#[tokio::test]
async fn remove_segmented_object_leaves_no_residue() {
    let (fs, store) = small_segment_volume(5);
    write_big(&fs).await;

    let root = fs.root();
    root.remove("big").await.unwrap();

    assert!(store.object_paths("segments").is_empty());
    assert!(store.object_bytes("data", "big").is_none());
    assert!(matches!(
        root.lookup("big").await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test]
async fn remove_with_malformed_manifest_fails_and_keeps_segments() {
    let (fs, store) = volume();
    let mut headers = Headers::new();
    headers.insert(MANIFEST_HEADER.to_string(), "noslash".to_string());
    store.seed_object("data", "bad", b"", "", headers);
    store.seed_object("segments", "noslash/0", b"x", "", Headers::new());

    let root = fs.root();
    root.read_dir_all().await.unwrap();

    let err = root.remove("bad").await.unwrap_err();
    assert!(matches!(err, FsError::InvalidManifest(_)));
    assert!(store.object_bytes("data", "bad").is_some());
    assert_eq!(store.object_paths("segments").len(), 1);
}

#[tokio::test]
async fn remove_directory_swallows_marker_delete_failure() {
    let (fs, store) = volume();
    store.seed_object(
        "data",
        "a",
        b"",
        objfs::store::DIR_CONTENT_TYPE,
        Headers::new(),
    );
    store.seed_object("data", "a/b.txt", b"hi", "text/plain", Headers::new());
    store.inject_delete_error("data", "a");

    let root = fs.root();
    root.read_dir_all().await.unwrap();

    // The marker delete hits a backend error, not a miss; removal still
    // succeeds and only the cache forgets the directory.
    root.remove("a").await.unwrap();
    assert!(matches!(root.lookup("a").await, Err(FsError::NotFound)));
    assert!(store.object_bytes("data", "a").is_some());
}

#[tokio::test]
async fn remove_directory_tolerates_missing_marker() {
    let (fs, store) = volume();
    store.seed_object("data", "a/b.txt", b"hi", "text/plain", Headers::new());

    let root = fs.root();
    root.read_dir_all().await.unwrap();
    // "a" is purely synthetic: no marker object exists to delete.
    root.remove("a").await.unwrap();
    assert!(matches!(root.lookup("a").await, Err(FsError::NotFound)));
}

#[tokio::test]
async fn symlink_create_and_lookup() {
    let (fs, store) = volume();
    let root = fs.root();

    root.symlink("link", "target").await.unwrap();

    let Node::Symlink(link) = root.lookup("link").await.unwrap() else {
        panic!("link is not a symlink");
    };
    assert_eq!(link.target().as_deref(), Some("target"));
    assert_eq!(
        store.object_headers("data", "link").unwrap()[SYMLINK_HEADER],
        "target"
    );
    assert_eq!(store.object_bytes("data", "link").unwrap(), b"");
}

#[tokio::test]
async fn listing_enriches_symlinks_from_headers() {
    let (fs, store) = volume();
    let mut headers = Headers::new();
    headers.insert(SYMLINK_HEADER.to_string(), "elsewhere".to_string());
    store.seed_object("data", "ln", b"", LINK_CONTENT_TYPE, headers);

    let root = fs.root();
    let entries = root.read_dir_all().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Symlink);

    let Node::Symlink(link) = root.lookup("ln").await.unwrap() else {
        panic!("ln is not a symlink");
    };
    assert_eq!(link.target().as_deref(), Some("elsewhere"));
}

#[tokio::test]
async fn listing_enriches_manifest_candidates() {
    let (fs, store) = volume();
    store.seed_object("segments", "big/1/00000000", b"DATA", "", Headers::new());
    let mut headers = Headers::new();
    headers.insert(MANIFEST_HEADER.to_string(), "segments/big/1".to_string());
    store.seed_object("data", "big", b"", "", headers);

    let root = fs.root();
    root.read_dir_all().await.unwrap();
    let Node::Object(object) = root.lookup("big").await.unwrap() else {
        panic!("big is not an object");
    };
    assert!(object.segmented());
    assert_eq!(object.bytes(), 4);
}

#[tokio::test]
async fn readdir_children_match_cache_entry() {
    let (fs, store) = volume();
    store.seed_object("data", "x.txt", b"1", "text/plain", Headers::new());
    store.seed_object("data", "y.txt", b"2", "text/plain", Headers::new());
    store.seed_object("data", "sub/z.txt", b"3", "text/plain", Headers::new());

    let root = fs.root();
    let mut emitted: Vec<String> = root
        .read_dir_all()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    emitted.sort();

    let core = fs.core();
    let (_, nodes) = core.cache.get_all("data", "").unwrap();
    let mut cached: Vec<String> = nodes.iter().map(Node::name).collect();
    cached.sort();

    assert_eq!(emitted, cached);
}

#[tokio::test]
async fn lookup_after_mkdir_issues_no_listing() {
    let (fs, store) = volume();
    let root = fs.root();

    root.mkdir("dir").await.unwrap();
    let node = root.lookup("dir").await.unwrap();
    assert!(matches!(node, Node::Directory(_)));
    assert_eq!(store.list_calls(), 0);
}

#[tokio::test]
async fn second_writer_blocks_until_release() {
    let (fs, _) = volume();
    let root = fs.root();

    let (object, handle, _) = root.create("f", O_WRONLY_CREATE).await.unwrap();

    let contender = object.clone();
    let second = tokio::spawn(async move {
        let (handle, _) = contender.open(O_WRONLY).await?;
        handle.release().await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished(), "second open should wait on the lock");

    handle.release().await.unwrap();
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn append_and_read_write_opens_are_rejected() {
    let (fs, _) = volume();
    let root = fs.root();
    let (object, handle, _) = root.create("f", O_WRONLY_CREATE).await.unwrap();
    handle.release().await.unwrap();

    let err = object
        .open((libc::O_WRONLY | libc::O_APPEND) as u32)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::NotSupported));

    let err = object.open(libc::O_RDWR as u32).await.unwrap_err();
    assert!(matches!(err, FsError::NotSupported));
}

#[tokio::test]
async fn setattr_mtime_writes_header_when_extra_attr_is_on() {
    let mut config = Config::default();
    config.lister_concurrency = 4;
    config.extra_attr = true;
    let (fs, store) = volume_with(config);
    let root = fs.root();

    let (object, handle, _) = root.create("f", O_WRONLY_CREATE).await.unwrap();
    handle.release().await.unwrap();

    let stamp = UNIX_EPOCH + Duration::from_secs(1_500_000_000);
    object
        .setattr(SetattrRequest {
            size: None,
            mtime: Some(stamp),
        })
        .await
        .unwrap();

    let headers = store.object_headers("data", "f").unwrap();
    assert_eq!(headers[MTIME_HEADER], "1500000000");
    assert_eq!(object.attr().mtime, stamp);
}

#[tokio::test]
async fn setattr_mtime_rejected_without_extra_attr() {
    let (fs, _) = volume();
    let root = fs.root();
    let (object, handle, _) = root.create("f", O_WRONLY_CREATE).await.unwrap();
    handle.release().await.unwrap();

    let err = object
        .setattr(SetattrRequest {
            size: None,
            mtime: Some(SystemTime::now()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::NotSupported));
}

#[tokio::test]
async fn release_writes_crypto_headers_when_encryption_is_on() {
    let mut config = Config::default();
    config.lister_concurrency = 4;
    config.encryption = true;
    let (fs, store) = volume_with(config);
    let root = fs.root();

    let (object, mut handle, _) = root.create("f", O_WRONLY_CREATE).await.unwrap();
    handle.write(b"hello world").await.unwrap();
    handle.release().await.unwrap();

    let headers = store.object_headers("data", "f").unwrap();
    assert!(!headers[NONCE_HEADER].is_empty());
    assert_eq!(headers[ORIGIN_SIZE_HEADER], "11");
    assert_eq!(object.attr().size, 11);
}

#[tokio::test]
async fn readdir_substitutes_in_flight_writes() {
    let (fs, store) = volume();
    let root = fs.root();

    let (object, mut handle, _) = root.create("f", O_WRONLY_CREATE).await.unwrap();
    handle.write(b"fresh bytes").await.unwrap();

    // A concurrent listing sees the store's stale zero-byte object but must
    // keep the live node.
    store.seed_object("data", "f", b"", "", Headers::new());
    fs.core().cache.delete_all("data", "");
    root.read_dir_all().await.unwrap();

    let Node::Object(listed) = root.lookup("f").await.unwrap() else {
        panic!("f is not an object");
    };
    assert!(Arc::ptr_eq(&listed, &object));
    assert!(listed.writing());

    handle.release().await.unwrap();
    assert!(!object.writing());
}
