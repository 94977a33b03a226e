//! End-to-end version control tests over both backends

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use revstore_core::{
    delta, digest, CommitInfo, PutMode, Repository, ResourceFilter, SqliteVersionStore,
    StoreConfig, StoreContentOptions, VcsError, VersionManager,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn repositories() -> Vec<(&'static str, Repository)> {
    let config = StoreConfig::default();
    let sqlite = SqliteVersionStore::open_in_memory(&config).unwrap();
    vec![
        ("memory", Repository::in_memory(config.clone())),
        ("sqlite", Repository::with_store(Arc::new(sqlite), config, None)),
    ]
}

fn one(path: &str, content: &str) -> BTreeMap<String, Bytes> {
    BTreeMap::from([(path.to_string(), Bytes::copy_from_slice(content.as_bytes()))])
}

fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf[..]);
    buf
}

async fn content_of(versions: &VersionManager, version: revstore_core::VersionId, path: &str) -> String {
    String::from_utf8(versions.load_resource(version, path).await.unwrap().to_vec()).unwrap()
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let root = versions.create_root().await.unwrap().id;

        versions
            .put_resources(root, one("a/b.txt", "hello"), PutMode::Merge)
            .await
            .unwrap();
        let listed = versions.list_resources(root, &ResourceFilter::all()).await.unwrap();
        assert_eq!(listed.len(), 1, "{}", name);
        assert_eq!(listed[0].path, "a/b.txt", "{}", name);
        assert_eq!(
            repo.revisions().reconstruct(&listed[0].revision).await.unwrap(),
            Bytes::from_static(b"hello"),
            "{}",
            name
        );

        let updated = versions
            .put_resources(root, one("a/b.txt", "hello world"), PutMode::Merge)
            .await
            .unwrap();
        let revision = updated["a/b.txt"];
        assert_eq!(revision.hash, digest(b"hello world"), "{}", name);
        assert_eq!(
            repo.revisions().reconstruct(&revision).await.unwrap(),
            Bytes::from_static(b"hello world"),
            "{}",
            name
        );

        let child = versions.create_child(root).await.unwrap().id;
        versions
            .put_resources(child, one("a/b.txt", "hello earth"), PutMode::Merge)
            .await
            .unwrap();

        assert_eq!(content_of(versions, root, "a/b.txt").await, "hello world", "{}", name);
        assert_eq!(content_of(versions, child, "a/b.txt").await, "hello earth", "{}", name);
        assert_eq!(versions.parents(child).await.unwrap(), vec![root], "{}", name);
        assert_eq!(versions.children(root).await.unwrap(), vec![child], "{}", name);
    }
}

#[tokio::test]
async fn test_changeset_isolation() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let root = versions.create_root().await.unwrap().id;
        let mut resources = one("docs/a.txt", "alpha");
        resources.insert("docs/b.txt".to_string(), Bytes::from_static(b"beta"));
        versions.put_resources(root, resources, PutMode::Merge).await.unwrap();
        let before = versions.list_resources(root, &ResourceFilter::all()).await.unwrap();

        let child = versions.create_child(root).await.unwrap().id;
        versions
            .put_resources(child, one("docs/a.txt", "changed"), PutMode::Merge)
            .await
            .unwrap();
        versions
            .remove_resources(child, &["docs/b.txt".to_string()])
            .await
            .unwrap();
        versions
            .put_resources(child, one("docs/c.txt", "gamma"), PutMode::Merge)
            .await
            .unwrap();

        let after = versions.list_resources(root, &ResourceFilter::all()).await.unwrap();
        assert_eq!(before, after, "{}", name);

        let child_paths: Vec<String> = versions
            .list_resources(child, &ResourceFilter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(child_paths, vec!["docs/a.txt", "docs/c.txt"], "{}", name);
    }
}

#[tokio::test]
async fn test_commit_freeze() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let root = versions.create_root().await.unwrap().id;
        versions
            .put_resources(root, one("file", "frozen"), PutMode::Merge)
            .await
            .unwrap();
        let sealed = versions
            .commit(
                root,
                CommitInfo {
                    message: Some("initial".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(sealed.is_committed(), "{}", name);
        assert!(versions.is_committed(root).await.unwrap(), "{}", name);

        let put = versions
            .put_resources(root, one("file", "thawed"), PutMode::Merge)
            .await;
        assert!(matches!(put, Err(VcsError::AlreadyCommitted(_))), "{}", name);
        let removed = versions.remove_resources(root, &["file".to_string()]).await;
        assert!(matches!(removed, Err(VcsError::AlreadyCommitted(_))), "{}", name);
        let parents = versions.set_parents(root, &[]).await;
        assert!(matches!(parents, Err(VcsError::AlreadyCommitted(_))), "{}", name);

        assert_eq!(content_of(versions, root, "file").await, "frozen", "{}", name);

        // A child of a committed version is open again.
        let child = versions.create_child(root).await.unwrap().id;
        versions
            .put_resources(child, one("file", "thawed"), PutMode::Merge)
            .await
            .unwrap();
        let manifest = versions.load_commit_info(root).await.unwrap().unwrap();
        assert_eq!(manifest.entries["file"], digest(b"frozen"), "{}", name);
    }
}

#[tokio::test]
async fn test_seal_depends_on_content() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let info = CommitInfo {
            stamp: Some(42),
            ..Default::default()
        };

        let a = versions.create_root().await.unwrap().id;
        versions.put_resources(a, one("f", "one"), PutMode::Merge).await.unwrap();
        let b = versions.create_root().await.unwrap().id;
        versions.put_resources(b, one("f", "two"), PutMode::Merge).await.unwrap();

        let sealed_a = versions.commit(a, info.clone()).await.unwrap();
        let sealed_b = versions.commit(b, info).await.unwrap();
        assert!(sealed_a.seal.is_some(), "{}", name);
        assert_ne!(sealed_a.seal, sealed_b.seal, "{}", name);
    }
}

#[tokio::test]
async fn test_find_version_by_seal() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let root = versions.create_root().await.unwrap().id;
        versions
            .put_resources(root, one("a.txt", "sealed"), PutMode::Merge)
            .await
            .unwrap();
        let committed = versions.commit(root, CommitInfo::default()).await.unwrap();
        let seal = committed.seal.unwrap();
        let open = versions.create_child(root).await.unwrap();

        let found = versions.find_by_seal(&seal).await.unwrap();
        assert_eq!(found.map(|v| v.id), Some(root), "{}", name);
        assert_ne!(found.map(|v| v.id), Some(open.id), "{}", name);

        // Content hashes that are not seals resolve to nothing.
        let content_hash = digest(b"sealed");
        assert!(versions.find_by_seal(&content_hash).await.unwrap().is_none(), "{}", name);
        assert!(versions.find_by_seal(&digest(b"unknown")).await.unwrap().is_none(), "{}", name);
    }
}

#[tokio::test]
async fn test_prefix_listing() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let root = versions.create_root().await.unwrap().id;
        let resources: BTreeMap<String, Bytes> = [
            "foo/about.md",
            "foo/bar/file.doc",
            "foo/bar/deeper/x",
            "foobar",
            "zeta",
        ]
        .iter()
        .map(|p| (p.to_string(), Bytes::copy_from_slice(p.as_bytes())))
        .collect();
        versions.put_resources(root, resources, PutMode::Merge).await.unwrap();

        let paths = |entries: Vec<revstore_core::ResourceEntry>| -> Vec<String> {
            entries.into_iter().map(|e| e.path).collect()
        };

        let deep = versions
            .list_resources(root, &ResourceFilter::prefix("foo/"))
            .await
            .unwrap();
        assert_eq!(
            paths(deep),
            vec!["foo/about.md", "foo/bar/deeper/x", "foo/bar/file.doc"],
            "{}",
            name
        );

        let shallow = versions
            .list_resources(root, &ResourceFilter::prefix("foo/").shallow())
            .await
            .unwrap();
        assert_eq!(paths(shallow), vec!["foo/about.md"], "{}", name);

        let nested = versions
            .list_resources(root, &ResourceFilter::prefix("foo/bar/").shallow())
            .await
            .unwrap();
        assert_eq!(paths(nested), vec!["foo/bar/file.doc"], "{}", name);

        let explicit = versions
            .list_resources(root, &ResourceFilter::paths(["zeta", "missing", "foobar"]))
            .await
            .unwrap();
        assert_eq!(paths(explicit), vec!["foobar", "zeta"], "{}", name);
    }
}

#[tokio::test]
async fn test_identical_content_shares_revision() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let root = versions.create_root().await.unwrap().id;
        let mut resources = one("x", "same bytes");
        resources.insert("y".to_string(), Bytes::from_static(b"same bytes"));
        let stored = versions.put_resources(root, resources, PutMode::Merge).await.unwrap();
        assert_eq!(stored["x"].id, stored["y"].id, "{}", name);
    }
}

#[tokio::test]
async fn test_diff_acceptance_boundary() {
    for (name, repo) in repositories() {
        let revisions = repo.revisions();
        let mut rng = StdRng::seed_from_u64(1234);
        let base = random_bytes(&mut rng, 3000);
        let root = revisions
            .store_content(Bytes::from(base.clone()), StoreContentOptions::default())
            .await
            .unwrap();

        let (mut saw_diff, mut saw_full) = (false, false);
        for tail_len in (950..1050).step_by(5) {
            let keep = base.len() - tail_len;
            let mut target = base[..keep].to_vec();
            target.extend_from_slice(&random_bytes(&mut rng, tail_len));
            let script = delta::diff(&base, &target);
            let expect_diff = script.len() * 3 < base.len();

            let revision = revisions
                .store_content(Bytes::from(target.clone()), StoreContentOptions::with_base(Some(root.id)))
                .await
                .unwrap();
            assert_eq!(revision.is_diff(), expect_diff, "{}: tail {}", name, tail_len);
            assert_eq!(revisions.reconstruct(&revision).await.unwrap(), Bytes::from(target));
            saw_diff |= expect_diff;
            saw_full |= !expect_diff;
        }
        assert!(saw_diff && saw_full, "{}: both sides of the boundary were exercised", name);
    }
}

#[tokio::test]
async fn test_large_inputs_round_trip() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let mut rng = StdRng::seed_from_u64(99);
        let root = versions.create_root().await.unwrap().id;

        let random = random_bytes(&mut rng, 1_200_000);
        let zeros = vec![0u8; 1_200_000];
        let resources = BTreeMap::from([
            ("random.bin".to_string(), Bytes::from(random.clone())),
            ("zeros.bin".to_string(), Bytes::from(zeros.clone())),
        ]);
        versions.put_resources(root, resources, PutMode::Merge).await.unwrap();

        let mut edited = zeros.clone();
        edited[600_000] = 1;
        let stored = versions
            .put_resources(root, BTreeMap::from([("zeros.bin".to_string(), Bytes::from(edited.clone()))]), PutMode::Merge)
            .await
            .unwrap();
        assert!(stored["zeros.bin"].is_diff(), "{}", name);

        assert_eq!(versions.load_resource(root, "random.bin").await.unwrap(), Bytes::from(random), "{}", name);
        assert_eq!(versions.load_resource(root, "zeros.bin").await.unwrap(), Bytes::from(edited), "{}", name);
    }
}

#[tokio::test]
async fn test_sqlite_persistence_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let repo_path = temp_dir.path();

    let (root, child) = {
        let repo = Repository::init(repo_path).unwrap();
        let versions = repo.versions();
        let root = versions.create_root().await.unwrap().id;
        versions
            .put_resources(root, one("a/b.txt", "hello world"), PutMode::Merge)
            .await
            .unwrap();
        versions.commit(root, CommitInfo::default()).await.unwrap();
        let child = versions.create_child(root).await.unwrap().id;
        versions
            .put_resources(child, one("a/b.txt", "hello earth"), PutMode::Merge)
            .await
            .unwrap();
        (root, child)
    };

    let repo = Repository::open(repo_path).unwrap();
    let versions = repo.versions();
    assert!(versions.is_committed(root).await.unwrap());
    assert!(!versions.is_committed(child).await.unwrap());
    assert_eq!(content_of(versions, root, "a/b.txt").await, "hello world");
    assert_eq!(content_of(versions, child, "a/b.txt").await, "hello earth");
    assert_eq!(versions.parents(child).await.unwrap(), vec![root]);
}

#[tokio::test]
async fn test_corrupted_diff_blob_is_detected() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repository::init(temp_dir.path()).unwrap();
    let revisions = repo.revisions();

    let mut rng = StdRng::seed_from_u64(5);
    let base = random_bytes(&mut rng, 3000);
    let root = revisions
        .store_content(Bytes::from(base.clone()), StoreContentOptions::default())
        .await
        .unwrap();
    let mut next = base;
    next.extend_from_slice(&random_bytes(&mut rng, 30));
    let revision = revisions
        .store_content(Bytes::from(next), StoreContentOptions::with_base(Some(root.id)))
        .await
        .unwrap();
    let diff_id = revision.diff_blob_id.expect("small append is stored as a diff");

    let db_path = temp_dir.path().join(&repo.config().database_file);
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    let original: Vec<u8> = conn
        .query_row(
            "SELECT content FROM vc_blob WHERE blobId = ?1",
            [diff_id.get()],
            |r| r.get(0),
        )
        .unwrap();

    // Length header, a byte in the middle of the script and the final literal byte.
    for position in [0, original.len() / 2, original.len() - 1] {
        let mut script = original.clone();
        script[position] ^= 0x01;
        conn.execute(
            "UPDATE vc_blob SET content = ?1 WHERE blobId = ?2",
            rusqlite::params![script, diff_id.get()],
        )
        .unwrap();

        let result = revisions.reconstruct(&revision).await;
        assert!(
            matches!(result, Err(VcsError::Integrity { .. })),
            "byte {}: {:?}",
            position,
            result
        );
    }
    drop(conn);

    assert_eq!(revisions.load_content(root.id).await.unwrap().len(), 3000);
}

#[tokio::test]
async fn test_failed_composite_leaves_no_partial_state() {
    for (name, repo) in repositories() {
        let versions = repo.versions();
        let root = versions.create_root().await.unwrap().id;
        let sealed = versions.create_root().await.unwrap().id;
        versions.commit(sealed, CommitInfo::default()).await.unwrap();

        // The child is created inside the same transaction as the failing put.
        let store = repo.store().clone();
        let result: revstore_core::Result<()> = revstore_core::with_transaction(
            store.as_ref(),
            revstore_core::TxMode::Write,
            || async {
                let child = versions.create_child(root).await?;
                versions
                    .put_resources(child.id, one("new", "content"), PutMode::Merge)
                    .await?;
                versions
                    .put_resources(sealed, one("other", "content"), PutMode::Merge)
                    .await?;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(VcsError::AlreadyCommitted(_))), "{}", name);

        assert!(versions.children(root).await.unwrap().is_empty(), "{}", name);
        assert!(
            repo.revisions().find_by_hash(&digest(b"content")).await.unwrap().is_none(),
            "{}",
            name
        );
    }
}
