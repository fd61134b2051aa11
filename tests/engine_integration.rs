use std::collections::HashSet;

use bytes::Bytes;
use chunksync::delta::{self, Chunk, ChunkHash, DeltaError, Operation};
use chunksync::hash::chunk_digest;
use chunksync::manifest::{DiffKind, FileEntry, FileMetadata};
use chunksync::store::OpAddress;
use chunksync::{ChunkerConfig, EngineOptions, PathHash, Scope, SyncEngine, SyncError};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::{TempDir, tempdir};

fn engine_at(dir: &TempDir) -> SyncEngine {
    SyncEngine::open(EngineOptions {
        root: dir.path().to_path_buf(),
        chunker: ChunkerConfig::with_average(256).unwrap(),
        workers: 4,
        ..EngineOptions::default()
    })
    .unwrap()
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

fn path(name: &str) -> PathHash {
    PathHash::from_path(name)
}

/// Project "demo" with commit 0 holding `files`.
fn seeded_project(engine: &SyncEngine, files: &[(&str, Vec<u8>)]) -> u64 {
    let project = engine.create_project("demo").unwrap();
    let seed = engine.create_container(project, "seed").unwrap();
    assert_eq!(engine.base_commit(project, seed).unwrap(), None);
    for (name, content) in files {
        engine.write_file(project, seed, 0, path(name), content).unwrap();
    }
    assert_eq!(engine.merge(project, seed).unwrap(), Some(0));
    project
}

#[test]
fn scenario_a_push_into_new_container() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = seeded_project(&engine, &[("README", b"seed".to_vec())]);

    let ws = engine.create_container(project, "ws").unwrap();
    assert_eq!(engine.base_commit(project, ws).unwrap(), Some(0));
    engine.write_file(project, ws, 0, path("a.txt"), b"hello").unwrap();

    let scope = Scope::Container(project, ws);
    assert_eq!(engine.regenerate_version(scope, 0, path("a.txt")).unwrap(), b"hello");
    assert_eq!(engine.current_change(project, ws).unwrap(), Some(0));
}

#[test]
fn scenario_b_each_change_stays_readable() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = seeded_project(&engine, &[("README", b"seed".to_vec())]);
    let ws = engine.create_container(project, "ws").unwrap();

    engine.write_file(project, ws, 0, path("a.txt"), b"hello").unwrap();
    engine.write_file(project, ws, 1, path("a.txt"), b"hello world").unwrap();

    let scope = Scope::Container(project, ws);
    assert_eq!(engine.regenerate_version(scope, 0, path("a.txt")).unwrap(), b"hello");
    assert_eq!(engine.regenerate_version(scope, 1, path("a.txt")).unwrap(), b"hello world");
    assert_eq!(engine.next_change(project, ws).unwrap(), 2);
}

#[test]
fn scenario_c_merge_publishes_commit_and_drops_container() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = seeded_project(&engine, &[("README", b"seed".to_vec())]);
    let ws = engine.create_container(project, "ws").unwrap();
    engine.write_file(project, ws, 0, path("a.txt"), b"hello").unwrap();
    engine.write_file(project, ws, 1, path("a.txt"), b"hello world").unwrap();

    let stats = engine.merge_with_stats(project, ws).unwrap();
    assert_eq!(stats.commit, Some(1));
    assert_eq!(stats.paths, 1);
    assert_eq!(engine.current_commit(project).unwrap(), Some(1));

    let commits = Scope::Commit(project);
    assert_eq!(engine.regenerate_version(commits, 1, path("a.txt")).unwrap(), b"hello world");
    assert_eq!(engine.regenerate_version(commits, 1, path("README")).unwrap(), b"seed");
    assert!(engine.regenerate_version(commits, 0, path("a.txt")).unwrap().is_empty());

    assert!(matches!(
        engine.container_id(project, "ws"),
        Err(SyncError::Catalog(_))
    ));
    let container_scope = Scope::Container(project, ws);
    assert!(engine.location_index().touched_paths(container_scope, u64::MAX).unwrap().is_empty());
    assert!(engine.data_store().changed_paths(container_scope).unwrap().is_empty());
}

#[test]
fn scenario_d_untouched_path_reads_base_commit() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let base = random_bytes(10_000, 7);
    let project = seeded_project(&engine, &[("b.bin", base.clone())]);
    let ws = engine.create_container(project, "ws").unwrap();

    let scope = Scope::Container(project, ws);
    assert_eq!(engine.regenerate_version(scope, 0, path("b.bin")).unwrap(), base);

    engine.write_file(project, ws, 0, path("a.txt"), b"other file").unwrap();
    engine.write_file(project, ws, 1, path("a.txt"), b"other file, again").unwrap();
    for version in [0, 1, 9] {
        assert_eq!(engine.regenerate_version(scope, version, path("b.bin")).unwrap(), base);
    }
}

#[test]
fn first_merge_into_empty_project_is_commit_zero() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = engine.create_project("fresh").unwrap();
    assert_eq!(engine.current_commit(project).unwrap(), None);

    let ws = engine.create_container(project, "ws").unwrap();
    assert_eq!(engine.merge(project, ws).unwrap(), None, "nothing to merge yet");

    engine.write_file(project, ws, 0, path("x"), b"x").unwrap();
    assert_eq!(engine.merge(project, ws).unwrap(), Some(0));
}

#[test]
fn merge_shares_unchanged_bytes_with_prior_commit() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let stable = random_bytes(40_000, 1);
    let edited = random_bytes(40_000, 2);
    let project = seeded_project(&engine, &[("stable.bin", stable.clone()), ("edited.bin", edited.clone())]);

    let commits = Scope::Commit(project);
    let layout = engine.data_store().layout();
    let stable_log = layout.data_log(commits, path("stable.bin"));
    let edited_log = layout.data_log(commits, path("edited.bin"));
    let stable_log_len = std::fs::metadata(&stable_log).unwrap().len();
    let edited_log_len = std::fs::metadata(&edited_log).unwrap().len();

    let ws = engine.create_container(project, "ws").unwrap();
    // Flipping the final byte keeps every chunk boundary in place.
    let mut changed = edited.clone();
    let last = changed.len() - 1;
    changed[last] ^= 0xff;
    engine.write_file(project, ws, 0, path("edited.bin"), &changed).unwrap();

    let stats = engine.merge_with_stats(project, ws).unwrap();
    assert_eq!(stats.commit, Some(1));
    assert_eq!(stats.paths, 1);
    assert!(stats.reused_blocks > 0);

    // The untouched file gained neither a record nor a byte.
    let index = engine.location_index();
    assert_eq!(index.get(commits, 1, path("stable.bin")).unwrap(), None);
    assert_eq!(std::fs::metadata(&stable_log).unwrap().len(), stable_log_len);

    // The edited file reuses every reference of commit 0 except the last chunk.
    let before: HashSet<OpAddress> = index
        .get(commits, 0, path("edited.bin"))
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|l| l.address)
        .collect();
    let after = index.get(commits, 1, path("edited.bin")).unwrap().unwrap();
    let fresh: Vec<_> = after.iter().filter(|l| !before.contains(&l.address)).collect();
    assert_eq!(fresh.len(), 1);
    assert_eq!(stats.written_ops, 1);
    assert_eq!(stats.reused_blocks as usize, after.len() - 1);
    let grown = std::fs::metadata(&edited_log).unwrap().len() - edited_log_len;
    assert_eq!(grown, stats.written_bytes);
    assert!(grown < edited.len() as u64 / 4);

    assert_eq!(engine.regenerate_version(commits, 1, path("edited.bin")).unwrap(), changed);
    assert_eq!(engine.regenerate_version(commits, 0, path("edited.bin")).unwrap(), edited);
    assert_eq!(engine.regenerate_version(commits, 1, path("stable.bin")).unwrap(), stable);
}

#[test]
fn push_reuses_base_commit_chunks_without_copying() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let base = random_bytes(30_000, 3);
    let project = seeded_project(&engine, &[("f.bin", base.clone())]);
    let ws = engine.create_container(project, "ws").unwrap();

    let mut appended = base.clone();
    appended.extend_from_slice(&random_bytes(500, 4));
    let stats = engine.write_file(project, ws, 0, path("f.bin"), &appended).unwrap();
    assert!(stats.blocks > 0);
    assert!(stats.data_bytes < 500 + 4 * 256 * 4);

    let locs = engine
        .location_index()
        .get(Scope::Container(project, ws), 0, path("f.bin"))
        .unwrap()
        .unwrap();
    assert!(locs.iter().any(|l| matches!(l.address, OpAddress::Commit { .. })));
    assert!(locs.iter().any(|l| matches!(l.address, OpAddress::Container { .. })));
    assert_eq!(
        engine.regenerate_version(Scope::Container(project, ws), 0, path("f.bin")).unwrap(),
        appended
    );
}

#[test]
fn unknown_block_is_corruption_and_records_nothing() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = seeded_project(&engine, &[("f.bin", random_bytes(2_000, 5))]);
    let ws = engine.create_container(project, "ws").unwrap();

    let bogus = ChunkHash {
        offset: 0,
        length: 100,
        hash: 0xdead_beef,
    };
    let result = engine.write_operations(
        project,
        ws,
        0,
        path("f.bin"),
        vec![Ok::<_, SyncError>(Operation::Block(bogus))],
    );
    match result {
        Err(SyncError::Corruption { path: p, hash, .. }) => {
            assert_eq!(p, path("f.bin"));
            assert_eq!(hash, 0xdead_beef);
        }
        other => panic!("expected corruption, got {other:?}"),
    }
    assert_eq!(engine.current_change(project, ws).unwrap(), None);
}

#[test]
fn failing_batch_publishes_no_record() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = engine.create_project("demo").unwrap();
    let ws = engine.create_container(project, "ws").unwrap();

    let good = delta::diff_all(engine.chunker(), b"fine", &[]).unwrap();
    let bad = vec![Operation::Block(ChunkHash {
        offset: 0,
        length: 4,
        hash: 1,
    })];
    let result = engine.push_batch(project, ws, 0, vec![(path("good"), good), (path("bad"), bad)]);
    assert!(matches!(result, Err(SyncError::Corruption { .. })));
    let scope = Scope::Container(project, ws);
    assert!(engine.location_index().touched_paths(scope, u64::MAX).unwrap().is_empty());
    assert_eq!(engine.current_change(project, ws).unwrap(), None);
}

#[test]
fn data_operation_must_describe_its_payload() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = engine.create_project("demo").unwrap();
    let ws = engine.create_container(project, "ws").unwrap();
    let seed = engine.chunker().config().seed();
    let hello = Bytes::from_static(b"hello");

    let wrong_length = Operation::Data(Chunk {
        offset: 0,
        length: 99,
        hash: chunk_digest(&hello, seed),
        data: hello.clone(),
    });
    let wrong_hash = Operation::data(0, 7, hello.clone());
    for op in [wrong_length, wrong_hash] {
        let result = engine.write_operations(project, ws, 0, path("f"), vec![Ok::<_, SyncError>(op)]);
        assert!(
            matches!(result, Err(SyncError::InvalidOperation { .. })),
            "accepted a mismatched payload: {result:?}"
        );
    }
    assert_eq!(engine.current_change(project, ws).unwrap(), None);

    // The client's offset is not trusted: the record places the chunk where it lands.
    let misplaced = Operation::data(500, chunk_digest(&hello, seed), hello.clone());
    engine
        .write_operations(project, ws, 0, path("f"), vec![Ok::<_, SyncError>(misplaced)])
        .unwrap();
    let scope = Scope::Container(project, ws);
    let record = engine.location_index().get(scope, 0, path("f")).unwrap().unwrap();
    assert_eq!(record[0].chunk_hash.offset, 0);
    assert_eq!(engine.regenerate_version(scope, 0, path("f")).unwrap(), b"hello");

    // A later push can still refer to that chunk by its real position.
    let signature = engine.container_signature(project, ws, 0, path("f")).unwrap();
    let reuse = vec![Ok::<_, SyncError>(Operation::Block(signature[0]))];
    let stats = engine.write_operations(project, ws, 1, path("f"), reuse).unwrap();
    assert_eq!(stats.blocks, 1);
    assert_eq!(engine.regenerate_version(scope, 1, path("f")).unwrap(), b"hello");
}

#[test]
fn records_above_the_head_stay_invisible() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = seeded_project(&engine, &[("a", b"a0".to_vec()), ("b", b"b0".to_vec())]);
    let commits = Scope::Commit(project);
    let index = engine.location_index();

    // Leftovers of a publish that never completed: a tombstone for "a" at
    // commit 1 and at change 1 of a container whose head is change 0.
    index.insert(commits, 1, path("a"), &[]).unwrap();
    assert_eq!(engine.current_commit(project).unwrap(), Some(0));
    assert_eq!(engine.regenerate_version(commits, 1, path("a")).unwrap(), b"a0");

    let ws = engine.create_container(project, "ws").unwrap();
    assert_eq!(engine.base_commit(project, ws).unwrap(), Some(0));
    engine.write_file(project, ws, 0, path("b"), b"b1").unwrap();
    let scope = Scope::Container(project, ws);
    index.insert(scope, 1, path("a"), &[]).unwrap();
    assert_eq!(engine.regenerate_version(scope, 1, path("a")).unwrap(), b"a0");
    assert_eq!(engine.next_change(project, ws).unwrap(), 1);

    // Merging publishes commit 1 over the leftovers: "a" keeps its content.
    let stats = engine.merge_with_stats(project, ws).unwrap();
    assert_eq!(stats.commit, Some(1));
    assert_eq!(stats.paths, 1);
    assert_eq!(index.get(commits, 1, path("a")).unwrap(), None);
    assert_eq!(engine.regenerate_version(commits, 1, path("a")).unwrap(), b"a0");
    assert_eq!(engine.regenerate_version(commits, 1, path("b")).unwrap(), b"b1");
}

#[test]
fn multi_file_push_is_one_change() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = engine.create_project("demo").unwrap();
    let ws = engine.create_container(project, "ws").unwrap();

    let files: Vec<(PathHash, Vec<u8>)> = (0..16u64)
        .map(|i| (path(&format!("dir/file{i}")), random_bytes(3_000 + i as usize * 100, i)))
        .collect();
    engine.write_files(project, ws, 0, &files).unwrap();

    let scope = Scope::Container(project, ws);
    assert_eq!(engine.location_index().paths_at(scope, 0).unwrap().len(), files.len());
    for (p, content) in &files {
        assert_eq!(&engine.regenerate_version(scope, 0, *p).unwrap(), content);
    }
}

#[test]
fn deleted_file_reads_empty_in_later_changes() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = seeded_project(&engine, &[("gone.txt", b"present in base".to_vec())]);
    let ws = engine.create_container(project, "ws").unwrap();
    engine.write_file(project, ws, 0, path("other"), b"unrelated").unwrap();
    engine.delete_file(project, ws, 1, path("gone.txt")).unwrap();

    let scope = Scope::Container(project, ws);
    assert_eq!(engine.regenerate_version(scope, 0, path("gone.txt")).unwrap(), b"present in base");
    assert!(engine.regenerate_version(scope, 1, path("gone.txt")).unwrap().is_empty());

    engine.merge(project, ws).unwrap();
    assert!(engine.regenerate_version(Scope::Commit(project), 1, path("gone.txt")).unwrap().is_empty());
}

#[test]
fn download_delta_brings_client_up_to_date() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let old = random_bytes(20_000, 8);
    let project = seeded_project(&engine, &[("doc", old.clone())]);
    let ws = engine.create_container(project, "ws").unwrap();
    let mut new = old.clone();
    new.truncate(15_000);
    new.extend_from_slice(b"a different ending");
    engine.write_file(project, ws, 0, path("doc"), &new).unwrap();

    let client_sig = delta::build_signature(engine.chunker(), old.as_slice()).unwrap();
    assert_eq!(client_sig, engine.commit_signature(project, 0, path("doc")).unwrap());

    let ops: Vec<Operation> = engine
        .read_delta(Scope::Container(project, ws), 0, path("doc"), client_sig)
        .unwrap()
        .collect::<Result<_, DeltaError>>()
        .unwrap();
    assert!(ops.iter().any(Operation::is_block));
    assert_eq!(delta::apply_to_vec(&ops, &old).unwrap(), new);

    let sig = engine.container_signature(project, ws, 0, path("doc")).unwrap();
    assert_eq!(sig.iter().map(|c| c.length).sum::<u64>(), new.len() as u64);
}

#[test]
fn manifests_are_versioned_with_changes() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = engine.create_project("demo").unwrap();
    let ws = engine.create_container(project, "ws").unwrap();

    let mut first = FileMetadata::new();
    first.insert("a.txt", FileEntry::file(b"a", 1_000));
    first.insert("src", FileEntry::dir(1_000));
    engine.write_manifest(project, ws, 0, &first).unwrap();

    let mut second = first.clone();
    second.insert("a.txt", FileEntry::file(b"aa", 2_000));
    second.remove("src");
    engine.write_manifest(project, ws, 1, &second).unwrap();

    let scope = Scope::Container(project, ws);
    assert_eq!(engine.read_manifest(scope, 0).unwrap(), first);
    assert_eq!(engine.read_manifest(scope, 1).unwrap(), second);

    let diff = FileMetadata::diff(&second, &first);
    assert_eq!(diff.get("a.txt").map(|d| d.kind), Some(DiffKind::Update));
    assert_eq!(diff.get("src").map(|d| d.kind), Some(DiffKind::Delete));

    assert_eq!(engine.merge(project, ws).unwrap(), Some(0));
    assert_eq!(engine.read_manifest(Scope::Commit(project), 0).unwrap(), second);
}

#[test]
fn state_survives_reopen() {
    let dir = tempdir().unwrap();
    let content = random_bytes(12_000, 9);
    let (project, ws) = {
        let engine = engine_at(&dir);
        let project = seeded_project(&engine, &[("kept", content.clone())]);
        let ws = engine.create_container(project, "ws").unwrap();
        engine.write_file(project, ws, 0, path("draft"), b"unmerged").unwrap();
        (project, ws)
    };

    let engine = engine_at(&dir);
    assert_eq!(engine.project_id("demo").unwrap(), project);
    assert_eq!(engine.container_id(project, "ws").unwrap(), ws);
    assert_eq!(engine.current_commit(project).unwrap(), Some(0));
    assert_eq!(engine.current_change(project, ws).unwrap(), Some(0));
    assert_eq!(engine.regenerate_version(Scope::Commit(project), 0, path("kept")).unwrap(), content);
    assert_eq!(
        engine.regenerate_version(Scope::Container(project, ws), 0, path("draft")).unwrap(),
        b"unmerged"
    );
}

#[test]
fn delete_project_removes_everything() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = seeded_project(&engine, &[("f", b"data".to_vec())]);
    let ws = engine.create_container(project, "ws").unwrap();
    engine.write_file(project, ws, 0, path("f"), b"more data").unwrap();

    engine.delete_project(project).unwrap();
    assert!(engine.project_id("demo").is_err());
    assert!(!engine.data_store().layout().project_dir(project).exists());
    assert!(engine.current_commit(project).is_err());
    assert_eq!(engine.location_index().max_version(Scope::Commit(project)).unwrap(), None);
}

#[test]
fn concurrent_containers_merge_linearly() {
    let dir = tempdir().unwrap();
    let engine = engine_at(&dir);
    let project = seeded_project(&engine, &[("shared", b"v0".to_vec())]);
    let containers: Vec<_> = (0..4)
        .map(|i| {
            let ws = engine.create_container(project, &format!("ws{i}")).unwrap();
            engine
                .write_file(project, ws, 0, path(&format!("own{i}")), format!("file {i}").as_bytes())
                .unwrap();
            ws
        })
        .collect();

    let mut commits: Vec<u64> = std::thread::scope(|s| {
        let handles: Vec<_> = containers
            .iter()
            .map(|&ws| {
                let engine = &engine;
                s.spawn(move || engine.merge(project, ws).unwrap().unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    commits.sort_unstable();
    assert_eq!(commits, [1, 2, 3, 4]);

    let latest = Scope::Commit(project);
    for i in 0..4 {
        assert_eq!(
            engine.regenerate_version(latest, 4, path(&format!("own{i}"))).unwrap(),
            format!("file {i}").as_bytes()
        );
    }
}
