//! End-to-end coverage of the `packtree-chk` binary: build a one-index
//! table directly through the library, then drive the CLI's default
//! describe-and-check pass over it.

use std::sync::Arc;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

use packtree::btree::BTree;
use packtree::cache::{FlushPolicy, KeyCache};
use packtree::coordinator::Coordinator;
use packtree::primitives::io::{FileIo, StdFileIo};
use packtree::types::{BinaryCollation, KeyDefBuilder, KeySegment, PageId, RecRef, StateInfo};

const BLOCK_LENGTH: u32 = 4096;

fn write_fixture_table(dir: &tempfile::TempDir, words: &[&str]) {
    let key_path = dir.path().join("table.key");
    let lock_path = dir.path().join("table.lock");

    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&key_path).unwrap());
    let cache = Arc::new(KeyCache::new(io.clone(), BLOCK_LENGTH, BLOCK_LENGTH as u64, 64).unwrap());

    let key_def = Arc::new(
        KeyDefBuilder::new(BLOCK_LENGTH, 4)
            .segment(KeySegment::var_text(64, Arc::new(BinaryCollation)))
            .build()
            .unwrap(),
    );
    let tree = BTree::new(key_def.clone(), cache.clone(), PageId::NONE, 0);
    for (i, word) in words.iter().enumerate() {
        let mut key = Vec::new();
        key_def.encode(&[Some(word.as_bytes())], RecRef((i + 1) as u64), &mut key).unwrap();
        tree.insert(&key, Vec::new()).unwrap();
    }
    cache.flush(FlushPolicy::ForceWrite).unwrap();

    let coordinator =
        Coordinator::open(&lock_path, cache.clone(), io.clone(), 0, FlushPolicy::ForceWrite, StateInfo::new(1)).unwrap();
    let write = coordinator.with_write().unwrap();
    write.with_state_mut(|state| {
        state.roots[0] = tree.root();
        state.records = words.len() as u64;
        state.set_index_enabled(0, true);
    });
    drop(write);
}

#[test]
fn check_reports_success_on_a_clean_table() {
    let dir = tempdir().unwrap();
    write_fixture_table(&dir, &["apple", "banana", "cherry"]);

    Command::cargo_bin("packtree-chk")
        .unwrap()
        .arg(dir.path().join("table"))
        .arg("--index")
        .arg("text:64")
        .assert()
        .success()
        .stdout(predicate::str::contains("OK, 3 keys"));
}

#[test]
fn describe_lists_the_one_configured_index() {
    let dir = tempdir().unwrap();
    write_fixture_table(&dir, &["only"]);

    Command::cargo_bin("packtree-chk")
        .unwrap()
        .arg(dir.path().join("table"))
        .arg("--index")
        .arg("text:64")
        .assert()
        .success()
        .stdout(predicate::str::contains("index 0 (plain)"));
}

#[test]
fn analyze_reports_per_index_cardinality() {
    let dir = tempdir().unwrap();
    write_fixture_table(&dir, &["apple", "apple", "banana"]);

    Command::cargo_bin("packtree-chk")
        .unwrap()
        .arg(dir.path().join("table"))
        .arg("--index")
        .arg("text:64")
        .arg("-a")
        .assert()
        .success()
        .stdout(predicate::str::contains("cardinality"));
}
