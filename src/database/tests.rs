use super::*;
use crate::file::{OpenMode, Store, StoreError};
use proptest::prelude::*;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::io::Write;
use std::rc::Rc;
use tempfile::TempDir;

const DB_NAME: &str = "test.arb";

fn small_tuning() -> Tuning {
    Tuning {
        leaf_record_max: 4,
        node_index_max: 4,
        leaf_cache_max: 16,
        node_cache_max: 16,
    }
}

fn open_with(dir: &TempDir, tuning: Tuning) -> Database {
    OpenOptions::new()
        .writer(true)
        .create(true)
        .tuning(tuning)
        .open(dir.path().join(DB_NAME), Comparator::Lexical)
        .unwrap()
}

fn open_reader(dir: &TempDir) -> Database {
    OpenOptions::new()
        .open(dir.path().join(DB_NAME), Comparator::Lexical)
        .unwrap()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{i:05}").into_bytes()
}

/// Visit 0..n in a scrambled but deterministic order
fn scrambled(n: usize) -> impl Iterator<Item = usize> {
    (0..n).map(move |i| (i * 7919) % n)
}

fn collect_forward(db: &mut Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut more = db.cursor_first().unwrap();
    while more {
        out.push(db.cursor_record().unwrap().unwrap());
        more = db.cursor_next().unwrap();
    }
    out
}

fn collect_backward(db: &mut Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut more = db.cursor_last().unwrap();
    while more {
        out.push(db.cursor_record().unwrap().unwrap());
        more = db.cursor_prev().unwrap();
    }
    out
}

#[test]
fn test_fresh_database_has_single_empty_leaf() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, Tuning::default());

    assert_eq!(db.leaf_count(), 1);
    assert_eq!(db.node_count(), 0);
    assert_eq!(db.record_count(), 0);
    assert!(db.is_writable());
    assert!(!db.in_transaction());
    assert!(!db.cursor_first().unwrap());
    assert!(!db.cursor_last().unwrap());
    assert_eq!(db.get(b"anything").unwrap(), None);
    db.close().unwrap();

    // The empty root was persisted, so a reader can open it
    let db = open_reader(&dir);
    assert_eq!(db.leaf_count(), 1);
    assert!(!db.is_writable());
}

#[test]
fn test_put_get_and_dup_modes() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, Tuning::default());

    assert!(db.put(b"k", b"one", DupMode::Overwrite).unwrap());
    assert!(db.put(b"k", b"two", DupMode::Overwrite).unwrap());
    assert_eq!(db.get(b"k").unwrap(), Some(b"two".to_vec()));
    assert_eq!(db.record_count(), 1);

    assert!(!db.put(b"k", b"three", DupMode::KeepExisting).unwrap());
    assert_eq!(db.get(b"k").unwrap(), Some(b"two".to_vec()));
    assert_eq!(db.record_count(), 1);

    assert!(db.put(b"k", b"+more", DupMode::Concatenate).unwrap());
    assert_eq!(db.get(b"k").unwrap(), Some(b"two+more".to_vec()));
    assert_eq!(db.record_count(), 1);

    assert!(db.put(b"", b"empty key", DupMode::Overwrite).unwrap());
    assert_eq!(db.get(b"").unwrap(), Some(b"empty key".to_vec()));
    assert_eq!(db.vnum(b"missing").unwrap(), 0);
    assert!(!db.out(b"missing").unwrap());
}

#[test]
fn test_five_keys_with_three_record_leaves() {
    let dir = TempDir::new().unwrap();
    let tuning = Tuning {
        leaf_record_max: 3,
        ..Tuning::default()
    };
    let mut db = open_with(&dir, tuning);

    for k in [b"a", b"b", b"c", b"d", b"e"] {
        db.put(k, k, DupMode::Overwrite).unwrap();
    }

    assert_eq!(db.leaf_count(), 2);
    assert_eq!(db.node_count(), 1);
    let PageId::Node(root) = db.meta.root else {
        panic!("root should be a node after a split");
    };
    let root = db.load_node(root).unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root.heir, PageId::Leaf(LeafId::FIRST));
    assert_eq!(root.indices[0].key, b"c");

    let keys: Vec<Vec<u8>> = collect_forward(&mut db).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);
    assert_eq!(db.meta.last, LeafId::from_seq(1).unwrap());
}

#[test]
fn test_ascending_inserts_split_leaves_in_pairs() {
    let max = 3;
    for k in 1..=6 {
        let dir = TempDir::new().unwrap();
        let mut db = open_with(
            &dir,
            Tuning {
                leaf_record_max: max,
                ..Tuning::default()
            },
        );
        let n = max * k + 1;
        for i in 0..n {
            db.put(&key(i), b"v", DupMode::Overwrite).unwrap();
        }

        // Each split leaves two records behind and carries the rest on
        assert_eq!(db.leaf_count() as usize, n / 2, "k = {k}");

        let mut id = Some(LeafId::FIRST);
        let mut seen = 0;
        while let Some(leaf_id) = id {
            let leaf = db.load_leaf(leaf_id).unwrap();
            assert!((1..=max + 1).contains(&leaf.len()), "{leaf_id} holds {}", leaf.len());
            seen += leaf.len();
            id = leaf.next;
        }
        assert_eq!(seen, n);
    }
}

#[test]
fn test_many_keys_stay_ordered_across_reopen() {
    let dir = TempDir::new().unwrap();
    let n = 3000;
    {
        let mut db = open_with(&dir, small_tuning());
        for i in scrambled(n) {
            db.put(&key(i), format!("value{i}").as_bytes(), DupMode::Overwrite).unwrap();
            assert!(db.leaves.len() <= db.tuning.leaf_cache_max + CACHE_OUT);
            assert!(db.nodes.len() <= db.tuning.node_cache_max + CACHE_OUT);
        }
        assert_eq!(db.record_count(), n as u32);
        assert!(db.node_count() > 1, "expected a multi-level tree");
        assert_eq!(db.get(&key(1234)).unwrap(), Some(b"value1234".to_vec()));
        db.close().unwrap();
    }

    let mut db = OpenOptions::new()
        .tuning(small_tuning())
        .open(dir.path().join(DB_NAME), Comparator::Lexical)
        .unwrap();
    assert_eq!(db.record_count(), n as u32);

    let forward = collect_forward(&mut db);
    assert_eq!(forward.len(), n);
    for (i, (k, v)) in forward.iter().enumerate() {
        assert_eq!(k, &key(i));
        assert_eq!(v, format!("value{i}").as_bytes());
    }

    let mut backward = collect_backward(&mut db);
    backward.reverse();
    assert_eq!(backward, forward);

    for i in scrambled(n).step_by(97) {
        assert_eq!(db.get(&key(i)).unwrap(), Some(format!("value{i}").into_bytes()));
    }
}

#[test]
fn test_duplicates() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, small_tuning());

    db.put(b"a", b"a0", DupMode::Overwrite).unwrap();
    db.put_list(b"m", &[b"m0", b"m1", b"m2"]).unwrap();
    db.put(b"z", b"z0", DupMode::Overwrite).unwrap();
    assert_eq!(db.record_count(), 5);

    assert_eq!(db.vnum(b"m").unwrap(), 3);
    assert_eq!(db.get(b"m").unwrap(), Some(b"m0".to_vec()));
    assert_eq!(
        db.get_list(b"m").unwrap(),
        Some(vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec()])
    );
    assert_eq!(db.get_cat(b"m").unwrap(), Some(b"m0m1m2".to_vec()));

    let values: Vec<Vec<u8>> = collect_forward(&mut db).into_iter().map(|(_, v)| v).collect();
    assert_eq!(values, vec![b"a0".to_vec(), b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec(), b"z0".to_vec()]);
    let values: Vec<Vec<u8>> = collect_backward(&mut db).into_iter().map(|(_, v)| v).collect();
    assert_eq!(values, vec![b"z0".to_vec(), b"m2".to_vec(), b"m1".to_vec(), b"m0".to_vec(), b"a0".to_vec()]);

    // Removing the first value promotes the oldest duplicate
    assert!(db.out(b"m").unwrap());
    assert_eq!(db.get(b"m").unwrap(), Some(b"m1".to_vec()));
    assert_eq!(db.record_count(), 4);

    assert!(db.out_list(b"m").unwrap());
    assert_eq!(db.get(b"m").unwrap(), None);
    assert_eq!(db.record_count(), 2);
    assert!(!db.out_list(b"m").unwrap());

    let empty: [&[u8]; 0] = [];
    assert!(matches!(db.put_list(b"m", &empty), Err(DbError::Misc(_))));
}

#[test]
fn test_cursor_jump() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, Tuning::default());
    db.put(b"b", b"b0", DupMode::Overwrite).unwrap();
    db.put(b"d", b"d0", DupMode::Overwrite).unwrap();
    db.put(b"d", b"d1", DupMode::AllowDuplicate).unwrap();
    db.put(b"f", b"f0", DupMode::Overwrite).unwrap();

    assert!(db.cursor_jump(b"c", JumpMode::Forward).unwrap());
    assert_eq!(db.cursor_record().unwrap(), Some((b"d".to_vec(), b"d0".to_vec())));

    assert!(db.cursor_jump(b"c", JumpMode::Backward).unwrap());
    assert_eq!(db.cursor_key().unwrap(), Some(b"b".to_vec()));

    // An exact hit lands on the first or the last duplicate
    assert!(db.cursor_jump(b"d", JumpMode::Forward).unwrap());
    assert_eq!(db.cursor_value().unwrap(), Some(b"d0".to_vec()));
    assert!(db.cursor_jump(b"d", JumpMode::Backward).unwrap());
    assert_eq!(db.cursor_value().unwrap(), Some(b"d1".to_vec()));

    assert!(db.cursor_jump(b"e", JumpMode::Backward).unwrap());
    assert_eq!(db.cursor_value().unwrap(), Some(b"d1".to_vec()));

    assert!(!db.cursor_jump(b"g", JumpMode::Forward).unwrap());
    assert_eq!(db.cursor_key().unwrap(), None);
    assert!(!db.cursor_jump(b"a", JumpMode::Backward).unwrap());
    assert!(db.cursor_jump(b"a", JumpMode::Forward).unwrap());
    assert_eq!(db.cursor_key().unwrap(), Some(b"b".to_vec()));

    // Any write invalidates the cursor
    db.put(b"c", b"c0", DupMode::Overwrite).unwrap();
    assert_eq!(db.cursor_key().unwrap(), None);
    assert!(!db.cursor_next().unwrap());
}

#[test]
fn test_cursor_jump_across_leaves() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, small_tuning());
    for i in (0..200).step_by(2) {
        db.put(&key(i), b"v", DupMode::Overwrite).unwrap();
    }
    assert!(db.leaf_count() > 10);

    for i in (1..199).step_by(2) {
        assert!(db.cursor_jump(&key(i), JumpMode::Forward).unwrap());
        assert_eq!(db.cursor_key().unwrap(), Some(key(i + 1)));
        assert!(db.cursor_jump(&key(i), JumpMode::Backward).unwrap());
        assert_eq!(db.cursor_key().unwrap(), Some(key(i - 1)));
    }
}

#[test]
fn test_cursor_skips_emptied_leaves() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, small_tuning());
    for i in 0..60 {
        db.put(&key(i), b"v", DupMode::Overwrite).unwrap();
    }
    // Empty out whole leaves at both ends and in the middle
    for i in (0..15).chain(25..40).chain(50..60) {
        assert!(db.out(&key(i)).unwrap());
    }

    let keys: Vec<Vec<u8>> = collect_forward(&mut db).into_iter().map(|(k, _)| k).collect();
    let expected: Vec<Vec<u8>> = (15..25).chain(40..50).map(key).collect();
    assert_eq!(keys, expected);

    let mut keys: Vec<Vec<u8>> = collect_backward(&mut db).into_iter().map(|(k, _)| k).collect();
    keys.reverse();
    assert_eq!(keys, expected);

    assert!(db.cursor_jump(&key(30), JumpMode::Forward).unwrap());
    assert_eq!(db.cursor_key().unwrap(), Some(key(40)));
    assert!(db.cursor_jump(&key(30), JumpMode::Backward).unwrap());
    assert_eq!(db.cursor_key().unwrap(), Some(key(24)));
}

#[test]
fn test_reader_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, Tuning::default());
    db.put(b"k", b"v", DupMode::Overwrite).unwrap();
    db.close().unwrap();

    let mut db = open_reader(&dir);
    assert!(matches!(db.put(b"k", b"w", DupMode::Overwrite), Err(DbError::Mode(_))));
    assert!(matches!(db.out(b"k"), Err(DbError::Mode(_))));
    assert!(matches!(db.transaction_begin(), Err(DbError::Mode(_))));
    assert!(matches!(db.sync(), Err(DbError::Mode(_))));
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_missing_file_without_create() {
    let dir = TempDir::new().unwrap();
    let result = OpenOptions::new()
        .writer(true)
        .open(dir.path().join("absent.arb"), Comparator::Lexical);
    assert!(matches!(result, Err(DbError::Store(StoreError::FileNotFound(_)))));
}

#[test]
fn test_transaction_abort_restores_state() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, small_tuning());
    for i in 0..50 {
        db.put(&key(i), b"before", DupMode::Overwrite).unwrap();
    }
    let before = collect_forward(&mut db);
    let (leaves, nodes, records) = (db.leaf_count(), db.node_count(), db.record_count());

    db.transaction_begin().unwrap();
    assert!(db.in_transaction());
    for i in 50..500 {
        db.put(&key(i), b"during", DupMode::Overwrite).unwrap();
    }
    for i in 0..25 {
        db.out(&key(i)).unwrap();
    }
    db.put(&key(30), b"changed", DupMode::Overwrite).unwrap();
    assert!(db.leaf_count() > leaves);
    db.transaction_abort().unwrap();

    assert!(!db.in_transaction());
    assert_eq!((db.leaf_count(), db.node_count(), db.record_count()), (leaves, nodes, records));
    assert_eq!(collect_forward(&mut db), before);
    assert_eq!(db.get(&key(30)).unwrap(), Some(b"before".to_vec()));
    assert_eq!(db.get(&key(100)).unwrap(), None);
    db.close().unwrap();

    let mut db = open_reader(&dir);
    assert_eq!(collect_forward(&mut db), before);
}

#[test]
fn test_transaction_commit_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, small_tuning());
    db.transaction_begin().unwrap();
    for i in 0..300 {
        db.put(&key(i), b"committed", DupMode::Overwrite).unwrap();
    }
    // Nothing is evicted while the transaction runs
    assert!(db.leaves.len() > db.tuning.leaf_cache_max);
    db.transaction_commit().unwrap();
    assert!(db.leaves.len() <= db.tuning.leaf_cache_max);
    db.close().unwrap();

    let mut db = open_reader(&dir);
    assert_eq!(db.record_count(), 300);
    assert_eq!(collect_forward(&mut db).len(), 300);
    assert_eq!(db.get(&key(299)).unwrap(), Some(b"committed".to_vec()));
}

#[test]
fn test_close_aborts_open_transaction() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, Tuning::default());
    db.put(b"kept", b"v", DupMode::Overwrite).unwrap();
    db.transaction_begin().unwrap();
    db.put(b"dropped", b"v", DupMode::Overwrite).unwrap();
    db.close().unwrap();

    let mut db = open_reader(&dir);
    assert_eq!(db.get(b"kept").unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.get(b"dropped").unwrap(), None);
    assert_eq!(db.record_count(), 1);
}

#[test]
fn test_transaction_state_errors() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, Tuning::default());
    assert!(matches!(db.transaction_commit(), Err(DbError::Mode(_))));
    assert!(matches!(db.transaction_abort(), Err(DbError::Mode(_))));

    db.transaction_begin().unwrap();
    assert!(matches!(db.transaction_begin(), Err(DbError::Mode(_))));
    assert!(matches!(db.sync(), Err(DbError::Mode(_))));
    assert!(matches!(db.optimize(), Err(DbError::Mode(_))));
    db.transaction_commit().unwrap();
    db.sync().unwrap();
}

#[test]
fn test_drop_closes_handle() {
    let dir = TempDir::new().unwrap();
    {
        let mut db = open_with(&dir, Tuning::default());
        db.put(b"k", b"v", DupMode::Overwrite).unwrap();
    }
    let mut db = open_reader(&dir);
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_sync_empties_caches() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, small_tuning());
    for i in 0..100 {
        db.put(&key(i), b"v", DupMode::Overwrite).unwrap();
    }
    db.sync().unwrap();
    assert!(db.leaves.is_empty());
    assert!(db.nodes.is_empty());

    // A second handle sees the synced state without the first closing
    let mut reader = OpenOptions::new()
        .no_lock(true)
        .open(dir.path().join(DB_NAME), Comparator::Lexical)
        .unwrap();
    assert_eq!(reader.record_count(), 100);
    assert_eq!(reader.get(&key(42)).unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_optimize_keeps_data() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, small_tuning());
    // Growing values outgrow their slots, leaving dead frames behind
    for round in 0..5u8 {
        for i in 0..200 {
            db.put(&key(i), &vec![b'a' + round; 10 + 30 * round as usize], DupMode::Overwrite).unwrap();
        }
        db.sync().unwrap();
    }
    let before = db.file_size();
    db.optimize().unwrap();
    assert!(db.file_size() < before);
    assert_eq!(db.get(&key(150)).unwrap(), Some(vec![b'e'; 130]));
    db.close().unwrap();

    let mut db = open_reader(&dir);
    assert_eq!(collect_forward(&mut db).len(), 200);
}

/// Levels from the root down to the leaves, leaves included
fn tree_depth(db: &mut Database) -> usize {
    let mut page = db.meta.root;
    let mut depth = 1;
    while let PageId::Node(id) = page {
        page = db.load_node(id).unwrap().heir;
        depth += 1;
    }
    depth
}

#[test]
fn test_optimize_deep_tree_then_reopen() {
    let dir = TempDir::new().unwrap();
    let n = 4000;
    let mut db = open_with(&dir, small_tuning());
    for i in scrambled(n) {
        db.put(&key(i), format!("v{i}").as_bytes(), DupMode::Overwrite).unwrap();
    }
    for i in (0..n).step_by(3) {
        db.put(&key(i), format!("second{i}").as_bytes(), DupMode::Overwrite).unwrap();
    }
    assert!(tree_depth(&mut db) >= 4);
    let (leaves, nodes) = (db.leaf_count(), db.node_count());

    db.optimize().unwrap();
    assert!(!dir.path().join(format!("{DB_NAME}.opt")).exists());
    assert_eq!(db.get(&key(3)).unwrap(), Some(b"second3".to_vec()));
    db.close().unwrap();

    let mut db = open_reader(&dir);
    assert_eq!((db.leaf_count(), db.node_count()), (leaves, nodes));
    assert_eq!(db.record_count(), n as u32);
    let all = collect_forward(&mut db);
    assert_eq!(all.len(), n);
    for (i, (k, v)) in all.iter().enumerate() {
        assert_eq!(k, &key(i));
        let expected = if i % 3 == 0 { format!("second{i}") } else { format!("v{i}") };
        assert_eq!(v, expected.as_bytes());
    }
}

#[test]
fn test_failed_optimize_loses_nothing() {
    let dir = TempDir::new().unwrap();
    let mut db = open_with(&dir, small_tuning());
    for i in 0..500 {
        db.put(&key(i), b"committed", DupMode::Overwrite).unwrap();
    }
    db.sync().unwrap();

    // Occupy the scratch path so compaction cannot create its file
    std::fs::create_dir(dir.path().join(format!("{DB_NAME}.opt"))).unwrap();
    assert!(matches!(db.optimize(), Err(DbError::Store(StoreError::Io(_)))));

    assert_eq!(db.record_count(), 500);
    assert_eq!(db.get(&key(250)).unwrap(), Some(b"committed".to_vec()));
    db.put(&key(500), b"after", DupMode::Overwrite).unwrap();
    db.close().unwrap();

    let mut db = open_reader(&dir);
    assert_eq!(db.record_count(), 501);
    assert_eq!(collect_forward(&mut db).len(), 501);
    assert_eq!(db.get(&key(500)).unwrap(), Some(b"after".to_vec()));
}

#[test]
fn test_native_int_keys() {
    let dir = TempDir::new().unwrap();
    let mut db = OpenOptions::new()
        .writer(true)
        .create(true)
        .tuning(small_tuning())
        .open(dir.path().join(DB_NAME), Comparator::NativeInt)
        .unwrap();
    for i in scrambled(101) {
        let n = i as i32 - 50;
        db.put(&n.to_ne_bytes(), b"", DupMode::Overwrite).unwrap();
    }
    let keys: Vec<i32> = collect_forward(&mut db)
        .into_iter()
        .map(|(k, _)| i32::from_ne_bytes(k.try_into().unwrap()))
        .collect();
    assert_eq!(keys, (-50..=50).collect::<Vec<_>>());
}

#[test]
fn test_export_import_round_trip() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("dump.tsv");
    let mut db = open_with(&dir, small_tuning());
    for i in 0..80 {
        db.put(&key(i), &[i as u8, 0, 0xFF, b'\t', b'\n'], DupMode::Overwrite).unwrap();
    }
    db.put_list(&[0x00, 0xFF], &[b"x", b"y", b"z"]).unwrap();
    assert_eq!(db.export(&dump).unwrap(), 83);
    let original = collect_forward(&mut db);
    db.close().unwrap();

    let mut copy = OpenOptions::new()
        .writer(true)
        .create(true)
        .tuning(small_tuning())
        .open(dir.path().join("copy.arb"), Comparator::Lexical)
        .unwrap();
    assert_eq!(copy.import(&dump).unwrap(), 83);
    assert_eq!(collect_forward(&mut copy), original);
    assert_eq!(copy.get_list(&[0x00, 0xFF]).unwrap().unwrap().len(), 3);

    // Importing twice would duplicate everything
    assert!(matches!(copy.import(&dump), Err(DbError::Misc(_))));
}

#[test]
fn test_import_rejects_malformed_rows() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("bad.tsv");
    std::fs::write(&dump, "0\tzz\t00\n").unwrap();
    let mut db = open_with(&dir, Tuning::default());
    assert!(matches!(db.import(&dump), Err(DbError::Broken(_))));
}

#[test]
fn test_repair_after_torn_write() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(DB_NAME);
    let mut db = open_with(&dir, small_tuning());
    for i in 0..200 {
        db.put(&key(i), b"v", DupMode::Overwrite).unwrap();
    }
    db.put(&key(7), b"dup", DupMode::AllowDuplicate).unwrap();
    db.close().unwrap();

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[1, 0xFF, 0xFF]).unwrap();
    drop(file);

    let broken = OpenOptions::new().open(&path, Comparator::Lexical);
    assert!(broken.err().is_some_and(|e| e.is_broken()));

    Database::repair(&path, Comparator::Lexical).unwrap();
    let mut db = open_reader(&dir);
    assert_eq!(db.record_count(), 201);
    assert_eq!(collect_forward(&mut db).len(), 201);
    assert_eq!(db.get_list(&key(7)).unwrap(), Some(vec![b"v".to_vec(), b"dup".to_vec()]));
}

fn repair_leftovers(dir: &TempDir) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.to_string_lossy().ends_with(".repair"))
        .collect()
}

fn refusing_compare(_: &[u8], _: &[u8]) -> std::cmp::Ordering {
    panic!("comparator gave up");
}

#[test]
fn test_interrupted_repair_cleans_up() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(DB_NAME);
    let mut db = open_with(&dir, small_tuning());
    for i in 0..50 {
        db.put(&key(i), b"v", DupMode::Overwrite).unwrap();
    }
    db.close().unwrap();

    // The rebuild dies on its second insert, after the scratch file exists
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        Database::repair(&path, Comparator::Custom(refusing_compare))
    }));
    assert!(outcome.is_err());
    assert!(repair_leftovers(&dir).is_empty());

    let mut db = open_reader(&dir);
    assert_eq!(db.record_count(), 50);
    assert_eq!(collect_forward(&mut db).len(), 50);
    drop(db);

    Database::repair(&path, Comparator::Lexical).unwrap();
    assert!(repair_leftovers(&dir).is_empty());
    let mut db = open_reader(&dir);
    assert_eq!(collect_forward(&mut db).len(), 50);
}

#[test]
fn test_repair_rebuilds_lost_metadata() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(DB_NAME);
    let mut db = open_with(&dir, small_tuning());
    for i in 0..120 {
        db.put(&key(i), b"v", DupMode::Overwrite).unwrap();
    }
    db.close().unwrap();

    let mut store = HashStore::open(&path, OpenMode::WRITER).unwrap();
    assert!(store.delete(&META_ROOT.to_ne_bytes()).unwrap());
    store.close().unwrap();
    drop(store);

    assert!(matches!(
        OpenOptions::new().open(&path, Comparator::Lexical),
        Err(DbError::Broken(_))
    ));

    Database::repair(&path, Comparator::Lexical).unwrap();
    let mut db = open_reader(&dir);
    let keys: Vec<Vec<u8>> = collect_forward(&mut db).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (0..120).map(key).collect::<Vec<_>>());
}

#[test]
fn test_error_handler_sees_corrupt_node() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(DB_NAME);
    let mut db = open_with(&dir, small_tuning());
    for i in 0..40 {
        db.put(&key(i), b"v", DupMode::Overwrite).unwrap();
    }
    let root = db.meta.root;
    assert!(matches!(root, PageId::Node(_)));
    db.close().unwrap();

    let mut store = HashStore::open(&path, OpenMode::WRITER).unwrap();
    store.put(&root.storage_key(), &[], true).unwrap();
    store.close().unwrap();
    drop(store);

    let mut db = open_reader(&dir);
    let calls = Rc::new(Cell::new(0));
    let seen = Rc::clone(&calls);
    db.set_error_handler(move |err| {
        assert!(err.is_broken());
        seen.set(seen.get() + 1);
    });

    let err = db.get(&key(3)).unwrap_err();
    assert!(err.is_broken());
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_lock_contention() {
    let dir = TempDir::new().unwrap();
    let _db = open_with(&dir, Tuning::default());
    let second = OpenOptions::new()
        .writer(true)
        .lock_nonblocking(true)
        .open(dir.path().join(DB_NAME), Comparator::Lexical);
    assert!(matches!(second, Err(DbError::Store(StoreError::Locked(_)))));
}

#[cfg(feature = "compression")]
#[test]
fn test_compressed_database() {
    let dir = TempDir::new().unwrap();
    let mut db = OpenOptions::new()
        .writer(true)
        .create(true)
        .compress(true)
        .tuning(small_tuning())
        .open(dir.path().join(DB_NAME), Comparator::Lexical)
        .unwrap();
    assert!(db.is_compressed());
    for i in 0..150 {
        db.put(&key(i), &[b'x'; 64], DupMode::Overwrite).unwrap();
    }
    db.close().unwrap();

    // The flag persists; the caller's request no longer matters
    let mut db = open_reader(&dir);
    assert!(db.is_compressed());
    let all = collect_forward(&mut db);
    assert_eq!(all.len(), 150);
    assert!(all.iter().all(|(_, v)| v == &[b'x'; 64]));
    drop(db);

    Database::repair(dir.path().join(DB_NAME), Comparator::Lexical).unwrap();
    let mut db = open_reader(&dir);
    assert!(db.is_compressed());
    assert_eq!(collect_forward(&mut db).len(), 150);
}

#[derive(Debug, Clone)]
enum Op {
    Put { key: u8, value: u8, dup: bool },
    Out { key: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..48u8, any::<u8>(), any::<bool>()).prop_map(|(key, value, dup)| Op::Put { key, value, dup }),
        1 => (0..48u8).prop_map(|key| Op::Out { key }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tree_matches_sorted_model(ops in prop::collection::vec(op_strategy(), 1..400)) {
        let dir = TempDir::new().unwrap();
        let mut db = open_with(&dir, Tuning { leaf_record_max: 3, node_index_max: 4, ..small_tuning() });
        let mut model: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();

        for op in &ops {
            match *op {
                Op::Put { key, value, dup } => {
                    let k = vec![b'k', key];
                    let mode = if dup { DupMode::AllowDuplicate } else { DupMode::Overwrite };
                    db.put(&k, &[value], mode).unwrap();
                    let values = model.entry(k).or_default();
                    if dup || values.is_empty() {
                        values.push(vec![value]);
                    } else {
                        values[0] = vec![value];
                    }
                }
                Op::Out { key } => {
                    let k = vec![b'k', key];
                    let expected = model.contains_key(&k);
                    prop_assert_eq!(db.out(&k).unwrap(), expected);
                    if let Some(values) = model.get_mut(&k) {
                        values.remove(0);
                        if values.is_empty() {
                            model.remove(&k);
                        }
                    }
                }
            }
        }

        let expected: Vec<(Vec<u8>, Vec<u8>)> = model
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.clone(), v.clone())))
            .collect();
        prop_assert_eq!(db.record_count() as usize, expected.len());
        prop_assert_eq!(collect_forward(&mut db), expected.clone());
        db.close().unwrap();

        let mut db = open_reader(&dir);
        prop_assert_eq!(collect_forward(&mut db), expected);
    }
}
