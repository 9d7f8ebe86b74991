//! Tests for Store
//!
//! These tests verify:
//! - Basic get/set/remove operations
//! - Typed accessors
//! - Persistence across reopen
//! - Compaction, clear and trim
//! - Concurrent readers during writes
//! - Store lifecycle (open/close)

use mapkv::config::{Config, SyncStrategy};
use mapkv::engine::Store;
use mapkv::codec::{DecodeError, MAX_NESTING_DEPTH};
use mapkv::{MapKvError, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let store = open_at(&temp_dir);
    (temp_dir, store)
}

fn open_at(temp_dir: &TempDir) -> Store {
    let config = Config::builder()
        .path(temp_dir.path().join("db"))
        .sync_strategy(SyncStrategy::EveryWrite) // Sync every write for test reliability
        .build()
        .unwrap();
    Store::open(config).unwrap()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_store_open_creates_files() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("settings");

    let store = Store::open_path(&path).unwrap();

    assert!(path.exists());
    assert!(temp_dir.path().join("nested").join("settings.crc").exists());
    assert_eq!(store.count().unwrap(), 0);
    assert_eq!(store.actual_size(), 0);
    assert_eq!(store.total_size(), 4096);
}

#[test]
fn test_store_set_get() {
    let (_temp, store) = setup_temp_store();

    store.set("hello", "world").unwrap();

    assert_eq!(store.get("hello").unwrap(), Some(Value::from("world")));
}

#[test]
fn test_store_get_nonexistent_key() {
    let (_temp, store) = setup_temp_store();

    assert_eq!(store.get("nonexistent").unwrap(), None);
    assert!(!store.contains_key("nonexistent").unwrap());
}

#[test]
fn test_store_last_write_wins() {
    let (_temp, store) = setup_temp_store();

    store.set_int("k", 1).unwrap();
    store.set_int("k", 2).unwrap();

    assert_eq!(store.get_int("k").unwrap(), Some(2));
    assert_eq!(store.count().unwrap(), 1);
}

#[test]
fn test_store_overwrite_changes_type() {
    let (_temp, store) = setup_temp_store();

    store.set_int("k", 7).unwrap();
    store.set_string("k", "seven").unwrap();

    assert_eq!(store.get_int("k").unwrap(), None);
    assert_eq!(store.get_string("k").unwrap(), Some("seven".to_string()));
}

#[test]
fn test_store_remove() {
    let (_temp, store) = setup_temp_store();

    store.set("k", "v").unwrap();
    store.remove("k").unwrap();

    assert_eq!(store.get("k").unwrap(), None);
    assert!(!store.contains_key("k").unwrap());
}

#[test]
fn test_store_remove_absent_key_appends_nothing() {
    let (_temp, store) = setup_temp_store();
    store.set("a", "1").unwrap();
    let before = store.actual_size();

    store.remove("missing").unwrap();

    assert_eq!(store.actual_size(), before);
}

#[test]
fn test_store_remove_many() {
    let (_temp, store) = setup_temp_store();
    for key in ["a", "b", "c"] {
        store.set(key, key).unwrap();
    }

    let removed = store.remove_many(&["a", "c", "zzz"]).unwrap();

    assert_eq!(removed, 2);
    assert_eq!(store.all_keys().unwrap(), vec!["b".to_string()]);
    // Already gone, nothing to count
    assert_eq!(store.remove_many(&["a", "a"]).unwrap(), 0);
}

#[test]
fn test_store_empty_key_rejected() {
    let (_temp, store) = setup_temp_store();

    assert!(matches!(store.set("", 1i64), Err(MapKvError::InvalidKey(_))));
    assert!(matches!(store.remove(""), Err(MapKvError::InvalidKey(_))));
}

#[test]
fn test_store_rejects_overly_nested_value() {
    let (_temp, store) = setup_temp_store();
    let mut value = Value::Bool(true);
    for _ in 0..=MAX_NESTING_DEPTH {
        value = Value::Nested(vec![value]);
    }

    let result = store.set("deep", value);

    assert!(matches!(result, Err(MapKvError::Decode(DecodeError::Malformed(_)))));
    assert!(!store.contains_key("deep").unwrap());
    assert_eq!(store.actual_size(), 0);
}

#[test]
fn test_store_all_keys_sorted() {
    let (_temp, store) = setup_temp_store();

    store.set_bool("zeta", true).unwrap();
    store.set_bool("alpha", true).unwrap();
    store.set_bool("mid", true).unwrap();
    store.remove("mid").unwrap();

    assert_eq!(store.all_keys().unwrap(), vec!["alpha".to_string(), "zeta".to_string()]);
}

#[test]
fn test_store_typed_accessors() {
    let (_temp, store) = setup_temp_store();

    store.set_bool("bool", true).unwrap();
    store.set_int("int", -42).unwrap();
    store.set_uint("uint", u64::MAX).unwrap();
    store.set_float("float", 1.5).unwrap();
    store.set_double("double", -0.25).unwrap();
    store.set_string("string", "héllo").unwrap();
    store.set_bytes("bytes", &[0, 1, 2, 255]).unwrap();

    assert_eq!(store.get_bool("bool").unwrap(), Some(true));
    assert_eq!(store.get_int("int").unwrap(), Some(-42));
    assert_eq!(store.get_uint("uint").unwrap(), Some(u64::MAX));
    assert_eq!(store.get_float("float").unwrap(), Some(1.5));
    assert_eq!(store.get_double("double").unwrap(), Some(-0.25));
    assert_eq!(store.get_string("string").unwrap(), Some("héllo".to_string()));
    assert_eq!(store.get_bytes("bytes").unwrap().as_deref(), Some(&[0u8, 1, 2, 255][..]));
}

#[test]
fn test_store_nested_value() {
    let (_temp, store) = setup_temp_store();
    let nested = Value::Nested(vec![Value::Int(1), Value::from("two"), Value::Nested(vec![])]);

    store.set("list", nested.clone()).unwrap();

    assert_eq!(store.get("list").unwrap(), Some(nested));
}

#[test]
fn test_store_empty_string_is_not_a_tombstone() {
    let (_temp, store) = setup_temp_store();

    store.set_string("blank", "").unwrap();

    assert!(store.contains_key("blank").unwrap());
    assert_eq!(store.get_string("blank").unwrap(), Some(String::new()));
}

#[test]
fn test_store_value_size() {
    let (_temp, store) = setup_temp_store();

    store.set_bytes("b", &[9; 10]).unwrap();

    let encoded = Value::from(&[9u8; 10][..]).encode();
    assert_eq!(store.value_size("b").unwrap(), Some(encoded.len()));
    assert_eq!(store.value_size("missing").unwrap(), None);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_store_reopen_keeps_values() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = open_at(&temp_dir);
        store.set_string("name", "mapkv").unwrap();
        store.set_int("answer", 42).unwrap();
        store.set_int("gone", 0).unwrap();
        store.remove("gone").unwrap();
        store.close().unwrap();
    }

    let store = open_at(&temp_dir);
    assert_eq!(store.get_string("name").unwrap(), Some("mapkv".to_string()));
    assert_eq!(store.get_int("answer").unwrap(), Some(42));
    assert_eq!(store.get("gone").unwrap(), None);
    assert_eq!(store.count().unwrap(), 2);
}

#[test]
fn test_store_reopen_without_explicit_close() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = open_at(&temp_dir);
        store.set_int("k", 5).unwrap();
        // Dropped here
    }

    let store = open_at(&temp_dir);
    assert_eq!(store.get_int("k").unwrap(), Some(5));
}

#[test]
fn test_store_db_example() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("db");
    {
        let store = Store::open_path(&path).unwrap();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.set("a", "3").unwrap();
        store.compact().unwrap();
        store.close().unwrap();
    }

    let store = Store::open_path(&path).unwrap();
    assert_eq!(store.get_string("a").unwrap(), Some("3".to_string()));
    assert_eq!(store.get_string("b").unwrap(), Some("2".to_string()));
}

#[test]
fn test_store_sync_strategies_persist() {
    for strategy in [
        SyncStrategy::EveryWrite,
        SyncStrategy::EveryNWrites { count: 3 },
        SyncStrategy::OnClose,
    ] {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::builder()
            .path(temp_dir.path().join("db"))
            .sync_strategy(strategy)
            .build()
            .unwrap();
        {
            let store = Store::open(config.clone()).unwrap();
            for i in 0..10 {
                store.set_int(&format!("k{}", i), i).unwrap();
            }
            store.close().unwrap();
        }

        let store = Store::open(config).unwrap();
        assert_eq!(store.count().unwrap(), 10, "strategy {:?}", strategy);
        assert_eq!(store.get_int("k9").unwrap(), Some(9));
    }
}

// =============================================================================
// Growth / Compaction Tests
// =============================================================================

#[test]
fn test_store_grows_past_initial_capacity() {
    let (_temp, store) = setup_temp_store();
    let value = vec![7u8; 1000];

    for i in 0..20 {
        store.set_bytes(&format!("key{}", i), &value).unwrap();
    }

    assert!(store.total_size() > 4096);
    assert!(store.total_size().is_power_of_two());
    assert_eq!(store.count().unwrap(), 20);
    assert_eq!(store.get_bytes("key19").unwrap().as_deref(), Some(&value[..]));
}

#[test]
fn test_store_auto_compacts_overwrites() {
    let (_temp, store) = setup_temp_store();
    let value = vec![1u8; 500];

    // One live key, rewritten far more than the initial capacity holds
    for _ in 0..100 {
        store.set_bytes("hot", &value).unwrap();
    }

    assert!(store.sequence_id() > 0);
    assert_eq!(store.total_size(), 4096);
    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(store.get_bytes("hot").unwrap().as_deref(), Some(&value[..]));
}

#[test]
fn test_store_compact_removes_dead_entries() {
    let (_temp, store) = setup_temp_store();
    store.set("a", "1").unwrap();
    store.set("b", "2").unwrap();
    store.set("a", "3").unwrap();
    store.remove("b").unwrap();
    let before = store.actual_size();

    store.compact().unwrap();

    assert!(store.actual_size() < before);
    assert_eq!(store.all_keys().unwrap(), vec!["a".to_string()]);
    assert_eq!(store.get_string("a").unwrap(), Some("3".to_string()));
}

#[test]
fn test_store_compact_is_idempotent() {
    let (_temp, store) = setup_temp_store();
    for i in 0..10 {
        store.set_int(&format!("k{}", i), i).unwrap();
        store.set_int(&format!("k{}", i), i * 10).unwrap();
    }

    store.compact().unwrap();
    let keys = store.all_keys().unwrap();
    let size = store.actual_size();
    let sequence = store.sequence_id();

    store.compact().unwrap();

    assert_eq!(store.all_keys().unwrap(), keys);
    assert_eq!(store.actual_size(), size);
    assert_eq!(store.sequence_id(), sequence);
    for i in 0..10 {
        assert_eq!(store.get_int(&format!("k{}", i)).unwrap(), Some(i * 10));
    }
}

#[test]
fn test_store_clear_all() {
    let (_temp, store) = setup_temp_store();
    for i in 0..50 {
        store.set_bytes(&format!("k{}", i), &[0u8; 200]).unwrap();
    }
    assert!(store.total_size() > 4096);

    store.clear_all().unwrap();

    assert_eq!(store.count().unwrap(), 0);
    assert_eq!(store.actual_size(), 0);
    assert_eq!(store.total_size(), 4096);

    store.set_int("after", 1).unwrap();
    assert_eq!(store.get_int("after").unwrap(), Some(1));
}

#[test]
fn test_store_clear_all_persists() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = open_at(&temp_dir);
        store.set_int("k", 1).unwrap();
        store.clear_all().unwrap();
    }

    let store = open_at(&temp_dir);
    assert_eq!(store.count().unwrap(), 0);
}

#[test]
fn test_store_trim_shrinks_file() {
    let (_temp, store) = setup_temp_store();
    for i in 0..40 {
        store.set_bytes(&format!("k{}", i), &[0u8; 400]).unwrap();
    }
    for i in 0..40 {
        store.remove(&format!("k{}", i)).unwrap();
    }
    store.set_int("keep", 1).unwrap();
    store.compact().unwrap();
    let before = store.total_size();

    store.trim().unwrap();

    assert!(store.total_size() <= before);
    assert!(store.total_size() >= store.actual_size());
    assert_eq!(store.get_int("keep").unwrap(), Some(1));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_store_concurrent_readers_see_whole_values() {
    let (_temp, store) = setup_temp_store();
    let old = vec![0xAAu8; 300];
    let new = vec![0xBBu8; 300];
    store.set_bytes("shared", &old).unwrap();

    crossbeam::scope(|s| {
        s.spawn(|_| {
            for i in 0..200 {
                let value = if i % 2 == 0 { &new } else { &old };
                store.set_bytes("shared", value).unwrap();
                store.set_int(&format!("filler{}", i % 7), i).unwrap();
            }
        });

        for _ in 0..4 {
            s.spawn(|_| {
                for _ in 0..200 {
                    let seen = store.get_bytes("shared").unwrap().unwrap();
                    assert!(seen[..] == old[..] || seen[..] == new[..]);
                }
            });
        }
    })
    .unwrap();
}

#[test]
fn test_store_concurrent_writers_serialize() {
    let (_temp, store) = setup_temp_store();

    crossbeam::scope(|s| {
        for t in 0..4 {
            let store = &store;
            s.spawn(move |_| {
                for i in 0..50 {
                    store.set_int(&format!("t{}-{}", t, i), i).unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(store.count().unwrap(), 200);
    assert_eq!(store.get_int("t3-49").unwrap(), Some(49));
}
