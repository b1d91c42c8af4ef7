//! Property-based tests for the index and diff laws using proptest.
//!
//! These verify that:
//! 1. Serialization round-trips every index
//! 2. Diffing an index against itself is empty
//! 3. Equal tree hashes imply an empty diff, and vice versa
//! 4. Every diff entry lands in exactly one category

use proptest::prelude::*;
use std::collections::BTreeMap;

use dockform::index::{diff_indexes, parse_index, serialize_index};
use dockform::{FileEntry, Index};

/// Strategy for relative forward-slash paths.
fn path_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec("[a-z][a-z0-9_.-]{0,8}", 1..4).prop_map(|segments| segments.join("/"))
}

/// Strategy for lowercase hex "hashes" (shape only; values are opaque).
fn sha_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{16}"
}

fn entries_strategy() -> impl Strategy<Value = Vec<FileEntry>> {
    proptest::collection::btree_map(path_strategy(), (any::<u32>(), sha_strategy()), 0..20)
        .prop_map(|map: BTreeMap<String, (u32, String)>| {
            map.into_iter()
                .map(|(path, (size, sha256))| FileEntry {
                    path,
                    size: u64::from(size),
                    sha256,
                })
                .collect()
        })
}

fn index_from(files: Vec<FileEntry>) -> Index {
    Index::from_entries("/srv", files)
}

proptest! {
    #[test]
    fn serialize_parse_round_trips(files in entries_strategy()) {
        let index = index_from(files);
        let serialized = serialize_index(&index).unwrap();
        prop_assert_eq!(parse_index(&serialized, "/srv"), index);
    }

    #[test]
    fn self_diff_is_empty(files in entries_strategy()) {
        let index = index_from(files);
        prop_assert!(diff_indexes(&index, &index).is_empty());
    }

    #[test]
    fn equal_tree_hash_iff_empty_diff(a in entries_strategy(), b in entries_strategy()) {
        let left = index_from(a);
        let right = index_from(b);
        let diff = diff_indexes(&left, &right);
        prop_assert_eq!(left.tree_hash == right.tree_hash, diff.is_empty());
    }

    #[test]
    fn diff_partitions_paths(a in entries_strategy(), b in entries_strategy()) {
        let left = index_from(a);
        let right = index_from(b);
        let diff = diff_indexes(&left, &right);

        for entry in &diff.to_create {
            prop_assert!(left.files.iter().any(|f| f.path == entry.path));
            prop_assert!(!right.files.iter().any(|f| f.path == entry.path));
        }
        for entry in &diff.to_update {
            prop_assert!(left.files.iter().any(|f| f.path == entry.path));
            prop_assert!(right.files.iter().any(|f| f.path == entry.path));
        }
        for path in &diff.to_delete {
            prop_assert!(!left.files.iter().any(|f| &f.path == path));
            prop_assert!(right.files.iter().any(|f| &f.path == path));
        }

        // output lists stay sorted
        let created: Vec<&str> = diff.to_create.iter().map(|e| e.path.as_str()).collect();
        let mut resorted = created.clone();
        resorted.sort_unstable();
        prop_assert_eq!(created, resorted);
    }

    #[test]
    fn malformed_remote_always_parses_empty(garbage in "[^{]{0,64}") {
        let parsed = parse_index(&garbage, "/data");
        prop_assert!(parsed.files.is_empty());
        prop_assert_eq!(parsed.target.as_str(), "/data");
    }
}
