//! Property tests for the delta codec

use proptest::prelude::*;
use revstore_core::delta::{diff, patch};

/// Derive a new buffer from `old` by splicing in edits
fn edited(old: &[u8], edits: &[(usize, usize, Vec<u8>)]) -> Vec<u8> {
    let mut new = old.to_vec();
    for (at, remove, insert) in edits {
        let at = if new.is_empty() { 0 } else { at % (new.len() + 1) };
        let end = (at + remove).min(new.len());
        new.splice(at..end, insert.iter().copied());
    }
    new
}

proptest! {
    #[test]
    fn prop_unrelated_buffers_round_trip(
        old in proptest::collection::vec(any::<u8>(), 0..2048),
        new in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        let script = diff(&old, &new);
        prop_assert_eq!(patch(&old, &script).unwrap(), new);
    }

    #[test]
    fn prop_edited_buffers_round_trip(
        old in proptest::collection::vec(any::<u8>(), 0..4096),
        edits in proptest::collection::vec(
            (any::<usize>(), 0usize..64, proptest::collection::vec(any::<u8>(), 0..64)),
            0..8,
        ),
    ) {
        let new = edited(&old, &edits);
        let script = diff(&old, &new);
        prop_assert_eq!(patch(&old, &script).unwrap(), new);
    }

    #[test]
    fn prop_low_entropy_round_trip(
        len in 0usize..8192,
        fill in any::<u8>(),
        edits in proptest::collection::vec(
            (any::<usize>(), 0usize..16, proptest::collection::vec(0u8..2, 0..16)),
            0..4,
        ),
    ) {
        let old = vec![fill; len];
        let new = edited(&old, &edits);
        let script = diff(&old, &new);
        prop_assert_eq!(patch(&old, &script).unwrap(), new);
    }

    #[test]
    fn prop_patch_never_panics(
        old in proptest::collection::vec(any::<u8>(), 0..256),
        script in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let _ = patch(&old, &script);
    }
}
