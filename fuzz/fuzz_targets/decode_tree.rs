#![no_main]

use chrono::{TimeZone, Utc};
use ladder_core::model::codec;
use ladder_core::tree;
use libfuzzer_sys::fuzz_target;

// Any stored blob decodes without panicking into a well-shaped tree.
fuzz_target!(|data: &[u8]| {
    let Ok(blob) = std::str::from_utf8(data) else {
        return;
    };
    let Some(now) = Utc.timestamp_opt(1_700_000_000, 0).single() else {
        return;
    };

    let forest = codec::decode_tree(blob, now);
    assert!(tree::check_shape(&forest).is_empty());

    let history = codec::decode_history(blob, now);
    for snapshot in &history {
        assert!(tree::check_shape(snapshot).is_empty());
    }

    if let Ok(encoded) = codec::encode_tree(&forest) {
        assert_eq!(codec::decode_tree(&encoded, now), forest);
    }
});
