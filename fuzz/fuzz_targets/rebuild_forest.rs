#![no_main]

use chrono::{TimeZone, Utc};
use ladder_core::model::codec;
use ladder_core::tree;
use libfuzzer_sys::fuzz_target;

// A JSON array of flat documents, as a remote snapshot would deliver them.
fuzz_target!(|data: &[u8]| {
    let Ok(serde_json::Value::Array(docs)) = serde_json::from_slice(data) else {
        return;
    };
    let Some(now) = Utc.timestamp_opt(1_700_000_000, 0).single() else {
        return;
    };

    let records: Vec<_> = docs
        .iter()
        .enumerate()
        .filter_map(|(index, doc)| codec::decode_record(&format!("d{index}"), doc).ok())
        .collect();
    let expected = records.len();
    let forest = tree::build_forest(records, now);

    assert_eq!(tree::count(&forest), expected);
    assert_eq!(tree::all_ids(&forest).len(), expected);
});
