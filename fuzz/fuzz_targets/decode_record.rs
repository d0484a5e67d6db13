#![no_main]

use ladder_core::model::codec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let Ok(record) = codec::decode_record("doc", &value) else {
        return;
    };
    assert_eq!(record.id, "doc");

    if let Ok(encoded) = codec::encode_record(&record) {
        let again = codec::decode_record("doc", &encoded);
        assert_eq!(again.ok(), Some(record));
    }
});
