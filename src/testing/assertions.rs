//! Assertion helpers for dispatched flow batches.

use super::builders::packet_tag;
use crate::manager::FlowBatch;

/// Collect the test tags of every packet in `batch`, in order.
fn tags_of(batch: &FlowBatch) -> Vec<u8> {
    batch.batch.iter().map(packet_tag).collect()
}

/// Assert the emitted batches carry exactly these per-batch tag runs, in
/// emission order.
///
/// # Panics
///
/// Panics with a diff-style message on mismatch.
pub fn assert_flow_runs(batches: &[FlowBatch], expected: &[&[u8]]) {
    let actual: Vec<Vec<u8>> = batches.iter().map(tags_of).collect();
    let expected: Vec<Vec<u8>> = expected.iter().map(|r| r.to_vec()).collect();
    assert_eq!(
        actual, expected,
        "flow runs mismatch:\n  actual:   {actual:?}\n  expected: {expected:?}"
    );
}

/// Assert one batch carries exactly these tags.
///
/// # Panics
///
/// Panics on mismatch.
pub fn assert_batch_tags(batch: &FlowBatch, expected: &[u8]) {
    let actual = tags_of(batch);
    assert_eq!(
        actual, expected,
        "batch tag mismatch:\n  actual:   {actual:?}\n  expected: {expected:?}"
    );
}

/// Assert the concatenation of all emitted batches preserves the input
/// order exactly (the simple dispatcher's guarantee).
///
/// # Panics
///
/// Panics on mismatch.
pub fn assert_concatenation_in_order(batches: &[FlowBatch], input_tags: &[u8]) {
    let concat: Vec<u8> = batches.iter().flat_map(|b| tags_of(b)).collect();
    assert_eq!(
        concat, input_tags,
        "concatenated output diverges from input order"
    );
}

/// Assert the emitted packets are a permutation of the input and that
/// each batch keeps its packets in input-relative order (the builder
/// dispatcher's guarantee).
///
/// # Panics
///
/// Panics when packets were lost, duplicated, or reordered within a flow.
pub fn assert_permutation_of(batches: &[FlowBatch], input_tags: &[u8]) {
    let mut concat: Vec<u8> = batches.iter().flat_map(|b| tags_of(b)).collect();
    let mut expected = input_tags.to_vec();
    for b in batches {
        let tags = tags_of(b);
        let mut positions = Vec::new();
        for tag in &tags {
            let pos = input_tags
                .iter()
                .position(|t| t == tag)
                .unwrap_or_else(|| panic!("tag {tag} was never part of the input"));
            positions.push(pos);
        }
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(
            positions, sorted,
            "intra-flow order broken in batch {tags:?}"
        );
    }
    concat.sort_unstable();
    expected.sort_unstable();
    assert_eq!(concat, expected, "output is not a permutation of the input");
}
