//! Canonical rule sets and traffic mixes used across the test suite.

use super::builders::{BatchBuilder, PacketBuilder};
use crate::packet::PacketBatch;

/// The classic EtherType classifier: IPv4 to output 0, ARP to output 1,
/// everything else to output 2.
#[must_use]
pub fn ether_classify_rules() -> Vec<&'static str> {
    vec!["12/0800 0", "12/0806 1", "- 2"]
}

/// HTTP responses (IPv4, TCP, source port 80) to output 0, everything
/// else to output 1.
#[must_use]
pub fn http_or_else_rules() -> Vec<&'static str> {
    vec!["12/0800 && 23/06 src port 80 0", "- 1"]
}

/// A batch of eight IPv4/TCP packets over four flows in the pattern
/// `[A, B, A, A, C, B, A, D]`, where the flow is decided by the
/// destination port (A=1000, B=1001, C=1002, D=1003). Packets carry
/// unique tags 0..8 in input order.
#[must_use]
pub fn flow_mix_batch() -> PacketBatch {
    let pattern: [u16; 8] = [1000, 1001, 1000, 1000, 1002, 1001, 1000, 1003];
    let mut builder = BatchBuilder::new();
    for (i, dport) in pattern.iter().enumerate() {
        builder = builder.add(
            PacketBuilder::new()
                .ethernet(0x0800)
                .ipv4(6, "192.168.0.1", "192.168.0.2")
                .ports(4000, *dport)
                .tag(i as u8)
                .build(),
        );
    }
    builder.build()
}
