//! Testing utilities for classification pipelines.
//!
//! This module helps write idiomatic tests against the engine:
//!
//! - **Builders**: synthesize Ethernet/IPv4/TCP packets and batches
//!   without hand-rolling byte arrays ([`PacketBuilder`],
//!   [`BatchBuilder`]).
//! - **Assertions**: compare dispatched [`FlowBatch`]es against expected
//!   flow runs and orderings.
//! - **Fixtures**: canonical rule sets and traffic mixes.
//!
//! # Quick start
//!
//! ```
//! use flowctx::testing::*;
//!
//! let p = PacketBuilder::new()
//!     .ethernet(0x0800)
//!     .ipv4(6, "10.0.0.1", "10.0.0.2")
//!     .ports(1234, 80)
//!     .tag(7)
//!     .build();
//! assert_eq!(packet_tag(&p), 7);
//! ```
//!
//! [`FlowBatch`]: crate::manager::FlowBatch

mod assertions;
mod builders;
mod fixtures;

pub use assertions::{
    assert_batch_tags, assert_concatenation_in_order, assert_flow_runs, assert_permutation_of,
};
pub use builders::{BatchBuilder, PacketBuilder, packet_tag};
pub use fixtures::{ether_classify_rules, flow_mix_batch, http_or_else_rules};
