//! # Flowctx
//!
//! A **flow-context packet classification engine** for Rust. Flowctx
//! turns per-element classification rules into a single decision tree
//! whose leaves own per-flow state (flow control blocks, FCBs), then
//! classifies packet batches against that tree, re-forms batches per
//! flow, and dispatches them — the core machinery of a modular
//! packet-processing pipeline.
//!
//! ## Key pieces
//!
//! - **Rule parser** — a compact textual grammar (`"12/0800 0"`,
//!   `"ip proto tcp && src port 80 1"`, `"- drop"`) parsed into
//!   single-path trees
//! - **Tree algebra** — combine (child/else), prune, duplicate and
//!   replace-leaves operations that merge many elements' rules into one
//!   tree while guarding per-flow payload against conflicting writers
//! - **Optimiser** — collapses useless levels, picks the cheapest child
//!   container per node (two-case, three-case, hash classes, dense
//!   arrays) and splices a per-thread fan-out above shared dynamic state
//! - **Context manager** — the runtime driver: aggregate→FCB cache,
//!   order-preserving *simple* dispatch or flow-compacting *builder*
//!   dispatch, timeout reaping, release-up-the-tree
//! - **Rewriter table** — per-core flow maps with two-heap expiry
//!   (guarantee / best-effort) and cross-core migration, for NAT-style
//!   elements
//! - **Offload bridge** — exports the static tree prefix as NIC flow
//!   patterns with mark-based fast-path re-entry
//!
//! ## Quick start
//!
//! ```
//! use flowctx::*;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! // One element classifying EtherTypes into three outputs.
//! let dispatcher = Dispatcher::new("classifier", 3, &[
//!     "12/0800 0",
//!     "12/0806 1",
//!     "- 2",
//! ]);
//!
//! let mut manager = ContextManager::new(dispatcher, ContextConfig::default())?;
//! manager.initialize(&ThreadSet::single(0, 1), Timestamp::recent())?;
//!
//! // Classify a batch; every emitted batch shares one flow.
//! let batch = testing::PacketBuilder::new().ethernet(0x0800).tag(0).build();
//! let out = manager.process(
//!     packet::PacketBatch::start_head(batch),
//!     0,
//!     Timestamp::recent(),
//! );
//! assert_eq!(out.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Dispatch modes
//!
//! The **simple** dispatcher preserves global packet order and cuts an
//! output batch whenever the FCB changes. The **builder** dispatcher
//! reorders packets into contiguous same-flow runs through a 16-slot
//! ring of pending sub-batches; cross-flow order is not preserved, but
//! each flow keeps its own order and downstream elements see longer
//! runs per flow.
//!
//! ## Dynamic flows
//!
//! A rule class with a mask and no value (`"40/0/FFFF"`, `"agg"`) builds
//! a *dynamic* node: its children are learned at packet time by
//! duplicating the node's prototype subtree, and released by timeout or
//! explicit release. The optimiser gives every CPU a private copy of
//! each dynamic subtree, so the packet path runs without locks.
//!
//! ## Module overview
//!
//! - [`parser`] — rule grammar
//! - [`dispatcher`] — per-element rule lists, output numbering, child
//!   tables
//! - [`tree`] — the arena, algebra and optimiser
//! - [`level`], [`node`], [`fcb`], [`pool`] — the data model
//! - [`manager`] — the runtime driver
//! - [`cache`] — aggregate→FCB cache
//! - [`rewriter`] — per-core rewriter flow table
//! - [`offload`] — NIC pattern export (feature `offload`)
//! - [`metrics`] — counter export (feature `metrics`)
//! - [`testing`] — packet builders, assertions and fixtures

pub mod cache;
pub mod dispatcher;
pub mod fcb;
pub mod level;
pub mod manager;
pub mod node;
pub mod packet;
pub mod parser;
pub mod pool;
pub mod rewriter;
pub mod testing;
pub mod tree;
pub mod utils;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "offload")]
pub mod offload;

// General re-exports
pub use dispatcher::Dispatcher;
pub use fcb::{FcbId, FlowControlBlock};
pub use level::FlowLevel;
pub use manager::{BUILDER_RING_SIZE, ContextConfig, ContextManager, Counters, FlowBatch};
pub use node::{Edge, EdgeTarget, FlowNode, NodeId};
pub use packet::{Packet, PacketBatch};
pub use parser::{ParseContext, Rule};
pub use pool::FcbPool;
pub use rewriter::{FlowId, InputSpec, Rewriter};
pub use tree::Tree;
pub use utils::{ThreadSet, Timestamp};
