//! conv-driver: parallel execution driver for tiled convolution kernels.
//!
//! The per-tile arithmetic lives behind an opaque [`TileKernel`] callable;
//! this crate decides which tile each worker thread computes, in what
//! order, and with which addresses:
//!
//! - **Balanced partitioning**: every thread derives its contiguous work
//!   range independently from `(total, nthr, ithr)` — no communication,
//!   no shared scheduler state.
//! - **One-stage software pipeline**: each spatial-row step commits the
//!   previously computed prefetch address set, computes the next row's
//!   set (including padding-aware height clipping), then invokes the
//!   kernel — the next tile's parameters are ready before the current
//!   tile's kernel returns.
//! - **Lock-free weight-gradient reduction**: thread-private partial
//!   accumulators over batch sub-ranges, merged into disjoint slices of
//!   the shared gradient after a barrier.
//!
//! Buffers are opaque regions reached through externally supplied
//! blocked-offset functions ([`TensorLayout`], [`WeightsLayout`]); the
//! drivers only ever ask for offsets and offset deltas, never inspect the
//! blocking scheme.
//!
//! # Quick start
//!
//! ```ignore
//! use conv_driver::{execute_forward, ConvLayouts};
//!
//! execute_forward(&desc, &layouts, &src, &weights, None, &mut dst, &kernel)?;
//! ```

pub mod balance;
pub mod backward_weights;
pub mod desc;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod reduce;
pub mod reference;

pub use backward_weights::execute_backward_weights;
pub use desc::{ConvDesc, LoopOrder, SIMD_W};
pub use driver::{execute_backward_data, execute_forward, ConvLayouts};
pub use error::ConvError;
pub use kernel::{TileCallArgs, TileKernel};
pub use layout::{BlockedActivations, BlockedWeights, TensorLayout, WeightsLayout};
pub use reduce::{ReduceBalancer, ReduceScratch};
