#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs, unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]
//! This crate provides a set of Lock-Free Pool-Allocators with Thread-Local
//! Caching
//!
//! # Overview
//! Both Pools share the same basic architecture: raw memory is obtained from
//! the System in large Chunks, every Chunk is carved into equally sized
//! Blocks and all the Blocks of one Size are linked into a global lock-free
//! Free-List. Every Thread additionally keeps a small bounded Cache of
//! Blocks per Pool it touched, which is refilled from and drained back to
//! the global Free-List in Batches to keep the number of atomic operations
//! low.
//!
//! * [`object_pool::ObjectPool`]: a Pool for a single Object-Type, handing
//!   out fully constructed Objects through an owning [`object_pool::PoolBox`]
//! * [`multi_pool::MultiPool`]: a Pool that segregates raw byte requests
//!   into a fixed set of Size-Classes and falls back to the System-Allocator
//!   for everything above the largest Class
//!
//! # Feature-Flags
//! * `object_pool`: Enables the fixed-size Object-Pool
//! * `multi_pool`: Enables the segregated Multi-Size-Pool
//! * `full`: Enables all the Feature-Flags

#[cfg(feature = "multi_pool")]
#[cfg_attr(docsrs, doc(cfg(feature = "multi_pool")))]
pub mod multi_pool;
#[cfg(feature = "object_pool")]
#[cfg_attr(docsrs, doc(cfg(feature = "object_pool")))]
pub mod object_pool;
pub mod stack;

#[cfg(any(feature = "object_pool", feature = "multi_pool"))]
pub(crate) mod align;
#[cfg(any(feature = "object_pool", feature = "multi_pool"))]
pub(crate) mod cache;
#[cfg(any(feature = "object_pool", feature = "multi_pool"))]
pub(crate) mod chunk;
#[cfg(any(feature = "object_pool", feature = "multi_pool"))]
pub(crate) mod freelist;
#[cfg(any(feature = "object_pool", feature = "multi_pool"))]
pub(crate) mod handoff;
#[cfg(any(feature = "object_pool", feature = "multi_pool"))]
pub(crate) mod thread_storage;

pub(crate) mod sync;
