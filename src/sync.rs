//! Switches the atomics between their std and loom Versions, depending on
//! whether the crate is compiled with `--cfg loom` for model-checking

#[cfg(loom)]
pub(crate) use loom::sync::atomic;

#[cfg(not(loom))]
pub(crate) use std::sync::atomic;
