//! A cooperative fiber runtime.
//!
//! This crate re-exports [`strand_core`], which describes programs as
//! effects and interprets them on fibers. With the `reactor` feature enabled
//! (the default), [`reactor`] executes those fibers on a pool of worker
//! threads.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use strand_core::*;

#[cfg(feature = "reactor")]
pub use strand_reactor as reactor;
