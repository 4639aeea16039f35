//! Core of bagpool, the async connection pool.
//!
//! Not intended to be used directly; depend on the `bagpool` facade crate instead.
#![warn(future_incompatible, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
pub mod logger;

pub mod bag;
pub mod connection;
pub mod error;
pub mod isolation_level;
pub mod pool;
pub mod rt;

pub use error::{Error, Result};
