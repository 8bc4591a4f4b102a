//! Drive the IESopt optimization engine from Rust.
//!
//! The engine lives in a foreign (Julia) runtime. [`bridge`] owns the handle
//! to it, [`interop`] layers logged evaluation and type queries on top, and
//! [`model`] sequences generation and optimization. [`run`] does the whole
//! thing in one call.

pub mod banner;
pub mod bridge;
pub mod config;
pub mod consts;
pub mod interop;
pub mod model;
pub mod pipeline;
pub mod scaffold;
pub mod spinner;

pub use bridge::{EngineHandle, ForeignValue};
pub use interop::Symbol;
pub use model::{Model, ModelError, ModelOptions, ModelStatus, Verbosity};
pub use pipeline::run;
