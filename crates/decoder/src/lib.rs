//! `rk-decoder`: Decoder engines for the rkplay pipeline.
//!
//! # Module Overview
//!
//! - [`mpp`]: Rockchip MPP hardware decoder (RK3399, RK3568, RK3588 ...)
//! - [`sim`]: Deterministic in-process engine that follows the same
//!   packet/event protocol. Used by the pipeline tests and `rkplay --dry-run`.

pub mod mpp;
pub mod sim;

pub use mpp::{MppLibrary, MppLoadError, MppPicture, MppSession};
pub use sim::{SimDecoder, SimDecoderConfig, SimDecoderStats, SimPicture};
