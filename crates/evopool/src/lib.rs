//! Support code for the `evopool` binary.
//!
//! - [`simulate`]: seeded stand-in executor and voter for exercising an
//!   engine without a model backend
//! - [`report`]: plain-text rendering of pool, graveyard and budget state

pub mod report;
pub mod simulate;
