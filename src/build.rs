//! The content-addressed build layer: header (de)serialization plus the
//! `Build` reader that composes a header with a `Store` of per-build
//! readers.

pub mod header;
pub mod reader;

pub use header::*;
pub use reader::*;
