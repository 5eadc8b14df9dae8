//! Binary encoding primitives shared by the skein engine and its wire format.
//!
//! The update format is built almost entirely out of three building blocks:
//! variable-length integers, length-prefixed byte buffers and UTF-8 strings.
//! This crate provides cursor-based [decoding::Read] / [encoding::Write]
//! traits over those blocks, plus [any::Any] - a JSON-superset value used for
//! user-supplied cells, embeds and formatting attributes.

pub mod any;
pub mod binary;
pub mod decoding;
pub mod encoding;
pub mod error;
pub mod number;

pub use crate::any::Any;
