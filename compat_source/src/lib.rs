//! Bit-exact decoders for Source engine level (VBSP) and texture (VTF) data.
//!
//! Everything here works on borrowed byte slices and never panics on
//! malformed input; callers decide where the bytes live.
#![forbid(unsafe_code)]

mod bytes;

pub mod dxt;
pub mod entities;
pub mod vbsp;
pub mod vtf;
