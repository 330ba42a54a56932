//! CLI command implementations.

pub mod check;
pub mod decode;
pub mod record;
