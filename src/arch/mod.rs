//! Platform seams for session launching: program discovery and per-user paths.

pub mod paths;
pub mod shell;
pub mod tsh;
