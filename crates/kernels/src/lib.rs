//! Shared operator vocabulary and external toolchain contracts for Tilesmith.

pub mod backend;
pub mod config;
pub mod utils;

pub use backend::*;
pub use config::*;
pub use utils::*;
