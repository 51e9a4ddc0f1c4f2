//! Tilesmith tuner facade: external tool adapters, sessions and reports.

#[cfg(feature = "cli")]
pub mod cli;
pub mod pipeline;
pub mod report;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use pipeline::*;
pub use report::*;
pub use session::*;
