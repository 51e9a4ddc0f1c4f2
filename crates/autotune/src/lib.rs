//! Autotuning execution engine for Tilesmith.
//!
//! A [`KernelRunner`] scores a batch of [`Configuration`]s by compiling and
//! launching each one in its own execution unit and returns one [`Score`]
//! per configuration, in input order.

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod device;
pub mod executor;
pub mod isolation;
pub mod results;
pub mod runner;
pub mod score;
pub mod space;
pub mod worker;

pub use cache::*;
pub use config::*;
pub use device::*;
pub use executor::*;
pub use isolation::{Isolation, ProcessIsolation};
pub use results::*;
pub use runner::*;
pub use score::*;
pub use space::*;
pub use worker::*;
