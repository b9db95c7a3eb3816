pub mod builtin;
pub mod cli;
pub mod error;
pub mod eval;
pub mod global;
pub mod logging;
pub mod parser;
pub mod pidset;
pub mod reap;
pub mod registry;
pub mod types;

pub use crate::builtin::Flow;
pub use crate::global::State;
