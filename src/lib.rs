//! Build/CI orchestration core: compiles a repository commit into a CI plan,
//! runs it through a pluggable executor, records build and task state in the
//! server's record store, and reaps builds whose worker died.

pub mod auth;
pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod exec;
pub mod plan;
pub mod reaper;
pub mod shutdown;
pub mod store;
pub mod tracker;
pub mod worker;

pub use error::{Error, Result};
