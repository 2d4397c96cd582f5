//! CLI module
//!
//! Command-line front end: argument parsing and snapshot rendering.

pub mod args;
pub mod progress;

pub use args::CliArgs;
pub use progress::ProgressDisplay;
