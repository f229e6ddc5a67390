//! Stable exit codes for the `bench` CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input (config, plan, corpus path) or any other error.
pub const INVALID: i32 = 1;
/// A session failed to open or close and the batch was aborted.
pub const SESSION: i32 = 2;
