//! Pure building blocks of a benchmark run.
//!
//! Nothing here touches a session, the model, or the filesystem; every
//! function maps values to values so it can be checked without doubles.

pub mod actions;
pub mod grouping;
pub mod predicate;
pub mod rule;
pub mod types;
pub mod window;
