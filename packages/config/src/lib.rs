// ABOUTME: Configuration constants shared by every Corral crate
// ABOUTME: Re-exports environment variable names so settings readers agree on spelling

pub mod constants;

pub use constants::*;
