#![doc = include_str!("../README.md")]

// -----------------------------------------------------------------------------
// Modules

mod once_flag;

pub mod hash;

// -----------------------------------------------------------------------------
// Top-level exports

pub use once_flag::OnceFlag;
