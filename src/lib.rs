#![doc = include_str!("../README.md")]

pub use anvil_exec as exec;
pub use anvil_utils as utils;
