#![doc = include_str!("../README.md")]

mod admission;
mod error;
mod limiter;
mod pool;

pub use crate::admission::*;
pub use crate::error::*;
pub use crate::limiter::*;
pub use crate::pool::*;
