#![cfg_attr(not(feature = "std"), no_std)]
mod block;
pub mod resnet;

#[cfg(feature = "pretrained")]
pub mod error;
#[cfg(feature = "pretrained")]
pub mod weights;

pub use resnet::*;

#[cfg(feature = "pretrained")]
pub use error::*;
#[cfg(feature = "pretrained")]
pub use weights::*;

extern crate alloc;
