//! Configuration types shared between mdchain crates.

mod mdp;
mod params;
mod types;

pub use mdp::*;
pub use params::*;
pub use types::*;
