//! Synthetic training runs.
//!
//! Both simulations draw every random number from an injected [`rand::Rng`], so a
//! seeded generator reproduces a run exactly.

pub mod launch;
pub mod quickstart;

pub use launch::LaunchParams;
pub use quickstart::QuickstartParams;
