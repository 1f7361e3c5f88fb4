//! Pipeline module - stage controller, per-sweep stages, scaling and driver.

mod driver;
#[cfg(test)]
mod mock;
mod scaling;
mod stage;
mod sweep;

pub use driver::*;
pub use scaling::*;
pub use stage::*;
pub use sweep::*;
