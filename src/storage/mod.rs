//! Storage driver: zvol and snapshot lifecycle backed by the `zfs`/`zpool`
//! CLI tools.

pub mod driver;
pub mod exorcism;

pub use driver::{Driver, ZfsCliDriver};
