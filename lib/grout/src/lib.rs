//! Ambient support shared by the `mortar` and `keystone` crates: logger
//! construction, wall-clock helpers and small encoding utilities.

pub mod encoding;
pub mod logging;
pub mod time;
