//! Small helpers shared across modules

pub mod resource;
pub mod time;
