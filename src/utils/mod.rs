//! Small shared helpers.

pub mod duration;
