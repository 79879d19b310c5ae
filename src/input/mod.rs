//! Keyboard input for the map signal.

pub mod keyhold;

pub use keyhold::{parse_key_name, spawn_key_listener};
