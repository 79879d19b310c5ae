//! Signal detection: template scoring and debouncing.
//!
//! This module provides:
//! - Region/template types and the template slot (`template`)
//! - Frame scoring backends (`scorer`)
//! - Raw signal to edge conversion (`debouncer`)

pub mod debouncer;
pub mod scorer;
pub mod template;

pub use debouncer::{DebounceConfig, Edge, SignalDebouncer};
pub use scorer::{scorer_for, DetectionBackend, MatchResult, MatchScorer};
pub use template::{DeathTemplate, RegionOfInterest, Template, TemplateSlot};
