//! Generation-task orchestrator for a ComfyUI backend.
//!
//! Callers create tasks through [`registry::TaskRegistry`], then poll
//! status, event lines and the final artifact. Each task drives one
//! remote job through [`normalizer::ProgressNormalizer`].

pub mod config;
pub mod error;
pub mod normalizer;
pub mod prompt;
pub mod recipe;
pub mod registry;
pub mod task;
