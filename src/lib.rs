//! Near-duplicate image detection from perceptual hashes and dense embeddings.

pub mod config;
pub mod core;
pub mod services;
