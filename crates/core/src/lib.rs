//! Core library: normalization, embeddings, indexing, clustering,
//! classification and reconciliation of the source registry.

pub mod classifier;
pub mod cluster;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod query;
pub mod reconciler;
pub mod reducer;
pub mod registry;
pub mod rules;
pub mod vectorstore;

pub use error::{EnrichError, ErrorClass};
