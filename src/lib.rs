// lib.rs
pub mod alignment;
pub mod annotation;
pub mod config;
pub mod error;
pub mod hardware;
pub mod model;
pub mod pipeline;
pub mod selectivity;
pub mod sequence;
pub mod sparse;
pub mod stages;
pub mod stats;
pub mod tree;

pub use error::{MsaError, Result};
pub use pipeline::{MsaPipeline, PipelineOutput};
