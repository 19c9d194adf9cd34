//! Core crate for the kinetoscope action-classification pipeline.

pub mod catalog;
pub mod config;
pub mod decode;
pub mod encode;
pub mod infer;
pub mod logging;
pub mod model_registry;
pub mod pipeline;
pub mod predictor;
pub mod render;
pub mod topk;
