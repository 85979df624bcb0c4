//! Usage prediction and the per-batch prefetch orchestrator

pub mod orchestrator;
pub mod predictor;

pub use orchestrator::{BatchOutcome, PrefetchDecision, PrefetchOrchestrator};
pub use predictor::UsagePredictor;
