//! Subscriber-facing side of the pipeline.

pub mod broadcast;

pub use broadcast::AlertServer;
