//! The particle inference engine.
//!
//! This module provides:
//! - **graph**: the directed graphical model and its builder
//! - **schedule**: node sampling schedule and value lifetimes
//! - **node_sampler**: per-step sampling strategies (prior, conjugate, finite)
//! - **forward**: the particle filter
//! - **backward**: the backward smoother
//! - **monitor**: weighted population snapshots

pub mod backward;
pub mod config;
pub mod conjugate;
pub mod distributions;
pub mod errors;
pub mod finite;
pub mod forward;
pub mod graph;
pub mod monitor;
pub mod node_sampler;
pub mod numeric;
pub mod particle;
pub mod resampler;
pub mod schedule;
pub mod value;
pub mod weights;
