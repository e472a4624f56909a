#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Regularized model stacking.
//!
//! Candidates contribute held-out predictions over one shared resampling
//! partition ([`registry`]), a sparse elastic-net blend picks the members
//! ([`solver`], [`blend`]), the members are refit on the full training set
//! ([`refit`]) and the fitted ensemble predicts new rows ([`predict`]).

pub mod blend;
pub mod candidate;
pub mod config;
pub mod data;
pub mod family;
pub mod parallel;
pub mod partition;
pub mod predict;
pub mod refit;
pub mod registry;
pub mod resample;
pub mod solver;

// Built-in candidate model specifications live beside the engine.
#[path = "../models/mod.rs"]
pub mod models;
