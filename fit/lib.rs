#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod cache;
pub mod config;
pub mod engine;
pub mod gibbs;
pub mod gig;
pub mod mvn;
pub mod progress;
pub mod ridge;
pub mod types;
pub mod weights;

#[path = "../region/mod.rs"]
pub mod region;

pub use config::{EngineConfig, GibbsConfig, RidgeConfig};
pub use engine::{EngineFit, FitSummary, FittedWeights, GroupedWeights, fit_grouped, fit_weights};
pub use types::FitError;
