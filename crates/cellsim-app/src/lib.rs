//! Runner plumbing for the cellsim headless binary.

pub mod demo;
pub mod settings;

pub use demo::{GrowDivide, seed_population};
pub use settings::{ENV_PREFIX, env_overrides, load_config, parse_override};
