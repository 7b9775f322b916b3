//! Scheduler and grid configuration.

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Static configuration consumed when a scheduler is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Clamp positions into `[min_bound, max_bound)` every iteration.
    pub bound_space: bool,
    /// Lower domain bound on every axis.
    pub min_bound: f64,
    /// Upper domain bound on every axis.
    pub max_bound: f64,
    /// Lock neighborhoods while an object executes.
    pub neighbor_guard: bool,
    /// Worker threads; `None` uses one per available core.
    pub num_threads: Option<usize>,
    /// Longest displacement applied to one object per iteration.
    pub max_displacement: f64,
    /// Lower limit on the grid box side length.
    pub min_box_length: f64,
    /// Number of iteration summaries retained by the scheduler.
    pub history_capacity: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            bound_space: false,
            min_bound: 0.0,
            max_bound: 100.0,
            neighbor_guard: true,
            num_threads: None,
            max_displacement: 3.0,
            min_box_length: 1.0,
            history_capacity: 256,
        }
    }
}

impl SimulationConfig {
    /// Names accepted by [`Self::set`].
    pub const KEYS: [&'static str; 8] = [
        "bound_space",
        "min_bound",
        "max_bound",
        "neighbor_guard",
        "num_threads",
        "max_displacement",
        "min_box_length",
        "history_capacity",
    ];

    /// Check the configuration for values the kernel cannot work with.
    pub fn validate(&self) -> SimResult<()> {
        if !self.min_bound.is_finite() || !self.max_bound.is_finite() {
            return Err(SimError::InvalidConfig("domain bounds must be finite"));
        }
        if self.min_bound >= self.max_bound {
            return Err(SimError::InvalidConfig(
                "min_bound must be smaller than max_bound",
            ));
        }
        if !(self.max_displacement > 0.0) || !self.max_displacement.is_finite() {
            return Err(SimError::InvalidConfig(
                "max_displacement must be positive and finite",
            ));
        }
        if !(self.min_box_length > 0.0) || !self.min_box_length.is_finite() {
            return Err(SimError::InvalidConfig(
                "min_box_length must be positive and finite",
            ));
        }
        if self.num_threads == Some(0) {
            return Err(SimError::InvalidConfig("num_threads must be non-zero"));
        }
        if self.history_capacity == 0 {
            return Err(SimError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Apply a textual override such as `("max_bound", "250")`.
    ///
    /// `num_threads` also accepts `auto`. The result is not validated; call
    /// [`Self::validate`] once all overrides are in.
    pub fn set(&mut self, key: &str, value: &str) -> SimResult<()> {
        let value = value.trim();
        match key {
            "bound_space" => {
                self.bound_space = parse_bool(value, "bound_space expects true or false")?;
            }
            "neighbor_guard" => {
                self.neighbor_guard = parse_bool(value, "neighbor_guard expects true or false")?;
            }
            "min_bound" => self.min_bound = parse(value, "min_bound expects a number")?,
            "max_bound" => self.max_bound = parse(value, "max_bound expects a number")?,
            "max_displacement" => {
                self.max_displacement = parse(value, "max_displacement expects a number")?;
            }
            "min_box_length" => {
                self.min_box_length = parse(value, "min_box_length expects a number")?;
            }
            "num_threads" => {
                self.num_threads = if value.eq_ignore_ascii_case("auto") {
                    None
                } else {
                    Some(parse(value, "num_threads expects a count or `auto`")?)
                };
            }
            "history_capacity" => {
                self.history_capacity = parse(value, "history_capacity expects a count")?;
            }
            _ => return Err(SimError::UnknownConfigKey(key.to_owned())),
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(value: &str, message: &'static str) -> SimResult<T> {
    value.parse().map_err(|_| SimError::InvalidConfig(message))
}

fn parse_bool(value: &str, message: &'static str) -> SimResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(SimError::InvalidConfig(message)),
    }
}
