use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use stockform_engine::{AnomalyThresholds, RecalcOptions};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Config {
    pub recalc: RecalcOptions,
    pub thresholds: AnomalyThresholds,
}

fn setting<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        _ => Ok(default),
    }
}

impl Config {
    /// Read settings from the process environment (after `.env` is loaded).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();
        let config = Config {
            recalc: RecalcOptions {
                max_iterations: setting(
                    &lookup,
                    "STOCKFORM_MAX_ITERATIONS",
                    defaults.recalc.max_iterations,
                )?,
                precision: setting(&lookup, "STOCKFORM_PRECISION", defaults.recalc.precision)?,
            },
            thresholds: AnomalyThresholds {
                overcount_margin: setting(
                    &lookup,
                    "STOCKFORM_OVERCOUNT_MARGIN",
                    defaults.thresholds.overcount_margin,
                )?,
                depletion_ratio: setting(
                    &lookup,
                    "STOCKFORM_DEPLETION_RATIO",
                    defaults.thresholds.depletion_ratio,
                )?,
            },
        };

        if config.recalc.max_iterations == 0 {
            bail!("STOCKFORM_MAX_ITERATIONS must be at least 1");
        }
        for (key, value) in [
            ("STOCKFORM_OVERCOUNT_MARGIN", config.thresholds.overcount_margin),
            ("STOCKFORM_DEPLETION_RATIO", config.thresholds.depletion_ratio),
        ] {
            if !value.is_finite() || value <= 0.0 {
                bail!("{key} must be a positive number, got {value}");
            }
        }

        Ok(config)
    }
}
