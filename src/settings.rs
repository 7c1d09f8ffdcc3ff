use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::pacing::{RetryPolicy, Window};

const CONFIG_FILE: &str = "course_grades";

pub const DEFAULT_ENDPOINT: &str = "https://www.reg.uci.edu/perl/WebSoc";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.1; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.88 Safari/537.36 Edg/79.0.309.56";

/// Runtime settings: defaults, then `course_grades.toml` if present, then `GRADES_*` env vars.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub endpoint: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub row_pause_min_secs: f64,
    pub row_pause_max_secs: f64,
    pub session_pause_min_secs: f64,
    pub session_pause_max_secs: f64,
    /// Lookups per row within one run; only transient failures are retried.
    pub max_attempts_per_run: u32,
    pub failure_log: PathBuf,
    pub db_path: PathBuf,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let settings = Config::builder()
            .set_default("endpoint", DEFAULT_ENDPOINT)?
            .set_default("user_agent", DEFAULT_USER_AGENT)?
            .set_default("timeout_secs", 30)?
            .set_default("row_pause_min_secs", 5.0)?
            .set_default("row_pause_max_secs", 9.0)?
            .set_default("session_pause_min_secs", 1.0)?
            .set_default("session_pause_max_secs", 2.0)?
            .set_default("max_attempts_per_run", 1)?
            .set_default("failure_log", "data/failures.jsonl")?
            .set_default("db_path", "data/grades.sqlite")?
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix("GRADES"))
            .build()
            .context("Failed to build settings")?;
        settings
            .try_deserialize()
            .context("Failed to deserialize settings")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        if self.max_attempts_per_run == 0 {
            bail!("max_attempts_per_run must be at least 1");
        }
        Ok(RetryPolicy {
            max_attempts_per_run: self.max_attempts_per_run,
            row_pause: Window::from_secs(self.row_pause_min_secs, self.row_pause_max_secs)?,
            session_pause: Window::from_secs(
                self.session_pause_min_secs,
                self.session_pause_max_secs,
            )?,
        })
    }
}
