use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::probes::ProbeMode;
use crate::sink::OutputFormat;

/// Environment keys are read as `OPENWATCH_<SECTION>__<KEY>`.
pub const ENV_PREFIX: &str = "OPENWATCH";

/// Probe attachment configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProbeSettings {
    pub mode: Option<ProbeMode>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputSettings {
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl Settings {
    /// Read `.env` and the process environment (`OPENWATCH_PROBE__MODE=kprobe`, ...).
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    /// Apply command-line overrides on top of the environment.
    pub fn with_overrides(mut self, mode: Option<ProbeMode>, format: Option<OutputFormat>) -> Self {
        if mode.is_some() {
            self.probe.mode = mode;
        }
        if format.is_some() {
            self.output.format = format;
        }
        self
    }

    pub fn probe_mode(&self) -> ProbeMode {
        self.probe.mode.unwrap_or_default()
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output.format.unwrap_or_default()
    }
}
