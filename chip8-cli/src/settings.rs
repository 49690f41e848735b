//! Host settings, loaded from a YAML file.
use std::time::Duration;

use chip8::prelude::*;
use serde::Deserialize;

use crate::error::AppError;

/// Frames per second of the terminal renderer when not configured.
const DEFAULT_REFRESH_RATE: u32 = 30;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Virtual machine parameters.
    pub machine: Chip8Conf,
    /// Frames per second of the terminal renderer.
    pub refresh_rate: Option<u32>,
    /// Seconds before the machine is shut down. Runs until the
    /// program halts when absent.
    pub run_for: Option<f64>,
}

impl Settings {
    pub fn from_file(filepath: &str) -> Result<Self, AppError> {
        let file = std::fs::File::open(filepath)?;

        let settings: Settings = serde_yaml::from_reader(file)?;
        log::debug!("loaded settings: {:#?}", settings);

        Ok(settings)
    }

    pub fn refresh_interval(&self) -> Duration {
        let rate = self.refresh_rate.unwrap_or(DEFAULT_REFRESH_RATE).max(1);
        Duration::from_nanos(1_000_000_000 / rate as u64)
    }

    pub fn run_for(&self) -> Option<Duration> {
        self.run_for
            .and_then(|secs| Duration::try_from_secs_f64(secs.max(0.0)).ok())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_settings() {
        let source = r#"
machine:
  clock_frequency: 700
  shift_quirk: source
refresh_rate: 10
run_for: 1.5
"#;
        let settings: Settings = serde_yaml::from_str(source).unwrap();
        assert_eq!(settings.machine.clock_frequency(), Hz(700));
        assert_eq!(settings.machine.max_clock_frequency(), Hz(5000));
        assert_eq!(settings.machine.shift_quirk, ShiftQuirk::Source);
        assert_eq!(settings.refresh_interval(), Duration::from_millis(100));
        assert_eq!(settings.run_for(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_empty_settings() {
        let settings: Settings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.machine.clock_frequency(), Hz(500));
        assert_eq!(settings.machine.shift_quirk, ShiftQuirk::InPlace);
        assert_eq!(settings.run_for(), None);
    }
}
