//! Settings layered from built-in defaults, an optional config file, the environment
//! and finally the command line.

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::providers::{Env, Format as _, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use rte_getdata::config::{SerialConfig, SessionConfig, TransferParameters, TransportConfig};

/// Prefix of environment variables overriding settings, e.g. `RTEGETDATA_SERIAL__BAUD_RATE`.
const ENV_PREFIX: &str = "RTEGETDATA_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial: SerialConfig,
    pub transfer: TransferParameters,
    pub elevated_priority: bool,
    /// Command file executed after the connection has been opened.
    pub start: Option<PathBuf>,
    /// Text file with one message filter name per line.
    pub filter_names: Option<PathBuf>,
}

impl Settings {
    pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        if let Some(path) = config_file {
            if !path.is_file() {
                anyhow::bail!("Config file {path:?} does not exist");
            }
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                Some("yml" | "yaml") => figment.merge(Yaml::file(path)),
                _ => {
                    return Err(anyhow::anyhow!(
                    "File format not recognized from extension (supported: .toml, .json, .yaml / .yml)"
                ))
                }
            };
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Invalid configuration")
    }

    /// The session configuration handed to the transfer core.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            transport: TransportConfig::Serial(self.serial.clone()),
            transfer: self.transfer.clone(),
            elevated_priority: self.elevated_priority,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rte_getdata::config::Parity;
    use std::fs;

    fn config_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("rtegetdata-{}-{name}", std::process::id()));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn defaults_without_config_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.transfer.output, PathBuf::from("data.bin"));
        assert_eq!(settings.serial.baud_rate, rte_getdata::config::DEFAULT_BAUD_RATE);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let path = config_file(
            "settings.toml",
            r#"
            elevated_priority = true

            [serial]
            port = "/dev/ttyUSB0"
            baud_rate = 921600
            parity = "even"

            [transfer]
            filter = 3
            output = "capture.bin"
            "#,
        );

        let settings = Settings::load(Some(&path)).unwrap();
        fs::remove_file(&path).ok();

        assert!(settings.elevated_priority);
        assert_eq!(settings.serial.port, "/dev/ttyUSB0");
        assert_eq!(settings.serial.baud_rate, 921_600);
        assert_eq!(settings.serial.parity, Parity::Even);
        assert_eq!(settings.serial.max_message_size, SerialConfig::default().max_message_size);
        assert_eq!(settings.transfer.filter, Some(3));
        assert_eq!(settings.transfer.output, PathBuf::from("capture.bin"));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let path = config_file("settings.ini", "port = COM3");
        let result = Settings::load(Some(&path));
        fs::remove_file(&path).ok();

        assert!(result.is_err());
    }

    #[test]
    fn missing_file_is_rejected() {
        assert!(Settings::load(Some(Path::new("/nonexistent/rtegetdata.toml"))).is_err());
    }
}
