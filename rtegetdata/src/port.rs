//! Serial port selection in the form `PORT[=BAUD[PARITY[STOP_BITS]]]`.
//!
//! For example `COM7=115200`, `/dev/ttyUSB0=250000E` or `ttyACM0=921600N2`.

use std::str::FromStr;

use rte_getdata::config::{Parity, SerialConfig, StopBits};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub port: String,
    pub baud_rate: Option<u32>,
    pub parity: Option<Parity>,
    pub stop_bits: Option<StopBits>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub enum PortSpecError {
    /// The port name is missing.
    MissingName,
    /// The baud rate is missing or not a decimal number in '{0}'.
    BadBaudRate(String),
    /// Unknown parity '{0}', expected N, O or E.
    BadParity(char),
    /// Unknown number of stop bits '{0}', expected 1 or 2.
    BadStopBits(char),
    /// Unexpected characters '{0}' after the line settings.
    TrailingCharacters(String),
}

impl FromStr for PortSpec {
    type Err = PortSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (port, settings) = match s.split_once('=') {
            Some((port, settings)) => (port, Some(settings)),
            None => (s, None),
        };

        if port.is_empty() {
            return Err(PortSpecError::MissingName);
        }

        let mut spec = PortSpec {
            port: port.to_string(),
            baud_rate: None,
            parity: None,
            stop_bits: None,
        };

        let Some(settings) = settings else {
            return Ok(spec);
        };

        let digits = settings
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(settings.len());
        let (baud, rest) = settings.split_at(digits);
        spec.baud_rate = Some(
            baud.parse()
                .map_err(|_| PortSpecError::BadBaudRate(settings.to_string()))?,
        );

        let mut rest = rest.chars();
        if let Some(parity) = rest.next() {
            spec.parity = Some(match parity.to_ascii_uppercase() {
                'N' => Parity::None,
                'O' => Parity::Odd,
                'E' => Parity::Even,
                other => return Err(PortSpecError::BadParity(other)),
            });
        }
        if let Some(stop_bits) = rest.next() {
            spec.stop_bits = Some(match stop_bits {
                '1' => StopBits::One,
                '2' => StopBits::Two,
                other => return Err(PortSpecError::BadStopBits(other)),
            });
        }

        let trailing = rest.as_str();
        if !trailing.is_empty() {
            return Err(PortSpecError::TrailingCharacters(trailing.to_string()));
        }

        Ok(spec)
    }
}

impl PortSpec {
    /// Applies the port name and the given line settings to `config`.
    pub fn apply(&self, config: &mut SerialConfig) {
        config.port.clone_from(&self.port);
        if let Some(baud_rate) = self.baud_rate {
            config.baud_rate = baud_rate;
        }
        if let Some(parity) = self.parity {
            config.parity = parity;
        }
        if let Some(stop_bits) = self.stop_bits {
            config.stop_bits = stop_bits;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case("COM7", None, None, None; "name only")]
    #[test_case("COM7=115200", Some(115_200), None, None; "baud rate")]
    #[test_case("/dev/ttyUSB0=250000E", Some(250_000), Some(Parity::Even), None; "even parity")]
    #[test_case("ttyACM0=921600o2", Some(921_600), Some(Parity::Odd), Some(StopBits::Two); "lower case parity and two stop bits")]
    #[test_case("COM3=9600N1", Some(9600), Some(Parity::None), Some(StopBits::One); "explicit defaults")]
    fn parses(
        text: &str,
        baud_rate: Option<u32>,
        parity: Option<Parity>,
        stop_bits: Option<StopBits>,
    ) {
        let spec: PortSpec = text.parse().unwrap();
        assert_eq!(spec.baud_rate, baud_rate);
        assert_eq!(spec.parity, parity);
        assert_eq!(spec.stop_bits, stop_bits);
    }

    #[test_case("=115200" => PortSpecError::MissingName; "missing name")]
    #[test_case("COM7=" => PortSpecError::BadBaudRate(String::new()); "missing baud rate")]
    #[test_case("COM7=fast" => PortSpecError::BadBaudRate("fast".into()); "baud rate not a number")]
    #[test_case("COM7=9600X" => PortSpecError::BadParity('X'); "unknown parity")]
    #[test_case("COM7=9600E3" => PortSpecError::BadStopBits('3'); "three stop bits")]
    #[test_case("COM7=9600E1x" => PortSpecError::TrailingCharacters("x".into()); "trailing")]
    fn rejects(text: &str) -> PortSpecError {
        text.parse::<PortSpec>().unwrap_err()
    }

    #[test]
    fn apply_keeps_unspecified_settings() {
        let mut config = SerialConfig {
            parity: Parity::Odd,
            ..Default::default()
        };

        let spec: PortSpec = "/dev/ttyUSB1=57600".parse().unwrap();
        spec.apply(&mut config);

        assert_eq!(config.port, "/dev/ttyUSB1");
        assert_eq!(config.baud_rate, 57_600);
        assert_eq!(config.parity, Parity::Odd);
        assert_eq!(config.stop_bits, StopBits::One);
    }
}
