//! Runtime configuration, loaded from an INI file.
//!
//! Sections: `[MQTT]`, `[SMARTMETER]`, `[BMS1]`, `[VICTRON]`, `[MPPT]`. Keys
//! are case-insensitive. The daemons share one file; each parses the whole
//! file but only requires the sections it uses, so a controller-only
//! deployment does not need the meter serial settings.
//!
//! The parsed [`Config`] is shared through a [`ConfigHandle`]: readers take a
//! read lock on each use, a SIGHUP reload or a `soc_min`/`soc_max` rebind
//! replaces or mutates the contents in place.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use configparser::ini::Ini;

use crate::meter::{parse_aes_key, MeterVariant};
use crate::Error;

/// Broker connection settings from `[MQTT]`.
#[derive(Debug, Clone)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Bus subjects wired between the daemons.
#[derive(Debug, Clone, Default)]
pub struct Topics {
    /// `[SMARTMETER] topic`: grid readings, consumed by the controller.
    pub smartmeter: Option<String>,
    /// `[BMS1] topic`: SoC and pack voltage.
    pub bms: Option<String>,
    /// `[VICTRON] topic`: accumulated telemetry; `/1..3` carry the phases.
    pub victron: Option<String>,
    /// `[VICTRON] mppt_topic`: solar power consumed by the controller.
    pub mppt: Option<String>,
    pub cmd: Option<String>,
    pub soc_min: Option<String>,
    pub soc_max: Option<String>,
    pub fetch_data: Option<String>,
}

/// `[SMARTMETER]` settings for the meter daemon.
#[derive(Debug, Clone)]
pub struct SmartmeterSection {
    pub serial_port: String,
    pub baudrate: u32,
    pub key: [u8; 16],
    pub variant: MeterVariant,
    /// Overrides the per-variant frame body length (P1 framing is longer).
    pub frame_length: Option<usize>,
    pub topic: String,
}

/// `[VICTRON]` settings for the controller.
#[derive(Debug, Clone)]
pub struct VictronSection {
    pub serial_port: String,
    /// Upper setpoint bound in watts.
    pub max_charge: f64,
    /// Base for the dynamic lower setpoint bound in watts.
    pub max_invert: f64,
    /// Upper SoC cutoff in percent.
    pub max_soc: f64,
    /// Lower SoC cutoff in percent.
    pub min_soc: f64,
    /// Band widening in percent once a cutoff has been crossed.
    pub soc_hysteresis: f64,
    /// Seconds of continuous empty-battery standby before sleeping.
    pub sleep_timeout: u64,
    pub sleep_enabled: bool,
}

/// `[MPPT]` settings for the VE.Direct daemon.
#[derive(Debug, Clone)]
pub struct MpptSection {
    pub serial_port: String,
    pub baudrate: u32,
    pub topic: String,
}

/// Fully parsed configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttSection,
    pub topics: Topics,
    pub smartmeter: Option<SmartmeterSection>,
    pub victron: Option<VictronSection>,
    pub mppt: Option<MpptSection>,
}

fn req(ini: &Ini, section: &str, key: &str) -> Result<String, Error> {
    ini.get(section, key)
        .ok_or_else(|| Error::Config(format!("missing key {key} in section [{section}]")))
}

fn req_f64(ini: &Ini, section: &str, key: &str) -> Result<f64, Error> {
    req(ini, section, key)?
        .parse::<f64>()
        .map_err(|e| Error::Config(format!("[{section}] {key}: {e}")))
}

fn opt_u32(ini: &Ini, section: &str, key: &str) -> Result<Option<u32>, Error> {
    match ini.get(section, key) {
        Some(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|e| Error::Config(format!("[{section}] {key}: {e}"))),
        None => Ok(None),
    }
}

impl Config {
    /// Loads and validates the configuration file.
    pub fn load(path: &str) -> Result<Self, Error> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| Error::Config(format!("cannot read {path}: {e}")))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, Error> {
        let mqtt = MqttSection {
            host: req(ini, "MQTT", "host")?,
            port: match ini.get("MQTT", "port") {
                Some(raw) => raw
                    .parse::<u16>()
                    .map_err(|e| Error::Config(format!("[MQTT] port: {e}")))?,
                None => 1883,
            },
            user: ini.get("MQTT", "user"),
            password: ini.get("MQTT", "password"),
        };

        let topics = Topics {
            smartmeter: ini.get("SMARTMETER", "topic"),
            bms: ini.get("BMS1", "topic"),
            victron: ini.get("VICTRON", "topic"),
            mppt: ini.get("VICTRON", "mppt_topic"),
            cmd: ini.get("VICTRON", "cmd_topic"),
            soc_min: ini.get("VICTRON", "soc_min_topic"),
            soc_max: ini.get("VICTRON", "soc_max_topic"),
            fetch_data: ini.get("VICTRON", "fetch_data_topic"),
        };

        // the meter serial settings are only required when the section
        // actually configures a link
        let smartmeter = match ini.get("SMARTMETER", "serial_port") {
            Some(serial_port) => Some(SmartmeterSection {
                serial_port,
                baudrate: opt_u32(ini, "SMARTMETER", "serial_baudrate")?.unwrap_or(115_200),
                key: parse_aes_key(&req(ini, "SMARTMETER", "aes_key")?)?,
                variant: req(ini, "SMARTMETER", "country_code")?.parse()?,
                frame_length: opt_u32(ini, "SMARTMETER", "frame_length")?.map(|n| n as usize),
                topic: req(ini, "SMARTMETER", "topic")?,
            }),
            None => None,
        };

        let victron = match ini.get("VICTRON", "serial_port") {
            Some(serial_port) => Some(VictronSection {
                serial_port,
                max_charge: req_f64(ini, "VICTRON", "MAX_CHARGE")?,
                max_invert: req_f64(ini, "VICTRON", "MAX_INVERT")?,
                max_soc: req_f64(ini, "VICTRON", "MAX_SOC")?,
                min_soc: req_f64(ini, "VICTRON", "MIN_SOC")?,
                soc_hysteresis: req_f64(ini, "VICTRON", "SOC_HYSTERESIS")?,
                sleep_timeout: match ini.get("VICTRON", "SLEEP_TIMEOUT") {
                    Some(raw) => raw
                        .parse::<u64>()
                        .map_err(|e| Error::Config(format!("[VICTRON] SLEEP_TIMEOUT: {e}")))?,
                    None => 3600,
                },
                sleep_enabled: ini
                    .getbool("VICTRON", "sleep_enabled")
                    .map_err(|e| Error::Config(format!("[VICTRON] sleep_enabled: {e}")))?
                    .unwrap_or(false),
            }),
            None => None,
        };

        let mppt = match ini.get("MPPT", "serial_port") {
            Some(serial_port) => Some(MpptSection {
                serial_port,
                baudrate: opt_u32(ini, "MPPT", "serial_baudrate")?.unwrap_or(19_200),
                topic: req(ini, "MPPT", "topic")?,
            }),
            None => None,
        };

        Ok(Config {
            mqtt,
            topics,
            smartmeter,
            victron,
            mppt,
        })
    }

    /// Parses configuration from an INI string. Used by tests.
    pub fn parse_str(content: &str) -> Result<Self, Error> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|e| Error::Config(format!("cannot parse configuration: {e}")))?;
        Self::from_ini(&ini)
    }

    pub fn victron(&self) -> Result<&VictronSection, Error> {
        self.victron
            .as_ref()
            .ok_or_else(|| Error::Config("section [VICTRON] is not configured".into()))
    }

    pub fn smartmeter(&self) -> Result<&SmartmeterSection, Error> {
        self.smartmeter
            .as_ref()
            .ok_or_else(|| Error::Config("section [SMARTMETER] is not configured".into()))
    }

    pub fn mppt(&self) -> Result<&MpptSection, Error> {
        self.mppt
            .as_ref()
            .ok_or_else(|| Error::Config("section [MPPT] is not configured".into()))
    }
}

/// Shared, reloadable configuration.
///
/// Cheap to clone; all clones see replacements and updates.
#[derive(Debug, Clone)]
pub struct ConfigHandle(Arc<RwLock<Config>>);

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    /// Read access for the current event; taken fresh on each use.
    pub fn read(&self) -> RwLockReadGuard<'_, Config> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Swaps in a newly loaded configuration (SIGHUP reload).
    pub fn replace(&self, config: Config) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Mutates the configuration in place (runtime rebinds).
    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        f(&mut self.0.write().unwrap_or_else(|e| e.into_inner()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[MQTT]
host = broker.local
port = 1883
user = ess
password = secret

[SMARTMETER]
serial_port = /dev/ttyUSB1
serial_baudrate = 115200
aes_key = 0b3ad6806f99976388059296a3e86ecb
country_code = WN
topic = tele/smartmeter/state

[BMS1]
topic = tele/bms1/state

[VICTRON]
serial_port = /dev/ttyUSB0
MAX_CHARGE = 3000
MAX_INVERT = 2000
MAX_SOC = 90
MIN_SOC = 20
SOC_HYSTERESIS = 2
sleep_enabled = true
topic = tele/victron/state
mppt_topic = tele/mppt/state
cmd_topic = cmnd/victron/cmd
soc_min_topic = cmnd/victron/soc_min
soc_max_topic = cmnd/victron/soc_max
fetch_data_topic = tele/victron/dump

[MPPT]
serial_port = /dev/ttyUSB2
topic = tele/mppt/state
"#;

    #[test]
    fn parses_full_file() {
        let config = Config::parse_str(SAMPLE).unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        let victron = config.victron().unwrap();
        assert_eq!(victron.max_charge, 3000.0);
        assert_eq!(victron.sleep_timeout, 3600);
        assert!(victron.sleep_enabled);
        let sm = config.smartmeter().unwrap();
        assert_eq!(sm.variant, MeterVariant::Wn);
        assert_eq!(sm.baudrate, 115_200);
        let mppt = config.mppt().unwrap();
        assert_eq!(mppt.baudrate, 19_200);
        assert_eq!(config.topics.smartmeter.as_deref(), Some("tele/smartmeter/state"));
        assert_eq!(config.topics.cmd.as_deref(), Some("cmnd/victron/cmd"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let config = Config::parse_str(SAMPLE).unwrap();
        // MAX_CHARGE was written upper-case in the file and read through the
        // lower-casing accessor path
        assert_eq!(config.victron().unwrap().max_charge, 3000.0);
    }

    #[test]
    fn missing_required_key_is_a_config_error() {
        let broken = SAMPLE.replace("MAX_CHARGE = 3000", "");
        assert!(matches!(
            Config::parse_str(&broken),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn sections_are_optional_without_serial_port() {
        let minimal = r#"
[MQTT]
host = localhost

[SMARTMETER]
topic = tele/smartmeter/state

[BMS1]
topic = tele/bms1/state
"#;
        let config = Config::parse_str(minimal).unwrap();
        assert!(config.victron.is_none());
        assert!(config.smartmeter.is_none());
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.topics.bms.as_deref(), Some("tele/bms1/state"));
    }

    #[test]
    fn handle_updates_are_visible_to_clones() {
        let config = Config::parse_str(SAMPLE).unwrap();
        let handle = ConfigHandle::new(config);
        let clone = handle.clone();
        handle.update(|c| {
            if let Some(v) = c.victron.as_mut() {
                v.min_soc = 25.0;
            }
        });
        assert_eq!(clone.read().victron().unwrap().min_soc, 25.0);
    }
}
