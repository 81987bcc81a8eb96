//! Driver configuration.
//!
//! Read once at initialisation from an Info.plist style property file
//! (`ifdLogLevel`, `ifdDriverOptions`), with an environment override for the
//! log level. The pinpad locale is carried here too so the quirk hooks never
//! reach into process globals.

use std::path::Path;

use crate::ccid::Voltage;

/// Log level bits, matching the historical driver values.
pub const LOG_CRITICAL: u32 = 0x01;
pub const LOG_INFO: u32 = 0x02;
pub const LOG_COMM: u32 = 0x04;
pub const LOG_PERIODIC: u32 = 0x08;

/// Driver option bits from `ifdDriverOptions`.
pub const OPTION_ESCAPE_EXCHANGE: u32 = 0x01;
pub const OPTION_TWIN_KEY_APDU: u32 = 0x02;
pub const OPTION_USE_BOGUS_FIRMWARE: u32 = 0x04;
pub const OPTION_DISABLE_PIN_RETRIES: u32 = 1 << 6;
pub const OPTION_RESET_ON_CLOSE: u32 = 1 << 7;

/// Environment variable overriding the configured log level.
pub const LOG_LEVEL_ENV: &str = "IFD_CCID_LOG_LEVEL";

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: u32,
    pub driver_options: u32,
    /// Locale driving the pinpad message tables, e.g. "fr_FR".
    pub locale: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: LOG_CRITICAL | LOG_INFO,
            driver_options: 0,
            locale: None,
        }
    }
}

impl Config {
    /// Load from a property file, then apply the environment override.
    pub fn load(path: &Path) -> Config {
        let mut config = Config::default();

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                if let Some(value) = property_value(&contents, "ifdLogLevel") {
                    if let Some(level) = parse_number(&value) {
                        config.log_level = level;
                        log::info!("LogLevel: 0x{level:04X}");
                    }
                }
                if let Some(value) = property_value(&contents, "ifdDriverOptions") {
                    if let Some(options) = parse_number(&value) {
                        config.driver_options = options;
                        log::info!("DriverOptions: 0x{options:04X}");
                    }
                }
            }
            Err(e) => log::info!("no property file at {}: {e}", path.display()),
        }

        if let Ok(value) = std::env::var(LOG_LEVEL_ENV) {
            if let Some(level) = parse_number(&value) {
                config.log_level = level;
                log::info!("LogLevel from {LOG_LEVEL_ENV}: 0x{level:04X}");
            }
        }

        config
    }

    pub fn allow_escape_exchange(&self) -> bool {
        self.driver_options & OPTION_ESCAPE_EXCHANGE != 0
    }

    pub fn twin_key_apdu(&self) -> bool {
        self.driver_options & OPTION_TWIN_KEY_APDU != 0
    }

    pub fn use_bogus_firmware(&self) -> bool {
        self.driver_options & OPTION_USE_BOGUS_FIRMWARE != 0
    }

    pub fn disable_pin_retries(&self) -> bool {
        self.driver_options & OPTION_DISABLE_PIN_RETRIES != 0
    }

    pub fn reset_on_close(&self) -> bool {
        self.driver_options & OPTION_RESET_ON_CLOSE != 0
    }

    /// Power-on voltage from option bits 4 and 5.
    pub fn power_on_voltage(&self) -> Voltage {
        match (self.driver_options >> 4) & 0x03 {
            0 => Voltage::Volts5,
            1 => Voltage::Volts3,
            2 => Voltage::Volts1_8,
            _ => Voltage::Automatic,
        }
    }

    /// Map the level bits onto the `log` crate's filter.
    pub fn level_filter(&self) -> log::LevelFilter {
        if self.log_level & LOG_PERIODIC != 0 {
            log::LevelFilter::Trace
        } else if self.log_level & LOG_COMM != 0 {
            log::LevelFilter::Debug
        } else if self.log_level & LOG_INFO != 0 {
            log::LevelFilter::Info
        } else if self.log_level & LOG_CRITICAL != 0 {
            log::LevelFilter::Error
        } else {
            log::LevelFilter::Off
        }
    }
}

/// Find the `<string>` value following a `<key>name</key>` entry. The
/// property files shipped with drivers are flat key/value plists; a full
/// XML parser buys nothing here.
fn property_value(contents: &str, name: &str) -> Option<String> {
    let key_tag = format!("<key>{name}</key>");
    let after_key = &contents[contents.find(&key_tag)? + key_tag.len()..];
    let start = after_key.find("<string>")? + "<string>".len();
    let end = after_key.find("</string>")?;
    if end < start {
        return None;
    }
    Some(after_key[start..end].trim().to_string())
}

/// Numbers in the property file may be decimal, octal (leading 0) or hex
/// (leading 0x).
fn parse_number(value: &str) -> Option<u32> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if value.len() > 1 && value.starts_with('0') {
        u32::from_str_radix(&value[1..], 8).ok()
    } else {
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_radix_detection() {
        assert_eq!(parse_number("3"), Some(3));
        assert_eq!(parse_number("0x000F"), Some(15));
        assert_eq!(parse_number("010"), Some(8));
        assert_eq!(parse_number(" 0x20 "), Some(0x20));
        assert_eq!(parse_number("zz"), None);
    }

    #[test]
    fn plist_key_lookup() {
        let plist = r#"
<plist>
<dict>
    <key>ifdLogLevel</key>
    <string>0x0003</string>
    <key>ifdDriverOptions</key>
    <string>0x0001</string>
</dict>
</plist>"#;
        assert_eq!(property_value(plist, "ifdLogLevel").as_deref(), Some("0x0003"));
        assert_eq!(
            property_value(plist, "ifdDriverOptions").as_deref(),
            Some("0x0001")
        );
        assert_eq!(property_value(plist, "missing"), None);
    }

    #[test]
    fn voltage_bits() {
        let mut config = Config::default();
        assert_eq!(config.power_on_voltage(), Voltage::Volts5);
        config.driver_options = 0x10;
        assert_eq!(config.power_on_voltage(), Voltage::Volts3);
        config.driver_options = 0x20;
        assert_eq!(config.power_on_voltage(), Voltage::Volts1_8);
        config.driver_options = 0x30;
        assert_eq!(config.power_on_voltage(), Voltage::Automatic);
    }

    #[test]
    fn level_filter_mapping() {
        let mut config = Config::default();
        config.log_level = 0;
        assert_eq!(config.level_filter(), log::LevelFilter::Off);
        config.log_level = LOG_CRITICAL;
        assert_eq!(config.level_filter(), log::LevelFilter::Error);
        config.log_level = LOG_CRITICAL | LOG_INFO | LOG_COMM;
        assert_eq!(config.level_filter(), log::LevelFilter::Debug);
    }
}
