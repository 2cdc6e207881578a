use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Strings are stored in 64-byte fields with a terminating NUL.
pub const MAX_STRING_LEN: usize = 63;
pub const TOUCH_CALIBRATION_POINTS: usize = 8;
pub const MAX_LEARNED_IR_CODES: usize = 16;
pub const MAX_MODULE_SETTINGS: usize = 16;
pub const DEFAULT_UPDATE_SERVER: &str = "https://your-server.com/firmware/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRange {
    pub field: &'static str,
    pub min: i64,
    pub max: i64,
}

impl FieldRange {
    pub const fn new(field: &'static str, min: i64, max: i64) -> Self {
        Self { field, min, max }
    }

    pub fn check(&self, value: impl Into<i64>) -> Result<(), ConfigError> {
        let value = value.into();
        if (self.min..=self.max).contains(&value) {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange {
                field: self.field,
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

pub const WIFI_TIMEOUT_MS: FieldRange = FieldRange::new("wifi.timeout", 1_000, 300_000);
pub const MQTT_PORT: FieldRange = FieldRange::new("mqtt.port", 1, 65_535);
pub const MQTT_RECONNECT_DELAY_MS: FieldRange =
    FieldRange::new("mqtt.reconnect_delay", 1_000, 300_000);
pub const MOTOR_PWM_FREQUENCY: FieldRange =
    FieldRange::new("hardware.motor.pwm_frequency", 100, 20_000);
pub const MOTOR_PWM_RESOLUTION: FieldRange =
    FieldRange::new("hardware.motor.pwm_resolution", 8, 16);
pub const MOTOR_DEADBAND: FieldRange = FieldRange::new("hardware.motor.deadband", 0, 100);
pub const MOTOR_CALIBRATION: FieldRange = FieldRange::new("hardware.motor.cal", 0, 4_095);
pub const STRIP_PWM_FREQUENCY: FieldRange =
    FieldRange::new("hardware.led_strip.pwm_frequency", 100, 20_000);
pub const STRIP_PWM_RESOLUTION: FieldRange =
    FieldRange::new("hardware.led_strip.pwm_resolution", 8, 16);
pub const MATRIX_DEFAULT_EFFECT: FieldRange =
    FieldRange::new("hardware.led_matrix.default_effect", 0, 15);
pub const MATRIX_FRAME_RATE: FieldRange = FieldRange::new("hardware.led_matrix.frame_rate", 1, 120);
pub const MATRIX_EFFECT_INTERVAL_MS: FieldRange =
    FieldRange::new("hardware.led_matrix.effect_interval", 1_000, 3_600_000);
pub const SCREEN_TIMEOUT_MS: FieldRange =
    FieldRange::new("hardware.touch_screen.screen_timeout", 1_000, 300_000);
pub const IR_RECEIVER_PIN: FieldRange = FieldRange::new("hardware.infrared.receiver_pin", 0, 39);
pub const SERIAL_BAUD_RATE: FieldRange = FieldRange::new("system.baud_rate", 9_600, 921_600);
pub const WATCHDOG_TIMEOUT_MS: FieldRange =
    FieldRange::new("system.watchdog_timeout", 1_000, 300_000);
pub const HEALTH_INTERVAL_MS: FieldRange =
    FieldRange::new("system.health_interval", 1_000, 3_600_000);
pub const OTA_CHECK_INTERVAL_MS: FieldRange =
    FieldRange::new("ota.check_interval", 300_000, 86_400_000);
pub const DEFAULT_VOLUME: FieldRange = FieldRange::new("preferences.default_volume", 0, 100);

pub fn check_str(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.len() > MAX_STRING_LEN {
        return Err(ConfigError::TooLong {
            field,
            len: value.len(),
            max: MAX_STRING_LEN,
        });
    }
    if value.contains('\0') {
        return Err(ConfigError::Invalid("strings must not contain NUL"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiSettings {
    pub ssid: String,
    pub password: String,
    pub auto_connect: bool,
    pub timeout: u32,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            auto_connect: true,
            timeout: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub client_id: String,
    pub auto_connect: bool,
    pub reconnect_delay: u32,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            client_id: "ESP32_HomeControl".to_string(),
            auto_connect: true,
            reconnect_delay: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    pub pwm_frequency: u32,
    pub pwm_resolution: u8,
    pub deadband: u16,
    pub enabled: bool,
    pub reversed: bool,
    pub cal_min: u16,
    pub cal_max: u16,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            pwm_frequency: 1_000,
            pwm_resolution: 8,
            deadband: 20,
            enabled: true,
            reversed: false,
            cal_min: 0,
            cal_max: 4_095,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedStripSettings {
    pub pwm_frequency: u32,
    pub pwm_resolution: u8,
    pub enabled: bool,
    pub max_brightness: u8,
    pub auto_on: bool,
}

impl Default for LedStripSettings {
    fn default() -> Self {
        Self {
            pwm_frequency: 5_000,
            pwm_resolution: 8,
            enabled: true,
            max_brightness: 255,
            auto_on: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedMatrixSettings {
    pub max_brightness: u8,
    pub default_effect: u8,
    pub enabled: bool,
    pub frame_rate: u8,
    pub auto_effects: bool,
    pub effect_interval: u32,
}

impl Default for LedMatrixSettings {
    fn default() -> Self {
        Self {
            max_brightness: 128,
            default_effect: 0,
            enabled: true,
            frame_rate: 60,
            auto_effects: false,
            effect_interval: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TouchScreenSettings {
    pub enabled: bool,
    pub calibration: [u16; TOUCH_CALIBRATION_POINTS],
    pub calibrated: bool,
    pub screen_timeout: u32,
    pub dim_brightness: u8,
    pub auto_wake: bool,
}

impl Default for TouchScreenSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            calibration: [0; TOUCH_CALIBRATION_POINTS],
            calibrated: false,
            screen_timeout: 30_000,
            dim_brightness: 30,
            auto_wake: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraredSettings {
    pub enabled: bool,
    pub receiver_pin: u8,
    pub learning_mode: bool,
    pub learned_codes: Vec<u32>,
}

impl Default for InfraredSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            receiver_pin: 35,
            learning_mode: false,
            learned_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSettings {
    pub motor: MotorSettings,
    pub led_strip: LedStripSettings,
    pub led_matrix: LedMatrixSettings,
    pub touch_screen: TouchScreenSettings,
    pub infrared: InfraredSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub debug: bool,
    pub baud_rate: u32,
    pub watchdog: bool,
    pub watchdog_timeout: u32,
    pub failsafe: bool,
    pub health_interval: u32,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            debug: true,
            baud_rate: 115_200,
            watchdog: true,
            watchdog_timeout: 30_000,
            failsafe: true,
            health_interval: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaSettings {
    pub auto_update: bool,
    pub check_interval: u32,
    pub server: String,
    pub allow_beta: bool,
    pub require_confirmation: bool,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            auto_update: false,
            check_interval: 3_600_000,
            server: DEFAULT_UPDATE_SERVER.to_string(),
            allow_beta: false,
            require_confirmation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub default_volume: u8,
    pub lights_on_boot: bool,
    pub default_brightness: u8,
    pub mute_on_boot: bool,
    pub remember_state: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            default_volume: 0,
            lights_on_boot: false,
            default_brightness: 0,
            mute_on_boot: false,
            remember_state: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSetting {
    pub id: u8,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigRecord {
    pub wifi: WifiSettings,
    pub mqtt: MqttSettings,
    pub hardware: HardwareSettings,
    pub system: SystemSettings,
    pub ota: OtaSettings,
    pub preferences: Preferences,
    pub modules: Vec<ModuleSetting>,
}

impl ConfigRecord {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_str("wifi.ssid", &self.wifi.ssid)?;
        check_str("wifi.password", &self.wifi.password)?;
        WIFI_TIMEOUT_MS.check(self.wifi.timeout)?;

        check_str("mqtt.server", &self.mqtt.server)?;
        MQTT_PORT.check(self.mqtt.port)?;
        check_str("mqtt.user", &self.mqtt.user)?;
        check_str("mqtt.password", &self.mqtt.password)?;
        check_str("mqtt.client_id", &self.mqtt.client_id)?;
        MQTT_RECONNECT_DELAY_MS.check(self.mqtt.reconnect_delay)?;

        let motor = &self.hardware.motor;
        MOTOR_PWM_FREQUENCY.check(motor.pwm_frequency)?;
        MOTOR_PWM_RESOLUTION.check(motor.pwm_resolution)?;
        MOTOR_DEADBAND.check(motor.deadband)?;
        MOTOR_CALIBRATION.check(motor.cal_min)?;
        MOTOR_CALIBRATION.check(motor.cal_max)?;
        if motor.cal_min >= motor.cal_max {
            return Err(ConfigError::Invalid(
                "hardware.motor.cal_min must be below cal_max",
            ));
        }

        let strip = &self.hardware.led_strip;
        STRIP_PWM_FREQUENCY.check(strip.pwm_frequency)?;
        STRIP_PWM_RESOLUTION.check(strip.pwm_resolution)?;

        let matrix = &self.hardware.led_matrix;
        MATRIX_DEFAULT_EFFECT.check(matrix.default_effect)?;
        MATRIX_FRAME_RATE.check(matrix.frame_rate)?;
        MATRIX_EFFECT_INTERVAL_MS.check(matrix.effect_interval)?;

        SCREEN_TIMEOUT_MS.check(self.hardware.touch_screen.screen_timeout)?;

        let infrared = &self.hardware.infrared;
        IR_RECEIVER_PIN.check(infrared.receiver_pin)?;
        if infrared.learned_codes.len() > MAX_LEARNED_IR_CODES {
            return Err(ConfigError::Invalid("too many learned IR codes"));
        }

        SERIAL_BAUD_RATE.check(self.system.baud_rate)?;
        WATCHDOG_TIMEOUT_MS.check(self.system.watchdog_timeout)?;
        HEALTH_INTERVAL_MS.check(self.system.health_interval)?;

        OTA_CHECK_INTERVAL_MS.check(self.ota.check_interval)?;
        check_str("ota.server", &self.ota.server)?;

        DEFAULT_VOLUME.check(self.preferences.default_volume)?;

        if self.modules.len() > MAX_MODULE_SETTINGS {
            return Err(ConfigError::Invalid("too many module settings"));
        }
        let mut seen = HashSet::new();
        if !self.modules.iter().all(|module| seen.insert(module.id)) {
            return Err(ConfigError::Invalid("duplicate module setting id"));
        }

        Ok(())
    }

    pub fn module_enabled(&self, id: u8) -> Option<bool> {
        self.modules
            .iter()
            .find(|module| module.id == id)
            .map(|module| module.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ConfigRecord::default().validate(), Ok(()));
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut record = ConfigRecord::default();
        record.mqtt.port = 0;

        assert!(matches!(
            record.validate(),
            Err(ConfigError::OutOfRange {
                field: "mqtt.port",
                ..
            })
        ));
    }

    #[test]
    fn long_ssid_is_rejected() {
        let mut record = ConfigRecord::default();
        record.wifi.ssid = "x".repeat(MAX_STRING_LEN + 1);

        assert!(matches!(
            record.validate(),
            Err(ConfigError::TooLong {
                field: "wifi.ssid",
                ..
            })
        ));

        record.wifi.ssid = "x".repeat(MAX_STRING_LEN);
        assert_eq!(record.validate(), Ok(()));
    }

    #[test]
    fn inverted_motor_calibration_is_rejected() {
        let mut record = ConfigRecord::default();
        record.hardware.motor.cal_min = 3_000;
        record.hardware.motor.cal_max = 2_000;

        assert!(record.validate().is_err());
    }

    #[test]
    fn duplicate_module_settings_are_rejected() {
        let mut record = ConfigRecord::default();
        record.modules = vec![
            ModuleSetting {
                id: 7,
                enabled: true,
            },
            ModuleSetting {
                id: 7,
                enabled: false,
            },
        ];

        assert!(record.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let record: ConfigRecord =
            serde_json::from_str(r#"{"mqtt":{"server":"broker.local"}}"#).unwrap();

        assert_eq!(record.mqtt.server, "broker.local");
        assert_eq!(record.mqtt.port, 1883);
        assert_eq!(record.ota, OtaSettings::default());
    }
}
