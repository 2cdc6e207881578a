use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::{ConfigRecord, ModuleSetting, MAX_LEARNED_IR_CODES, TOUCH_CALIBRATION_POINTS},
    error::{ConfigError, StorageError},
    image::{self, ImageHeader, CONFIG_MAGIC, IMAGE_LEN, SCHEMA_VERSION},
    storage::{ByteRegion, FileStore},
    types::ConfigSummary,
};

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_BACKUP_FILE: &str = "config_backup.json";
pub const REGION_OFFSET: usize = 0;
pub const DEFAULT_AUTO_SAVE_INTERVAL_MS: u64 = 30_000;
const AUTO_SAVE_RETRY_MS: u64 = 1_000;
const HEADER_KEYS: [&str; 3] = ["magic", "version", "checksum"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    ByteRegion,
    Backup,
    Defaults,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::ByteRegion => "byte region",
            Self::Backup => "backup file",
            Self::Defaults => "defaults",
        }
    }
}

/// Stored backends in the order `load` tries them; defaults come last.
const LOAD_ORDER: [ConfigSource; 3] = [
    ConfigSource::File,
    ConfigSource::ByteRegion,
    ConfigSource::Backup,
];

#[derive(Serialize)]
struct ExportDocument<'a> {
    version: u16,
    #[serde(flatten)]
    config: &'a ConfigRecord,
}

#[derive(Serialize)]
struct StoredDocumentRef<'a> {
    magic: u32,
    version: u16,
    checksum: u16,
    #[serde(flatten)]
    config: &'a ConfigRecord,
}

#[derive(Deserialize)]
struct StoredDocument {
    magic: u32,
    version: u16,
    checksum: u16,
    #[serde(flatten)]
    config: ConfigRecord,
}

pub fn encode_document(record: &ConfigRecord) -> Result<Vec<u8>, ConfigError> {
    let document = StoredDocumentRef {
        magic: CONFIG_MAGIC,
        version: SCHEMA_VERSION,
        checksum: image::record_checksum(record),
        config: record,
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

pub fn decode_document(bytes: &[u8]) -> Result<ConfigRecord, ConfigError> {
    let document: StoredDocument = serde_json::from_slice(bytes)?;
    document.config.validate()?;
    let header = ImageHeader {
        magic: document.magic,
        version: document.version,
        checksum: document.checksum,
    };
    image::check_header(header, image::record_checksum(&document.config))?;
    Ok(document.config)
}

fn merge_value(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

pub struct ConfigStore<R, F> {
    region: R,
    files: F,
    region_ready: bool,
    files_ready: bool,
    record: ConfigRecord,
    loaded: bool,
    dirty: bool,
    source: Option<ConfigSource>,
    auto_save_interval_ms: Option<u64>,
    save_deadline_ms: Option<u64>,
}

impl<R: ByteRegion, F: FileStore> ConfigStore<R, F> {
    pub fn new(region: R, files: F) -> Self {
        Self {
            region,
            files,
            region_ready: false,
            files_ready: false,
            record: ConfigRecord::default(),
            loaded: false,
            dirty: false,
            source: None,
            auto_save_interval_ms: None,
            save_deadline_ms: None,
        }
    }

    pub fn initialize(&mut self) -> Result<(), ConfigError> {
        self.region_ready = match self.region.open() {
            Ok(()) if self.region.capacity() >= REGION_OFFSET + IMAGE_LEN => true,
            Ok(()) => {
                warn!(
                    "byte region too small for config image ({} < {})",
                    self.region.capacity(),
                    REGION_OFFSET + IMAGE_LEN
                );
                false
            }
            Err(err) => {
                warn!("byte region unavailable: {err}");
                false
            }
        };

        self.files_ready = match self.files.open() {
            Ok(()) => true,
            Err(err) => {
                warn!("file store unavailable: {err}");
                false
            }
        };

        if !self.region_ready && !self.files_ready {
            return Err(ConfigError::NoBackend);
        }
        info!(
            "config store ready (file: {}, region: {})",
            self.files_ready, self.region_ready
        );
        Ok(())
    }

    pub fn load(&mut self) -> Result<ConfigRecord, ConfigError> {
        for source in LOAD_ORDER {
            match self.read_source(source) {
                Ok(Some(record)) => {
                    info!("config loaded from {}", source.as_str());
                    self.record = record;
                    self.loaded = true;
                    self.dirty = false;
                    self.source = Some(source);
                    self.save_deadline_ms = None;

                    match source {
                        ConfigSource::ByteRegion => self.migrate_to_file(),
                        ConfigSource::Backup => {
                            if let Err(err) = self.save(true) {
                                warn!("failed to rewrite config recovered from backup: {err}");
                            }
                        }
                        _ => {}
                    }
                    return Ok(self.record.clone());
                }
                Ok(None) => debug!("no config stored in {}", source.as_str()),
                Err(err) => warn!("rejecting config from {}: {err}", source.as_str()),
            }
        }

        warn!("no valid stored config; using defaults");
        self.record = ConfigRecord::default();
        self.loaded = true;
        self.dirty = true;
        self.source = Some(ConfigSource::Defaults);
        if let Err(err) = self.save(true) {
            warn!("failed to persist default config: {err}");
        }
        Ok(self.record.clone())
    }

    pub fn save(&mut self, force: bool) -> Result<(), ConfigError> {
        if !self.loaded {
            return Err(ConfigError::NotLoaded);
        }
        if !self.dirty && !force {
            return Ok(());
        }

        self.record.validate()?;
        let document = encode_document(&self.record)?;
        let image = image::encode(&self.record);

        self.backup_previous();

        let file_written = self.files_ready
            && match self.files.write(CONFIG_FILE, &document) {
                Ok(()) => true,
                Err(err) => {
                    warn!("config file write failed: {err}");
                    false
                }
            };
        let region_written = self.region_ready
            && match self.write_region(&image) {
                Ok(()) => true,
                Err(err) => {
                    warn!("config region write failed: {err}");
                    false
                }
            };

        if !file_written && !region_written {
            return Err(ConfigError::NoBackend);
        }
        if self.files_ready && !file_written {
            // A stale but valid file would shadow the newer region image on the next load.
            if let Err(err) = self.files.remove(CONFIG_FILE) {
                warn!("failed to drop stale {CONFIG_FILE}: {err}");
            }
        }

        self.dirty = false;
        self.save_deadline_ms = None;
        info!("config saved (file: {file_written}, region: {region_written})");
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), ConfigError> {
        info!("resetting config to defaults");
        self.record = ConfigRecord::default();
        self.loaded = true;
        self.dirty = true;
        self.source = Some(ConfigSource::Defaults);
        self.save(true)
    }

    /// Erases every stored copy, including the backup, then saves defaults.
    pub fn factory_reset(&mut self) -> Result<(), ConfigError> {
        warn!("factory reset: erasing stored config");
        if self.files_ready {
            for name in [CONFIG_FILE, CONFIG_BACKUP_FILE] {
                if let Err(err) = self.files.remove(name) {
                    warn!("failed to remove {name}: {err}");
                }
            }
        }
        if self.region_ready {
            if let Err(err) = self.region.erase().and_then(|()| self.region.commit()) {
                warn!("failed to erase config region: {err}");
            }
        }
        self.reset()
    }

    pub fn backup(&mut self) -> Result<(), ConfigError> {
        if !self.files_ready {
            return Err(ConfigError::NoBackend);
        }
        let current = self
            .files
            .read(CONFIG_FILE)?
            .ok_or(ConfigError::Invalid("no stored config to back up"))?;
        decode_document(&current)?;
        self.files.write(CONFIG_BACKUP_FILE, &current)?;
        info!("config backup written");
        Ok(())
    }

    pub fn restore(&mut self) -> Result<ConfigRecord, ConfigError> {
        if !self.files_ready {
            return Err(ConfigError::NoBackend);
        }
        let backup = self
            .files
            .read(CONFIG_BACKUP_FILE)?
            .ok_or(ConfigError::Invalid("no config backup available"))?;
        let record = decode_document(&backup)?;

        self.files.write(CONFIG_FILE, &backup)?;
        if self.region_ready {
            if let Err(err) = self.write_region(&image::encode(&record)) {
                warn!("failed to mirror restored config into byte region: {err}");
            }
        }
        info!("config restored from backup");
        self.load()
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        let document = ExportDocument {
            version: SCHEMA_VERSION,
            config: &self.record,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Merges `text` over the live record; the merged result must validate before it is kept.
    pub fn from_json(&mut self, text: &str) -> Result<(), ConfigError> {
        let Value::Object(mut patch) = serde_json::from_str::<Value>(text)? else {
            return Err(ConfigError::Invalid("config import must be a JSON object"));
        };
        for key in HEADER_KEYS {
            patch.remove(key);
        }

        let mut merged = serde_json::to_value(&self.record)?;
        merge_value(&mut merged, Value::Object(patch));
        let candidate: ConfigRecord = serde_json::from_value(merged)?;
        self.commit(candidate)
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            loaded: self.loaded,
            changed: self.dirty,
            version: SCHEMA_VERSION,
            wifi_configured: !self.record.wifi.ssid.is_empty(),
            mqtt_configured: !self.record.mqtt.server.is_empty(),
            motor_enabled: self.record.hardware.motor.enabled,
            touch_enabled: self.record.hardware.touch_screen.enabled,
            ir_enabled: self.record.hardware.infrared.enabled,
        }
    }

    pub fn record(&self) -> &ConfigRecord {
        &self.record
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn has_changed(&self) -> bool {
        self.dirty
    }

    pub fn source(&self) -> Option<ConfigSource> {
        self.source
    }

    pub fn enable_auto_save(&mut self, interval_ms: u64) {
        self.auto_save_interval_ms = Some(interval_ms.max(AUTO_SAVE_RETRY_MS));
    }

    pub fn disable_auto_save(&mut self) {
        self.auto_save_interval_ms = None;
        self.save_deadline_ms = None;
    }

    /// Saves once the record has been dirty for a full auto-save interval. Returns true on save.
    pub fn handle_auto_save(&mut self, now_ms: u64) -> bool {
        let Some(interval_ms) = self.auto_save_interval_ms else {
            return false;
        };
        if !self.loaded || !self.dirty {
            self.save_deadline_ms = None;
            return false;
        }

        let deadline = *self
            .save_deadline_ms
            .get_or_insert(now_ms.saturating_add(interval_ms));
        if now_ms < deadline {
            return false;
        }

        match self.save(false) {
            Ok(()) => true,
            Err(err) => {
                warn!("auto-save failed: {err}");
                self.save_deadline_ms = Some(now_ms.saturating_add(AUTO_SAVE_RETRY_MS));
                false
            }
        }
    }

    pub fn set_wifi_credentials(&mut self, ssid: &str, password: &str) -> Result<(), ConfigError> {
        self.apply(|record| {
            record.wifi.ssid = ssid.to_string();
            record.wifi.password = password.to_string();
        })
    }

    pub fn set_wifi_timeout(&mut self, timeout_ms: u32) -> Result<(), ConfigError> {
        self.apply(|record| record.wifi.timeout = timeout_ms)
    }

    pub fn set_wifi_auto_connect(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.apply(|record| record.wifi.auto_connect = enabled)
    }

    pub fn set_mqtt_server(&mut self, server: &str, port: u16) -> Result<(), ConfigError> {
        self.apply(|record| {
            record.mqtt.server = server.to_string();
            record.mqtt.port = port;
        })
    }

    pub fn set_mqtt_credentials(&mut self, user: &str, password: &str) -> Result<(), ConfigError> {
        self.apply(|record| {
            record.mqtt.user = user.to_string();
            record.mqtt.password = password.to_string();
        })
    }

    pub fn set_mqtt_client_id(&mut self, client_id: &str) -> Result<(), ConfigError> {
        self.apply(|record| record.mqtt.client_id = client_id.to_string())
    }

    pub fn set_mqtt_auto_connect(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.apply(|record| record.mqtt.auto_connect = enabled)
    }

    pub fn set_motor_config(
        &mut self,
        pwm_frequency: u32,
        pwm_resolution: u8,
        deadband: u16,
        enabled: bool,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            let motor = &mut record.hardware.motor;
            motor.pwm_frequency = pwm_frequency;
            motor.pwm_resolution = pwm_resolution;
            motor.deadband = deadband;
            motor.enabled = enabled;
        })
    }

    pub fn set_motor_calibration(
        &mut self,
        cal_min: u16,
        cal_max: u16,
        reversed: bool,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            let motor = &mut record.hardware.motor;
            motor.cal_min = cal_min;
            motor.cal_max = cal_max;
            motor.reversed = reversed;
        })
    }

    pub fn set_led_strip_config(
        &mut self,
        pwm_frequency: u32,
        pwm_resolution: u8,
        max_brightness: u8,
        enabled: bool,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            let strip = &mut record.hardware.led_strip;
            strip.pwm_frequency = pwm_frequency;
            strip.pwm_resolution = pwm_resolution;
            strip.max_brightness = max_brightness;
            strip.enabled = enabled;
        })
    }

    pub fn set_led_matrix_config(
        &mut self,
        max_brightness: u8,
        default_effect: u8,
        enabled: bool,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            let matrix = &mut record.hardware.led_matrix;
            matrix.max_brightness = max_brightness;
            matrix.default_effect = default_effect;
            matrix.enabled = enabled;
        })
    }

    pub fn set_touch_screen_config(
        &mut self,
        enabled: bool,
        screen_timeout_ms: u32,
        dim_brightness: u8,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            let touch = &mut record.hardware.touch_screen;
            touch.enabled = enabled;
            touch.screen_timeout = screen_timeout_ms;
            touch.dim_brightness = dim_brightness;
        })
    }

    pub fn set_touch_calibration(
        &mut self,
        points: [u16; TOUCH_CALIBRATION_POINTS],
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            let touch = &mut record.hardware.touch_screen;
            touch.calibration = points;
            touch.calibrated = true;
        })
    }

    pub fn set_ir_config(
        &mut self,
        enabled: bool,
        receiver_pin: u8,
        learning_mode: bool,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            let infrared = &mut record.hardware.infrared;
            infrared.enabled = enabled;
            infrared.receiver_pin = receiver_pin;
            infrared.learning_mode = learning_mode;
        })
    }

    pub fn learn_ir_code(&mut self, code: u32) -> Result<(), ConfigError> {
        let codes = &self.record.hardware.infrared.learned_codes;
        if codes.contains(&code) {
            return Ok(());
        }
        if codes.len() >= MAX_LEARNED_IR_CODES {
            return Err(ConfigError::Invalid("learned IR code table is full"));
        }
        self.apply(|record| record.hardware.infrared.learned_codes.push(code))
    }

    pub fn set_system_config(
        &mut self,
        debug: bool,
        baud_rate: u32,
        watchdog: bool,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            record.system.debug = debug;
            record.system.baud_rate = baud_rate;
            record.system.watchdog = watchdog;
        })
    }

    pub fn set_update_policy(
        &mut self,
        auto_update: bool,
        check_interval_ms: u32,
        server: &str,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            record.ota.auto_update = auto_update;
            record.ota.check_interval = check_interval_ms;
            record.ota.server = server.to_string();
        })
    }

    pub fn set_update_flags(
        &mut self,
        allow_beta: bool,
        require_confirmation: bool,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            record.ota.allow_beta = allow_beta;
            record.ota.require_confirmation = require_confirmation;
        })
    }

    pub fn set_auto_update(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.apply(|record| record.ota.auto_update = enabled)
    }

    pub fn set_user_preferences(
        &mut self,
        volume: u8,
        lights_on_boot: bool,
        brightness: u8,
    ) -> Result<(), ConfigError> {
        self.apply(|record| {
            let prefs = &mut record.preferences;
            prefs.default_volume = volume;
            prefs.lights_on_boot = lights_on_boot;
            prefs.default_brightness = brightness;
        })
    }

    pub fn set_module_enabled(&mut self, id: u8, enabled: bool) -> Result<(), ConfigError> {
        self.apply(|record| {
            match record.modules.iter_mut().find(|module| module.id == id) {
                Some(module) => module.enabled = enabled,
                None => record.modules.push(ModuleSetting { id, enabled }),
            }
        })
    }

    pub fn region_mut(&mut self) -> &mut R {
        &mut self.region
    }

    pub fn files_mut(&mut self) -> &mut F {
        &mut self.files
    }

    pub fn into_backends(self) -> (R, F) {
        (self.region, self.files)
    }

    fn apply(&mut self, change: impl FnOnce(&mut ConfigRecord)) -> Result<(), ConfigError> {
        let mut candidate = self.record.clone();
        change(&mut candidate);
        self.commit(candidate)
    }

    fn commit(&mut self, candidate: ConfigRecord) -> Result<(), ConfigError> {
        candidate.validate()?;
        if candidate != self.record {
            self.record = candidate;
            self.dirty = true;
        }
        Ok(())
    }

    fn read_source(&mut self, source: ConfigSource) -> Result<Option<ConfigRecord>, ConfigError> {
        match source {
            ConfigSource::File | ConfigSource::Backup => {
                if !self.files_ready {
                    return Ok(None);
                }
                let name = if source == ConfigSource::File {
                    CONFIG_FILE
                } else {
                    CONFIG_BACKUP_FILE
                };
                match self.files.read(name)? {
                    Some(bytes) => decode_document(&bytes).map(Some),
                    None => Ok(None),
                }
            }
            ConfigSource::ByteRegion => {
                if !self.region_ready {
                    return Ok(None);
                }
                let mut buf = vec![0_u8; IMAGE_LEN];
                self.region.read(REGION_OFFSET, &mut buf)?;
                if buf.iter().all(|byte| *byte == 0xFF) {
                    return Ok(None);
                }
                image::decode(&buf).map(Some)
            }
            ConfigSource::Defaults => Ok(Some(ConfigRecord::default())),
        }
    }

    fn write_region(&mut self, image: &[u8]) -> Result<(), StorageError> {
        self.region.write(REGION_OFFSET, image)?;
        self.region.commit()
    }

    fn migrate_to_file(&mut self) {
        if !self.files_ready {
            return;
        }
        let result = encode_document(&self.record)
            .and_then(|document| Ok(self.files.write(CONFIG_FILE, &document)?));
        match result {
            Ok(()) => info!("migrated config from byte region into {CONFIG_FILE}"),
            Err(err) => warn!("config migration into {CONFIG_FILE} failed: {err}"),
        }
    }

    fn backup_previous(&mut self) {
        if !self.files_ready {
            return;
        }
        match self.files.read(CONFIG_FILE) {
            Ok(Some(previous)) => match decode_document(&previous) {
                Ok(_) => {
                    if let Err(err) = self.files.write(CONFIG_BACKUP_FILE, &previous) {
                        warn!("config backup write failed: {err}");
                    }
                }
                Err(err) => debug!("not backing up invalid stored config: {err}"),
            },
            Ok(None) => {}
            Err(err) => warn!("failed to read config for backup: {err}"),
        }
    }
}
