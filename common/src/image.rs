//! Fixed-layout binary image of a [`ConfigRecord`] for the byte-addressed backend.
//!
//! Little-endian header `magic: u32`, `version: u16`, `checksum: u16`, then every field in
//! declaration order. Strings occupy 64 bytes, NUL padded.

use crate::{
    config::{
        ConfigRecord, ModuleSetting, MAX_LEARNED_IR_CODES, MAX_MODULE_SETTINGS, MAX_STRING_LEN,
        TOUCH_CALIBRATION_POINTS,
    },
    error::ConfigError,
};

pub const CONFIG_MAGIC: u32 = 0xCAFE_BABE;
pub const SCHEMA_VERSION: u16 = 1;
pub const IMAGE_LEN: usize = 650;

const STRING_FIELD_LEN: usize = MAX_STRING_LEN + 1;
const CHECKSUM_OFFSET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    pub version: u16,
    pub checksum: u16,
}

/// XOR-rotate fold over the image, skipping the two checksum bytes.
pub fn checksum(image: &[u8]) -> u16 {
    image
        .iter()
        .enumerate()
        .filter(|(index, _)| !(CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2).contains(index))
        .fold(0_u16, |sum, (_, byte)| (sum ^ u16::from(*byte)).rotate_left(1))
}

pub fn record_checksum(record: &ConfigRecord) -> u16 {
    checksum(&encode(record))
}

pub fn encode(record: &ConfigRecord) -> Vec<u8> {
    let mut out = ImageWriter::with_capacity(IMAGE_LEN);
    out.u32(CONFIG_MAGIC);
    out.u16(SCHEMA_VERSION);
    out.u16(0);

    let wifi = &record.wifi;
    out.string(&wifi.ssid);
    out.string(&wifi.password);
    out.bool(wifi.auto_connect);
    out.u32(wifi.timeout);

    let mqtt = &record.mqtt;
    out.string(&mqtt.server);
    out.u16(mqtt.port);
    out.string(&mqtt.user);
    out.string(&mqtt.password);
    out.string(&mqtt.client_id);
    out.bool(mqtt.auto_connect);
    out.u32(mqtt.reconnect_delay);

    let motor = &record.hardware.motor;
    out.u32(motor.pwm_frequency);
    out.u8(motor.pwm_resolution);
    out.u16(motor.deadband);
    out.bool(motor.enabled);
    out.bool(motor.reversed);
    out.u16(motor.cal_min);
    out.u16(motor.cal_max);

    let strip = &record.hardware.led_strip;
    out.u32(strip.pwm_frequency);
    out.u8(strip.pwm_resolution);
    out.bool(strip.enabled);
    out.u8(strip.max_brightness);
    out.bool(strip.auto_on);

    let matrix = &record.hardware.led_matrix;
    out.u8(matrix.max_brightness);
    out.u8(matrix.default_effect);
    out.bool(matrix.enabled);
    out.u8(matrix.frame_rate);
    out.bool(matrix.auto_effects);
    out.u32(matrix.effect_interval);

    let touch = &record.hardware.touch_screen;
    out.bool(touch.enabled);
    for point in touch.calibration {
        out.u16(point);
    }
    out.bool(touch.calibrated);
    out.u32(touch.screen_timeout);
    out.u8(touch.dim_brightness);
    out.bool(touch.auto_wake);

    let infrared = &record.hardware.infrared;
    out.bool(infrared.enabled);
    out.u8(infrared.receiver_pin);
    out.bool(infrared.learning_mode);
    let codes = &infrared.learned_codes[..infrared.learned_codes.len().min(MAX_LEARNED_IR_CODES)];
    out.u8(codes.len() as u8);
    for index in 0..MAX_LEARNED_IR_CODES {
        out.u32(codes.get(index).copied().unwrap_or(0));
    }

    let system = &record.system;
    out.bool(system.debug);
    out.u32(system.baud_rate);
    out.bool(system.watchdog);
    out.u32(system.watchdog_timeout);
    out.bool(system.failsafe);
    out.u32(system.health_interval);

    let ota = &record.ota;
    out.bool(ota.auto_update);
    out.u32(ota.check_interval);
    out.string(&ota.server);
    out.bool(ota.allow_beta);
    out.bool(ota.require_confirmation);

    let prefs = &record.preferences;
    out.u8(prefs.default_volume);
    out.bool(prefs.lights_on_boot);
    out.u8(prefs.default_brightness);
    out.bool(prefs.mute_on_boot);
    out.bool(prefs.remember_state);

    let modules = &record.modules[..record.modules.len().min(MAX_MODULE_SETTINGS)];
    out.u8(modules.len() as u8);
    for index in 0..MAX_MODULE_SETTINGS {
        match modules.get(index) {
            Some(module) => {
                out.u8(module.id);
                out.bool(module.enabled);
            }
            None => {
                out.u8(0);
                out.u8(0);
            }
        }
    }

    let mut image = out.finish();
    let sum = checksum(&image);
    image[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_le_bytes());
    image
}

pub fn read_header(image: &[u8]) -> Result<ImageHeader, ConfigError> {
    let mut input = ImageReader::new(image);
    Ok(ImageHeader {
        magic: input.u32()?,
        version: input.u16()?,
        checksum: input.u16()?,
    })
}

/// Checks the header against `computed` and returns the first violated invariant.
pub fn check_header(header: ImageHeader, computed: u16) -> Result<(), ConfigError> {
    if header.magic != CONFIG_MAGIC {
        return Err(ConfigError::BadMagic(header.magic));
    }
    if header.version > SCHEMA_VERSION {
        return Err(ConfigError::UnsupportedVersion(header.version));
    }
    if header.checksum != computed {
        return Err(ConfigError::ChecksumMismatch {
            stored: header.checksum,
            computed,
        });
    }
    Ok(())
}

pub fn decode(bytes: &[u8]) -> Result<ConfigRecord, ConfigError> {
    if bytes.len() < IMAGE_LEN {
        return Err(ConfigError::Truncated(bytes.len()));
    }
    let image = &bytes[..IMAGE_LEN];
    check_header(read_header(image)?, checksum(image))?;

    let mut input = ImageReader::new(image);
    input.skip(8)?;
    let mut record = ConfigRecord::default();

    let wifi = &mut record.wifi;
    wifi.ssid = input.string()?;
    wifi.password = input.string()?;
    wifi.auto_connect = input.bool()?;
    wifi.timeout = input.u32()?;

    let mqtt = &mut record.mqtt;
    mqtt.server = input.string()?;
    mqtt.port = input.u16()?;
    mqtt.user = input.string()?;
    mqtt.password = input.string()?;
    mqtt.client_id = input.string()?;
    mqtt.auto_connect = input.bool()?;
    mqtt.reconnect_delay = input.u32()?;

    let motor = &mut record.hardware.motor;
    motor.pwm_frequency = input.u32()?;
    motor.pwm_resolution = input.u8()?;
    motor.deadband = input.u16()?;
    motor.enabled = input.bool()?;
    motor.reversed = input.bool()?;
    motor.cal_min = input.u16()?;
    motor.cal_max = input.u16()?;

    let strip = &mut record.hardware.led_strip;
    strip.pwm_frequency = input.u32()?;
    strip.pwm_resolution = input.u8()?;
    strip.enabled = input.bool()?;
    strip.max_brightness = input.u8()?;
    strip.auto_on = input.bool()?;

    let matrix = &mut record.hardware.led_matrix;
    matrix.max_brightness = input.u8()?;
    matrix.default_effect = input.u8()?;
    matrix.enabled = input.bool()?;
    matrix.frame_rate = input.u8()?;
    matrix.auto_effects = input.bool()?;
    matrix.effect_interval = input.u32()?;

    let touch = &mut record.hardware.touch_screen;
    touch.enabled = input.bool()?;
    for point in touch.calibration.iter_mut().take(TOUCH_CALIBRATION_POINTS) {
        *point = input.u16()?;
    }
    touch.calibrated = input.bool()?;
    touch.screen_timeout = input.u32()?;
    touch.dim_brightness = input.u8()?;
    touch.auto_wake = input.bool()?;

    let infrared = &mut record.hardware.infrared;
    infrared.enabled = input.bool()?;
    infrared.receiver_pin = input.u8()?;
    infrared.learning_mode = input.bool()?;
    let code_count = usize::from(input.u8()?);
    if code_count > MAX_LEARNED_IR_CODES {
        return Err(ConfigError::Invalid("learned IR code count out of range"));
    }
    let mut codes = Vec::with_capacity(code_count);
    for index in 0..MAX_LEARNED_IR_CODES {
        let code = input.u32()?;
        if index < code_count {
            codes.push(code);
        }
    }
    infrared.learned_codes = codes;

    let system = &mut record.system;
    system.debug = input.bool()?;
    system.baud_rate = input.u32()?;
    system.watchdog = input.bool()?;
    system.watchdog_timeout = input.u32()?;
    system.failsafe = input.bool()?;
    system.health_interval = input.u32()?;

    let ota = &mut record.ota;
    ota.auto_update = input.bool()?;
    ota.check_interval = input.u32()?;
    ota.server = input.string()?;
    ota.allow_beta = input.bool()?;
    ota.require_confirmation = input.bool()?;

    let prefs = &mut record.preferences;
    prefs.default_volume = input.u8()?;
    prefs.lights_on_boot = input.bool()?;
    prefs.default_brightness = input.u8()?;
    prefs.mute_on_boot = input.bool()?;
    prefs.remember_state = input.bool()?;

    let module_count = usize::from(input.u8()?);
    if module_count > MAX_MODULE_SETTINGS {
        return Err(ConfigError::Invalid("module setting count out of range"));
    }
    for index in 0..MAX_MODULE_SETTINGS {
        let id = input.u8()?;
        let enabled = input.u8()? != 0;
        if index < module_count {
            record.modules.push(ModuleSetting { id, enabled });
        }
    }

    record.validate()?;
    Ok(record)
}

struct ImageWriter {
    buf: Vec<u8>,
}

impl ImageWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(MAX_STRING_LEN);
        self.buf.extend_from_slice(&bytes[..len]);
        self.buf.resize(self.buf.len() + STRING_FIELD_LEN - len, 0);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct ImageReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ConfigError> {
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(ConfigError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), ConfigError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ConfigError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, ConfigError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ConfigError::Invalid("boolean field holds neither 0 nor 1")),
        }
    }

    fn u16(&mut self) -> Result<u16, ConfigError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, ConfigError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String, ConfigError> {
        let field = self.take(STRING_FIELD_LEN)?;
        let len = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
        if len > MAX_STRING_LEN {
            return Err(ConfigError::Invalid("string field is not terminated"));
        }
        std::str::from_utf8(&field[..len])
            .map(str::to_string)
            .map_err(|_| ConfigError::Invalid("string field is not utf-8"))
    }
}
