use crate::{
    modules::{Capabilities, InterfaceConfig, ModuleDescriptor},
    types::ModuleKind,
};

pub const RELAY_EXPANSION_ID: u8 = 100;
pub const TEMPERATURE_SENSOR_ID: u8 = 101;
pub const LIGHT_SENSOR_ID: u8 = 102;
pub const MOTION_SENSOR_ID: u8 = 103;
pub const BUZZER_ID: u8 = 104;

pub const RELAY_EXPANSION_I2C_ADDRESS: u8 = 0x20;
pub const LIGHT_SENSOR_I2C_ADDRESS: u8 = 0x23;
const I2C_CLOCK_HZ: u32 = 100_000;
const TEMPERATURE_PIN: u8 = 4;
const MOTION_SENSOR_PIN: u8 = 39;
const BUZZER_PIN: u8 = 17;

pub fn relay_expansion() -> ModuleDescriptor {
    ModuleDescriptor::new(
        RELAY_EXPANSION_ID,
        "Relay Expansion",
        ModuleKind::RelayExpansion,
        InterfaceConfig::I2c {
            address: RELAY_EXPANSION_I2C_ADDRESS,
            clock_hz: I2C_CLOCK_HZ,
        },
        Capabilities::OUTPUT
            | Capabilities::DIGITAL
            | Capabilities::HOTPLUG
            | Capabilities::CONFIGURABLE,
    )
    .with_description("8-channel I2C relay expander")
}

pub fn temperature_sensor() -> ModuleDescriptor {
    ModuleDescriptor::new(
        TEMPERATURE_SENSOR_ID,
        "Temperature Sensor",
        ModuleKind::SensorInput,
        InterfaceConfig::OneWire {
            pin: TEMPERATURE_PIN,
        },
        Capabilities::INPUT | Capabilities::ANALOG | Capabilities::HOTPLUG,
    )
    .with_description("One-wire temperature probe")
}

pub fn light_sensor() -> ModuleDescriptor {
    ModuleDescriptor::new(
        LIGHT_SENSOR_ID,
        "Light Sensor",
        ModuleKind::SensorInput,
        InterfaceConfig::I2c {
            address: LIGHT_SENSOR_I2C_ADDRESS,
            clock_hz: I2C_CLOCK_HZ,
        },
        Capabilities::INPUT | Capabilities::ANALOG | Capabilities::HOTPLUG,
    )
    .with_description("BH1750 ambient light sensor on I2C")
}

pub fn motion_sensor() -> ModuleDescriptor {
    ModuleDescriptor::new(
        MOTION_SENSOR_ID,
        "Motion Sensor",
        ModuleKind::SensorInput,
        InterfaceConfig::Gpio {
            pins: vec![MOTION_SENSOR_PIN],
        },
        Capabilities::INPUT | Capabilities::DIGITAL | Capabilities::INTERRUPT,
    )
    .with_description("PIR motion detection sensor")
}

pub fn buzzer() -> ModuleDescriptor {
    ModuleDescriptor::new(
        BUZZER_ID,
        "Buzzer",
        ModuleKind::Audio,
        InterfaceConfig::Pwm {
            pin: BUZZER_PIN,
            frequency_hz: 2_000,
            resolution_bits: 8,
        },
        Capabilities::OUTPUT | Capabilities::PWM | Capabilities::CONFIGURABLE,
    )
    .with_description("Piezo buzzer for audio feedback")
}

/// Built-in modules, all disabled until enabled by the user or by persisted settings.
pub fn builtin_modules() -> Vec<ModuleDescriptor> {
    vec![
        relay_expansion(),
        temperature_sensor(),
        light_sensor(),
        motion_sensor(),
        buzzer(),
    ]
}
