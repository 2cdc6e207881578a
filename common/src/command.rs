use serde::Deserialize;

use crate::error::CommandError;

pub const RELAY_CHANNELS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Off,
    SolidColor,
    Rainbow,
    RainbowCycle,
    Fire,
    Sparkle,
    Breathing,
    TheaterChase,
    VolumeBar,
    VolumeCircle,
    VolumeWave,
    TouchPaint,
    TouchRipple,
    TouchTrail,
}

impl Effect {
    pub const ALL: [Effect; 14] = [
        Self::Off,
        Self::SolidColor,
        Self::Rainbow,
        Self::RainbowCycle,
        Self::Fire,
        Self::Sparkle,
        Self::Breathing,
        Self::TheaterChase,
        Self::VolumeBar,
        Self::VolumeCircle,
        Self::VolumeWave,
        Self::TouchPaint,
        Self::TouchRipple,
        Self::TouchTrail,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::SolidColor => "SOLID_COLOR",
            Self::Rainbow => "RAINBOW",
            Self::RainbowCycle => "RAINBOW_CYCLE",
            Self::Fire => "FIRE",
            Self::Sparkle => "SPARKLE",
            Self::Breathing => "BREATHING",
            Self::TheaterChase => "THEATER_CHASE",
            Self::VolumeBar => "VOLUME_BAR",
            Self::VolumeCircle => "VOLUME_CIRCLE",
            Self::VolumeWave => "VOLUME_WAVE",
            Self::TouchPaint => "TOUCH_PAINT",
            Self::TouchRipple => "TOUCH_RIPPLE",
            Self::TouchTrail => "TOUCH_TRAIL",
        }
    }

    pub fn index(self) -> u8 {
        Self::ALL
            .iter()
            .position(|effect| *effect == self)
            .map_or(0, |index| index as u8)
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    /// Accepts a name (any case) or a numeric index.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(index) = value.parse::<u8>() {
            return Self::from_index(index);
        }
        Self::ALL
            .into_iter()
            .find(|effect| effect.as_str().eq_ignore_ascii_case(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightsCommand {
    On,
    Off,
    Toggle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelCommand {
    Volume(u8),
    Lights(LightsCommand),
    Brightness(u8),
    MatrixBrightness(u8),
    Relay { channel: u8, on: bool },
    Effect(Effect),
    Status,
    Reboot,
    Ota(OtaCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaCommand {
    CheckUpdate,
    StartUpdate,
    CancelUpdate,
    Rollback,
    SetAutoUpdate(bool),
    MarkValid,
    ForceUpdate {
        url: String,
        checksum: Option<String>,
    },
    GetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    GetConfig,
    SetWifi {
        ssid: String,
        password: String,
    },
    SetMqtt {
        server: String,
        port: u16,
        credentials: Option<(String, String)>,
    },
    ResetConfig,
    BackupConfig,
    RestoreConfig,
    SaveConfig,
    ExportConfig,
    ImportConfig(String),
    FactoryReset,
    ConfirmFactoryReset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleCommand {
    WriteValue { name: String, value: i32 },
    Configure(String),
}

#[derive(Deserialize)]
struct WifiArgs {
    ssid: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct MqttArgs {
    server: String,
    port: u16,
    user: Option<String>,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct ForceUpdateArgs {
    url: String,
    #[serde(default)]
    checksum: Option<String>,
}

/// Splits `COMMAND:VALUE` at the first colon.
fn split(payload: &str) -> Result<(&str, Option<&str>), CommandError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(match payload.split_once(':') {
        Some((command, value)) => (command.trim(), Some(value.trim())),
        None => (payload, None),
    })
}

fn required<'a>(command: &'static str, value: Option<&'a str>) -> Result<&'a str, CommandError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or(CommandError::MissingValue { command })
}

fn invalid(command: &'static str, value: &str) -> CommandError {
    CommandError::InvalidValue {
        command,
        value: value.to_string(),
    }
}

fn level(command: &'static str, value: Option<&str>, max: i64) -> Result<u8, CommandError> {
    let value = required(command, value)?;
    let level: i64 = value.parse().map_err(|_| invalid(command, value))?;
    u8::try_from(level.clamp(0, max)).map_err(|_| invalid(command, value))
}

fn on_off(command: &'static str, value: &str) -> Result<bool, CommandError> {
    match value.to_ascii_uppercase().as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(invalid(command, value)),
    }
}

fn json_args<'a, T: Deserialize<'a>>(command: &'static str, value: Option<&'a str>) -> Result<T, CommandError> {
    let value = required(command, value)?;
    serde_json::from_str(value).map_err(|_| invalid(command, value))
}

impl PanelCommand {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let trimmed = payload.trim();
        if let Some(ota) = trimmed
            .get(..4)
            .filter(|prefix| prefix.eq_ignore_ascii_case("OTA:"))
            .map(|_| &trimmed[4..])
        {
            return OtaCommand::parse(ota).map(Self::Ota);
        }

        let (command, value) = split(trimmed)?;
        let name = command.to_ascii_uppercase();
        match name.as_str() {
            "VOLUME" => level("VOLUME", value, 100).map(Self::Volume),
            "BRIGHTNESS" => level("BRIGHTNESS", value, 255).map(Self::Brightness),
            "MATRIX_BRIGHTNESS" => level("MATRIX_BRIGHTNESS", value, 255).map(Self::MatrixBrightness),
            "LIGHTS" => {
                let value = required("LIGHTS", value)?;
                let lights = match value.to_ascii_uppercase().as_str() {
                    "ON" => LightsCommand::On,
                    "OFF" => LightsCommand::Off,
                    "TOGGLE" => LightsCommand::Toggle,
                    _ => return Err(invalid("LIGHTS", value)),
                };
                Ok(Self::Lights(lights))
            }
            "EFFECT" => {
                let value = required("EFFECT", value)?;
                Effect::parse(value)
                    .map(Self::Effect)
                    .ok_or_else(|| invalid("EFFECT", value))
            }
            "STATUS" => Ok(Self::Status),
            "REBOOT" => Ok(Self::Reboot),
            relay if relay.starts_with("RELAY") => {
                let channel = relay[5..]
                    .parse::<u8>()
                    .ok()
                    .filter(|channel| (1..=RELAY_CHANNELS).contains(channel))
                    .ok_or_else(|| invalid("RELAY", command))?;
                let on = on_off("RELAY", required("RELAY", value)?)?;
                Ok(Self::Relay { channel, on })
            }
            _ => Err(CommandError::Unknown(command.to_string())),
        }
    }
}

impl OtaCommand {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let (command, value) = split(payload)?;
        match command {
            "check_update" => Ok(Self::CheckUpdate),
            "start_update" => Ok(Self::StartUpdate),
            "cancel_update" => Ok(Self::CancelUpdate),
            "rollback" => Ok(Self::Rollback),
            "mark_valid" => Ok(Self::MarkValid),
            "get_status" => Ok(Self::GetStatus),
            "set_auto_update" => {
                let value = required("set_auto_update", value)?;
                match value {
                    "true" | "1" => Ok(Self::SetAutoUpdate(true)),
                    "false" | "0" => Ok(Self::SetAutoUpdate(false)),
                    _ => Err(invalid("set_auto_update", value)),
                }
            }
            "force_update" => {
                let args: ForceUpdateArgs = json_args("force_update", value)?;
                if args.url.trim().is_empty() {
                    return Err(invalid("force_update", value.unwrap_or_default()));
                }
                Ok(Self::ForceUpdate {
                    url: args.url,
                    checksum: args.checksum.filter(|checksum| !checksum.is_empty()),
                })
            }
            _ => Err(CommandError::Unknown(command.to_string())),
        }
    }
}

impl ConfigCommand {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let (command, value) = split(payload)?;
        match command {
            "get_config" => Ok(Self::GetConfig),
            "reset_config" => Ok(Self::ResetConfig),
            "backup_config" => Ok(Self::BackupConfig),
            "restore_config" => Ok(Self::RestoreConfig),
            "save_config" => Ok(Self::SaveConfig),
            "export_config" => Ok(Self::ExportConfig),
            "factory_reset" => Ok(Self::FactoryReset),
            "confirm_factory_reset" => Ok(Self::ConfirmFactoryReset),
            "import_config" => {
                required("import_config", value).map(|json| Self::ImportConfig(json.to_string()))
            }
            "set_wifi" => {
                let args: WifiArgs = json_args("set_wifi", value)?;
                Ok(Self::SetWifi {
                    ssid: args.ssid,
                    password: args.password,
                })
            }
            "set_mqtt" => {
                let args: MqttArgs = json_args("set_mqtt", value)?;
                Ok(Self::SetMqtt {
                    server: args.server,
                    port: args.port,
                    credentials: args.user.map(|user| (user, args.password)),
                })
            }
            _ => Err(CommandError::Unknown(command.to_string())),
        }
    }
}

impl ModuleCommand {
    /// `NAME:<integer>` writes a value; anything else is handed to `configure` whole.
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let trimmed = payload.trim();
        let (name, value) = split(trimmed)?;
        if let Some(value) = value.and_then(|value| value.parse::<i32>().ok()) {
            if !name.is_empty() {
                return Ok(Self::WriteValue {
                    name: name.to_string(),
                    value,
                });
            }
        }
        Ok(Self::Configure(trimmed.to_string()))
    }
}
