use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtaState {
    Idle,
    CheckingVersion,
    UpdateAvailable,
    Downloading,
    Installing,
    Success,
    Failed,
    RollbackRequired,
}

impl OtaState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::CheckingVersion => "CHECKING_VERSION",
            Self::UpdateAvailable => "UPDATE_AVAILABLE",
            Self::Downloading => "DOWNLOADING",
            Self::Installing => "INSTALLING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::RollbackRequired => "ROLLBACK_REQUIRED",
        }
    }

    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::CheckingVersion | Self::Downloading | Self::Installing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    RelayExpansion,
    SensorInput,
    ActuatorOutput,
    Communication,
    Display,
    Audio,
    Custom,
}

impl ModuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelayExpansion => "relay_expansion",
            Self::SensorInput => "sensor_input",
            Self::ActuatorOutput => "actuator_output",
            Self::Communication => "communication",
            Self::Display => "display",
            Self::Audio => "audio",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    I2c,
    Spi,
    Uart,
    Gpio,
    Analog,
    Pwm,
    OneWire,
}

impl InterfaceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::I2c => "i2c",
            Self::Spi => "spi",
            Self::Uart => "uart",
            Self::Gpio => "gpio",
            Self::Analog => "analog",
            Self::Pwm => "pwm",
            Self::OneWire => "one_wire",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaStatusPayload {
    pub state: OtaState,
    pub message: String,
    pub progress: u8,
    #[serde(rename = "currentVersion")]
    pub current_version: String,
    #[serde(rename = "availableVersion")]
    pub available_version: Option<String>,
    #[serde(rename = "releaseNotes")]
    pub release_notes: Option<String>,
    pub mandatory: bool,
    #[serde(rename = "autoUpdate")]
    pub auto_update: bool,
    #[serde(rename = "autoStartPending")]
    pub auto_start_pending: bool,
    #[serde(rename = "canRollback")]
    pub can_rollback: bool,
    #[serde(rename = "retryCount")]
    pub retry_count: u8,
    #[serde(rename = "freeHeap")]
    pub free_heap: u32,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaProgressPayload {
    pub progress: u8,
    pub written: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleEventPayload {
    pub event: &'static str,
    pub id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "errorCount", skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleListEntry {
    pub id: u8,
    pub name: String,
    pub description: String,
    pub kind: ModuleKind,
    pub interface: InterfaceKind,
    pub capabilities: u8,
    pub detected: bool,
    pub enabled: bool,
    pub active: bool,
    #[serde(rename = "lastSeenMs")]
    pub last_seen_ms: u64,
    #[serde(rename = "errorCount")]
    pub error_count: u8,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConfigSummary {
    pub loaded: bool,
    pub changed: bool,
    pub version: u16,
    pub wifi_configured: bool,
    pub mqtt_configured: bool,
    pub motor_enabled: bool,
    pub touch_enabled: bool,
    pub ir_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LightsPayload {
    pub state: &'static str,
    pub brightness: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectsPayload {
    pub effect: String,
    #[serde(rename = "matrixBrightness")]
    pub matrix_brightness: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatusPayload {
    #[serde(rename = "firmwareVersion")]
    pub firmware_version: String,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    pub volume: u8,
    #[serde(rename = "lightsOn")]
    pub lights_on: bool,
    pub brightness: u8,
    #[serde(rename = "matrixBrightness")]
    pub matrix_brightness: u8,
    pub effect: String,
    #[serde(rename = "modulesRegistered")]
    pub modules_registered: usize,
    #[serde(rename = "modulesActive")]
    pub modules_active: usize,
    #[serde(rename = "queueDepth")]
    pub queue_depth: usize,
    #[serde(rename = "otaState")]
    pub ota_state: OtaState,
    #[serde(rename = "configDirty")]
    pub config_dirty: bool,
}
