pub const TOPIC_VOLUME: &str = "homecontrol/volume";
pub const TOPIC_LIGHTS: &str = "homecontrol/lights";
pub const TOPIC_EFFECTS: &str = "homecontrol/effects";
pub const TOPIC_STATUS: &str = "homecontrol/status";
pub const TOPIC_COMMAND: &str = "homecontrol/command";

pub const TOPIC_OTA_STATUS: &str = "homecontrol/ota/status";
pub const TOPIC_OTA_COMMAND: &str = "homecontrol/ota/command";
pub const TOPIC_OTA_PROGRESS: &str = "homecontrol/ota/progress";

pub const TOPIC_CONFIG_COMMAND: &str = "homecontrol/config/command";
pub const TOPIC_CONFIG_STATUS: &str = "homecontrol/config/status";
pub const TOPIC_CONFIG_EXPORT: &str = "homecontrol/config/export";
pub const TOPIC_CONFIG_SUMMARY: &str = "homecontrol/config/summary";

pub const TOPIC_MODULES_STATUS: &str = "homecontrol/modules/status";
pub const TOPIC_MODULES_SET_FILTER: &str = "homecontrol/modules/+/set";

const MODULE_TOPIC_PREFIX: &str = "homecontrol/modules/";
const MODULE_TOPIC_SUFFIX: &str = "/set";

pub const SUBSCRIBED_TOPICS: [&str; 4] = [
    TOPIC_COMMAND,
    TOPIC_OTA_COMMAND,
    TOPIC_CONFIG_COMMAND,
    TOPIC_MODULES_SET_FILTER,
];

pub fn module_set_topic(id: u8) -> String {
    format!("{MODULE_TOPIC_PREFIX}{id}{MODULE_TOPIC_SUFFIX}")
}

/// Retained ON/OFF state of one panel relay channel (1-based).
pub fn relay_status_topic(channel: u8) -> String {
    format!("homecontrol/relay{channel}")
}

pub fn module_id_from_topic(topic: &str) -> Option<u8> {
    topic
        .strip_prefix(MODULE_TOPIC_PREFIX)?
        .strip_suffix(MODULE_TOPIC_SUFFIX)?
        .parse()
        .ok()
}
