use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend unavailable: {0}")]
    Unavailable(&'static str),
    #[error("region too small: need {needed} bytes, have {capacity}")]
    RegionTooSmall { needed: usize, capacity: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),
    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u16),
    #[error("checksum mismatch (stored 0x{stored:04X}, computed 0x{computed:04X})")]
    ChecksumMismatch { stored: u16, computed: u16 },
    #[error("image truncated at byte {0}")]
    Truncated(usize),
    #[error("{field} out of range: {value} not in {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{field} too long ({len} bytes, max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{0}")]
    Invalid(&'static str),
    #[error("malformed json: {0}")]
    Json(String),
    #[error("config not loaded")]
    NotLoaded,
    #[error("no storage backend available")]
    NoBackend,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for ConfigError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport not connected")]
    Disconnected,
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("request timed out")]
    Timeout,
    #[error("failed to parse version info: {0}")]
    Descriptor(String),
    #[error("invalid firmware size")]
    InvalidSize,
    #[error("firmware size mismatch (declared {declared}, served {served})")]
    SizeMismatch { declared: u64, served: u64 },
    #[error("incomplete firmware download ({written}/{expected} bytes)")]
    Incomplete { written: u64, expected: u64 },
    #[error("running version {running} is older than required {required}")]
    Incompatible { running: String, required: String },
    #[error("checksum verification failed")]
    ChecksumMismatch,
    #[error("unsupported checksum format")]
    UnsupportedChecksum,
    #[error("partition write failed: {0}")]
    Partition(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("update cancelled")]
    Cancelled,
    #[error("no previous version available for rollback")]
    NoRollbackTarget,
    #[error("not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("module id {0} already registered")]
    DuplicateId(u8),
    #[error("module name missing or longer than {0} bytes")]
    InvalidName(usize),
    #[error("module description longer than {0} bytes")]
    InvalidDescription(usize),
    #[error("module declares no capabilities")]
    NoCapabilities,
    #[error("module table full ({0} slots)")]
    TableFull(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("module fault: {0}")]
pub struct ModuleError(pub String);

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("command `{command}` needs a value")]
    MissingValue { command: &'static str },
    #[error("invalid value `{value}` for `{command}`")]
    InvalidValue { command: &'static str, value: String },
}
