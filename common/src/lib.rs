pub mod catalog;
pub mod command;
pub mod config;
pub mod config_store;
pub mod error;
pub mod image;
pub mod modules;
pub mod ota;
pub mod panel;
pub mod queue;
pub mod storage;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use command::{ConfigCommand, Effect, LightsCommand, ModuleCommand, OtaCommand, PanelCommand};
pub use config::ConfigRecord;
pub use config_store::{ConfigSource, ConfigStore};
pub use error::{
    CommandError, ConfigError, ModuleError, RegistryError, StorageError, TransportError, UpdateError,
};
pub use modules::{Capabilities, InterfaceConfig, Module, ModuleDescriptor, ModuleEvent, ModuleRegistry};
pub use ota::{
    CancelHandle, FirmwareSlots, FirmwareSource, FirmwareStream, OtaAction, OtaManager, SlotState,
    UpdateDescriptor, UpdatePolicy, UpdateRequest,
};
pub use panel::{Panel, PanelAction, PanelState};
pub use queue::{Delivery, OutboundQueue, StatusSink, Transport};
pub use storage::{ByteRegion, FileStore, MemoryFiles, MemoryRegion};
pub use topics::*;
pub use types::{DeviceStatusPayload, ModuleKind, OtaState, OtaStatusPayload};
