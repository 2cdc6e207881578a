use bitflags::bitflags;
use log::{debug, info, warn};

use crate::{
    error::{ModuleError, RegistryError},
    types::{InterfaceKind, ModuleEventPayload, ModuleKind, ModuleListEntry},
};

pub const MAX_MODULES: usize = 16;
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_DESCRIPTION_LEN: usize = 64;
pub const UPDATE_INTERVAL_MS: u64 = 1_000;
pub const MAX_CONSECUTIVE_FAILURES: u8 = 5;
pub const SCAN_INTERVAL_MS: u64 = 30_000;
pub const REAP_GRACE_MS: u64 = 60_000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const INPUT = 0x01;
        const OUTPUT = 0x02;
        const ANALOG = 0x04;
        const DIGITAL = 0x08;
        const PWM = 0x10;
        const INTERRUPT = 0x20;
        const HOTPLUG = 0x40;
        const CONFIGURABLE = 0x80;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceConfig {
    I2c { address: u8, clock_hz: u32 },
    Spi { cs_pin: u8, clock_hz: u32, mode: u8 },
    Uart { tx_pin: u8, rx_pin: u8, baud: u32 },
    Gpio { pins: Vec<u8> },
    Analog { pin: u8, resolution_bits: u8 },
    Pwm { pin: u8, frequency_hz: u32, resolution_bits: u8 },
    OneWire { pin: u8 },
}

impl InterfaceConfig {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            Self::I2c { .. } => InterfaceKind::I2c,
            Self::Spi { .. } => InterfaceKind::Spi,
            Self::Uart { .. } => InterfaceKind::Uart,
            Self::Gpio { .. } => InterfaceKind::Gpio,
            Self::Analog { .. } => InterfaceKind::Analog,
            Self::Pwm { .. } => InterfaceKind::Pwm,
            Self::OneWire { .. } => InterfaceKind::OneWire,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub id: u8,
    pub name: String,
    pub description: String,
    pub kind: ModuleKind,
    pub interface: InterfaceConfig,
    pub capabilities: Capabilities,
    pub enabled: bool,
}

impl ModuleDescriptor {
    pub fn new(
        id: u8,
        name: impl Into<String>,
        kind: ModuleKind,
        interface: InterfaceConfig,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            kind,
            interface,
            capabilities,
            enabled: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(RegistryError::InvalidName(MAX_NAME_LEN));
        }
        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err(RegistryError::InvalidDescription(MAX_DESCRIPTION_LEN));
        }
        if self.capabilities.is_empty() {
            return Err(RegistryError::NoCapabilities);
        }
        Ok(())
    }
}

/// Peripheral driver surface. Only `detect` and `initialize` are mandatory.
pub trait Module: Send {
    fn detect(&mut self) -> bool;
    fn initialize(&mut self) -> Result<(), ModuleError>;

    fn update(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn read_value(&mut self, name: &str) -> Result<i32, ModuleError> {
        Err(ModuleError::new(format!("no readable value `{name}`")))
    }

    fn write_value(&mut self, name: &str, _value: i32) -> Result<(), ModuleError> {
        Err(ModuleError::new(format!("no writable value `{name}`")))
    }

    fn configure(&mut self, _config: &str) -> Result<(), ModuleError> {
        Err(ModuleError::new("module is not configurable"))
    }

    fn status(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleEvent {
    Registered { id: u8, name: String },
    Connected { id: u8 },
    Disconnected { id: u8 },
    Removed { id: u8, name: String },
    Enabled { id: u8 },
    Disabled { id: u8 },
    Fault { id: u8, message: String, error_count: u8 },
    ForceDisabled { id: u8, error_count: u8 },
}

impl ModuleEvent {
    pub fn id(&self) -> u8 {
        match self {
            Self::Registered { id, .. }
            | Self::Connected { id }
            | Self::Disconnected { id }
            | Self::Removed { id, .. }
            | Self::Enabled { id }
            | Self::Disabled { id }
            | Self::Fault { id, .. }
            | Self::ForceDisabled { id, .. } => *id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Removed { .. } => "removed",
            Self::Enabled { .. } => "enabled",
            Self::Disabled { .. } => "disabled",
            Self::Fault { .. } => "fault",
            Self::ForceDisabled { .. } => "force_disabled",
        }
    }

    /// The enablement change that should be persisted, if any.
    pub fn persisted_enablement(&self) -> Option<(u8, bool)> {
        match self {
            Self::Enabled { id } => Some((*id, true)),
            Self::Disabled { id } | Self::ForceDisabled { id, .. } => Some((*id, false)),
            _ => None,
        }
    }

    pub fn payload(&self) -> ModuleEventPayload {
        let (name, message, error_count) = match self {
            Self::Registered { name, .. } | Self::Removed { name, .. } => {
                (Some(name.clone()), None, None)
            }
            Self::Fault {
                message,
                error_count,
                ..
            } => (None, Some(message.clone()), Some(*error_count)),
            Self::ForceDisabled { error_count, .. } => (
                None,
                Some("disabled after repeated failures".to_string()),
                Some(*error_count),
            ),
            _ => (None, None, None),
        };
        ModuleEventPayload {
            event: self.as_str(),
            id: self.id(),
            name,
            message,
            error_count,
        }
    }
}

/// A module dropped by `reap`, handed back so the owner can probe it and register it again.
pub struct RemovedModule {
    pub descriptor: ModuleDescriptor,
    pub driver: Box<dyn Module>,
}

struct Slot {
    descriptor: ModuleDescriptor,
    driver: Box<dyn Module>,
    detected: bool,
    active: bool,
    last_seen_ms: u64,
    last_update_ms: Option<u64>,
    error_count: u8,
}

impl Slot {
    fn entry(&self) -> ModuleListEntry {
        ModuleListEntry {
            id: self.descriptor.id,
            name: self.descriptor.name.clone(),
            description: self.descriptor.description.clone(),
            kind: self.descriptor.kind,
            interface: self.descriptor.interface.kind(),
            capabilities: self.descriptor.capabilities.bits(),
            detected: self.detected,
            enabled: self.descriptor.enabled,
            active: self.active,
            last_seen_ms: self.last_seen_ms,
            error_count: self.error_count,
            status: self.driver.status(),
        }
    }

    fn deactivate(&mut self) {
        if self.active {
            self.driver.shutdown();
            self.active = false;
        }
    }
}

pub struct ModuleRegistry {
    slots: Vec<Option<Slot>>,
    events: Vec<ModuleEvent>,
    last_scan_ms: Option<u64>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_MODULES).map(|_| None).collect(),
            events: Vec::new(),
            last_scan_ms: None,
        }
    }

    pub fn register(
        &mut self,
        descriptor: ModuleDescriptor,
        driver: Box<dyn Module>,
        now_ms: u64,
    ) -> Result<(), RegistryError> {
        descriptor.validate()?;
        if self.slot(descriptor.id).is_some() {
            return Err(RegistryError::DuplicateId(descriptor.id));
        }
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            return Err(RegistryError::TableFull(MAX_MODULES));
        };

        let id = descriptor.id;
        info!("registered module {} (id {id})", descriptor.name);
        self.events.push(ModuleEvent::Registered {
            id,
            name: descriptor.name.clone(),
        });

        let mut slot = Slot {
            descriptor,
            driver,
            detected: false,
            active: false,
            last_seen_ms: now_ms,
            last_update_ms: None,
            error_count: 0,
        };

        if slot.driver.detect() {
            slot.detected = true;
            if slot.descriptor.enabled {
                match slot.driver.initialize() {
                    Ok(()) => {
                        slot.active = true;
                        info!("module {} initialized and active", slot.descriptor.name);
                    }
                    Err(err) => {
                        warn!("module {} failed to initialize: {err}", slot.descriptor.name);
                        slot.descriptor.enabled = false;
                        slot.error_count = slot.error_count.saturating_add(1);
                        self.events.push(ModuleEvent::Fault {
                            id,
                            message: err.to_string(),
                            error_count: slot.error_count,
                        });
                    }
                }
            }
        } else {
            debug!("module {} not detected", slot.descriptor.name);
        }

        self.slots[index] = Some(slot);
        Ok(())
    }

    pub fn unregister(&mut self, id: u8) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        if let Some(mut slot) = self.slots[index].take() {
            slot.deactivate();
            info!("unregistered module {}", slot.descriptor.name);
            self.events.push(ModuleEvent::Removed {
                id,
                name: slot.descriptor.name,
            });
        }
        true
    }

    /// Enabling an undetected module only records the preference; it initializes once detected.
    pub fn set_enabled(&mut self, id: u8, enable: bool) -> bool {
        let Some(slot) = self.slot_mut(id) else {
            return false;
        };
        if slot.descriptor.enabled == enable {
            return true;
        }

        let event = if enable {
            if slot.detected {
                if let Err(err) = slot.driver.initialize() {
                    warn!("failed to enable module {}: {err}", slot.descriptor.name);
                    slot.error_count = slot.error_count.saturating_add(1);
                    let fault = ModuleEvent::Fault {
                        id,
                        message: err.to_string(),
                        error_count: slot.error_count,
                    };
                    self.events.push(fault);
                    return false;
                }
                slot.active = true;
                slot.error_count = 0;
                slot.last_update_ms = None;
            }
            slot.descriptor.enabled = true;
            info!("enabled module {}", slot.descriptor.name);
            ModuleEvent::Enabled { id }
        } else {
            slot.deactivate();
            slot.descriptor.enabled = false;
            info!("disabled module {}", slot.descriptor.name);
            ModuleEvent::Disabled { id }
        };
        self.events.push(event);
        true
    }

    /// Re-runs `detect` on every module and brings drivers up or down on transitions.
    pub fn scan(&mut self, now_ms: u64) {
        debug!("scanning {} modules", self.len());
        for slot in self.slots.iter_mut().flatten() {
            let id = slot.descriptor.id;
            let detected = slot.driver.detect();
            if detected {
                slot.last_seen_ms = now_ms;
            }
            if detected == slot.detected {
                continue;
            }
            slot.detected = detected;

            if detected {
                info!("module {} connected", slot.descriptor.name);
                self.events.push(ModuleEvent::Connected { id });
                if slot.descriptor.enabled {
                    match slot.driver.initialize() {
                        Ok(()) => {
                            slot.active = true;
                            slot.last_update_ms = None;
                        }
                        Err(err) => {
                            warn!(
                                "module {} reconnected but failed to initialize, disabling: {err}",
                                slot.descriptor.name
                            );
                            slot.descriptor.enabled = false;
                            slot.error_count = slot.error_count.saturating_add(1);
                            self.events.push(ModuleEvent::Fault {
                                id,
                                message: err.to_string(),
                                error_count: slot.error_count,
                            });
                            self.events.push(ModuleEvent::Disabled { id });
                        }
                    }
                }
            } else {
                info!("module {} disconnected", slot.descriptor.name);
                slot.deactivate();
                self.events.push(ModuleEvent::Disconnected { id });
            }
        }
    }

    /// Removes modules that have been absent for longer than the grace period.
    pub fn reap(&mut self, now_ms: u64) -> Vec<RemovedModule> {
        let mut removed = Vec::new();
        for entry in &mut self.slots {
            let expired = entry.as_ref().is_some_and(|slot| {
                !slot.detected && now_ms.saturating_sub(slot.last_seen_ms) > REAP_GRACE_MS
            });
            if !expired {
                continue;
            }
            if let Some(mut slot) = entry.take() {
                info!("removing disconnected module {}", slot.descriptor.name);
                slot.deactivate();
                self.events.push(ModuleEvent::Removed {
                    id: slot.descriptor.id,
                    name: slot.descriptor.name.clone(),
                });
                removed.push(RemovedModule {
                    descriptor: slot.descriptor,
                    driver: slot.driver,
                });
            }
        }
        removed
    }

    /// Runs `update` on active modules at most once per interval.
    pub fn tick(&mut self, now_ms: u64) {
        for slot in self.slots.iter_mut().flatten() {
            if !slot.active {
                continue;
            }
            let due = slot
                .last_update_ms
                .map_or(true, |last| now_ms.saturating_sub(last) >= UPDATE_INTERVAL_MS);
            if !due {
                continue;
            }
            slot.last_update_ms = Some(now_ms);

            let id = slot.descriptor.id;
            match slot.driver.update() {
                Ok(()) => slot.error_count = 0,
                Err(err) => {
                    slot.error_count = slot.error_count.saturating_add(1);
                    warn!(
                        "module {} update failed ({}): {err}",
                        slot.descriptor.name, slot.error_count
                    );
                    self.events.push(ModuleEvent::Fault {
                        id,
                        message: err.to_string(),
                        error_count: slot.error_count,
                    });
                    if slot.error_count >= MAX_CONSECUTIVE_FAILURES {
                        warn!("disabling module {} after repeated errors", slot.descriptor.name);
                        slot.deactivate();
                        slot.descriptor.enabled = false;
                        self.events.push(ModuleEvent::ForceDisabled {
                            id,
                            error_count: slot.error_count,
                        });
                    }
                }
            }
        }
    }

    /// `tick` every call, `scan` and `reap` once per scan interval.
    pub fn poll(&mut self, now_ms: u64) -> Vec<RemovedModule> {
        self.tick(now_ms);
        let last_scan = *self.last_scan_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(last_scan) < SCAN_INTERVAL_MS {
            return Vec::new();
        }
        self.last_scan_ms = Some(now_ms);
        self.scan(now_ms);
        self.reap(now_ms)
    }

    pub fn read_value(&mut self, id: u8, name: &str) -> Result<i32, ModuleError> {
        let slot = self.dispatch_target(id, Capabilities::INPUT)?;
        slot.driver.read_value(name)
    }

    pub fn write_value(&mut self, id: u8, name: &str, value: i32) -> Result<(), ModuleError> {
        let slot = self.dispatch_target(id, Capabilities::OUTPUT)?;
        slot.driver.write_value(name, value)
    }

    pub fn configure(&mut self, id: u8, config: &str) -> Result<(), ModuleError> {
        let slot = self.dispatch_target(id, Capabilities::CONFIGURABLE)?;
        slot.driver.configure(config)
    }

    pub fn status(&self, id: u8) -> Option<String> {
        self.slot(id).and_then(|slot| slot.driver.status())
    }

    pub fn get(&self, id: u8) -> Option<&ModuleDescriptor> {
        self.slot(id).map(|slot| &slot.descriptor)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| &slot.descriptor)
            .find(|descriptor| descriptor.name == name)
    }

    pub fn entries(&self) -> Vec<ModuleListEntry> {
        self.slots.iter().flatten().map(Slot::entry).collect()
    }

    pub fn is_active(&self, id: u8) -> bool {
        self.slot(id).is_some_and(|slot| slot.active)
    }

    pub fn is_detected(&self, id: u8) -> bool {
        self.slot(id).is_some_and(|slot| slot.detected)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().flatten().filter(|slot| slot.active).count()
    }

    pub fn take_events(&mut self) -> Vec<ModuleEvent> {
        std::mem::take(&mut self.events)
    }

    fn dispatch_target(&mut self, id: u8, required: Capabilities) -> Result<&mut Slot, ModuleError> {
        let slot = self
            .slot_mut(id)
            .ok_or_else(|| ModuleError::new(format!("module {id} not registered")))?;
        if !slot.active {
            return Err(ModuleError::new(format!("module {id} is not active")));
        }
        if !slot.descriptor.capabilities.contains(required) {
            return Err(ModuleError::new(format!(
                "module {id} lacks {required:?} capability"
            )));
        }
        Ok(slot)
    }

    fn index_of(&self, id: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.descriptor.id == id))
    }

    fn slot(&self, id: u8) -> Option<&Slot> {
        self.slots
            .iter()
            .flatten()
            .find(|slot| slot.descriptor.id == id)
    }

    fn slot_mut(&mut self, id: u8) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|slot| slot.descriptor.id == id)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::ScriptedModule;

    fn descriptor(id: u8) -> ModuleDescriptor {
        ModuleDescriptor::new(
            id,
            format!("module-{id}"),
            ModuleKind::Custom,
            InterfaceConfig::I2c {
                address: 0x20,
                clock_hz: 100_000,
            },
            Capabilities::INPUT | Capabilities::OUTPUT | Capabilities::HOTPLUG,
        )
        .enabled(true)
    }

    #[test]
    fn register_detects_and_initializes() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();

        registry.register(descriptor(1), Box::new(module), 0).unwrap();

        assert!(registry.is_active(1));
        assert_eq!(probe.lock().unwrap().init_calls, 1);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(
            registry.take_events(),
            vec![ModuleEvent::Registered {
                id: 1,
                name: "module-1".into()
            }]
        );
    }

    #[test]
    fn duplicate_id_is_rejected_and_registry_unchanged() {
        let mut registry = ModuleRegistry::new();
        let (first, _) = ScriptedModule::present();
        let (second, second_probe) = ScriptedModule::present();
        registry.register(descriptor(7), Box::new(first), 0).unwrap();
        let before = registry.entries();

        let mut other = descriptor(7);
        other.name = "imposter".into();
        let result = registry.register(other, Box::new(second), 10);

        assert_eq!(result, Err(RegistryError::DuplicateId(7)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entries()[0].name, before[0].name);
        assert_eq!(second_probe.lock().unwrap().detect_calls, 0);
    }

    #[test]
    fn invalid_descriptors_are_rejected() {
        let mut registry = ModuleRegistry::new();
        let mut unnamed = descriptor(1);
        unnamed.name.clear();
        let mut long_name = descriptor(2);
        long_name.name = "n".repeat(MAX_NAME_LEN + 1);
        let mut no_caps = descriptor(3);
        no_caps.capabilities = Capabilities::empty();
        let long_description = descriptor(4).with_description("d".repeat(MAX_DESCRIPTION_LEN + 1));

        let cases = [
            (unnamed, RegistryError::InvalidName(MAX_NAME_LEN)),
            (long_name, RegistryError::InvalidName(MAX_NAME_LEN)),
            (no_caps, RegistryError::NoCapabilities),
            (
                long_description,
                RegistryError::InvalidDescription(MAX_DESCRIPTION_LEN),
            ),
        ];
        for (descriptor, expected) in cases {
            let (module, _) = ScriptedModule::present();
            assert_eq!(registry.register(descriptor, Box::new(module), 0), Err(expected));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn table_full_is_rejected() {
        let mut registry = ModuleRegistry::new();
        for id in 0..MAX_MODULES as u8 {
            let (module, _) = ScriptedModule::present();
            registry.register(descriptor(id), Box::new(module), 0).unwrap();
        }
        let (module, _) = ScriptedModule::present();

        assert_eq!(
            registry.register(descriptor(200), Box::new(module), 0),
            Err(RegistryError::TableFull(MAX_MODULES))
        );
    }

    #[test]
    fn failed_initialize_reverts_enabled() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        probe.lock().unwrap().init_ok = false;

        registry.register(descriptor(3), Box::new(module), 0).unwrap();

        assert!(!registry.is_active(3));
        assert!(!registry.get(3).unwrap().enabled);

        probe.lock().unwrap().init_ok = true;
        registry.take_events();
        assert!(registry.set_enabled(3, true));
        assert!(registry.is_active(3));
        assert_eq!(registry.take_events(), vec![ModuleEvent::Enabled { id: 3 }]);
    }

    #[test]
    fn set_enabled_runs_lifecycle() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(4), Box::new(module), 0).unwrap();

        assert!(registry.set_enabled(4, false));
        assert!(!registry.is_active(4));
        assert_eq!(probe.lock().unwrap().shutdown_calls, 1);

        probe.lock().unwrap().init_ok = false;
        assert!(!registry.set_enabled(4, true));
        assert!(!registry.get(4).unwrap().enabled);
        assert!(!registry.set_enabled(99, true));
    }

    #[test]
    fn update_runs_once_per_interval() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(5), Box::new(module), 0).unwrap();

        registry.tick(0);
        registry.tick(500);
        registry.tick(999);
        registry.tick(1_000);

        assert_eq!(probe.lock().unwrap().update_calls, 2);
    }

    #[test]
    fn repeated_update_failures_force_disable() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(6), Box::new(module), 0).unwrap();
        probe.lock().unwrap().fail_updates = true;
        registry.take_events();

        for step in 0..u64::from(MAX_CONSECUTIVE_FAILURES) {
            registry.tick(step * UPDATE_INTERVAL_MS);
        }

        assert!(!registry.is_active(6));
        assert!(!registry.get(6).unwrap().enabled);
        let events = registry.take_events();
        assert_eq!(
            events.last(),
            Some(&ModuleEvent::ForceDisabled {
                id: 6,
                error_count: MAX_CONSECUTIVE_FAILURES
            })
        );
        assert_eq!(events.last().and_then(ModuleEvent::persisted_enablement), Some((6, false)));
        assert_eq!(probe.lock().unwrap().shutdown_calls, 1);
    }

    #[test]
    fn successful_update_resets_failure_streak() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(8), Box::new(module), 0).unwrap();

        let mut now = 0;
        for _ in 0..3 {
            for fail in [true, true, true, true, false] {
                probe.lock().unwrap().fail_updates = fail;
                registry.tick(now);
                now += UPDATE_INTERVAL_MS;
            }
        }

        assert!(registry.is_active(8));
    }

    #[test]
    fn scan_tracks_hot_plug_transitions() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(9), Box::new(module), 0).unwrap();
        registry.take_events();

        probe.lock().unwrap().present = false;
        registry.scan(1_000);
        assert!(!registry.is_active(9));
        assert!(!registry.is_detected(9));

        probe.lock().unwrap().present = true;
        registry.scan(2_000);
        assert!(registry.is_active(9));
        assert_eq!(
            registry.take_events(),
            vec![
                ModuleEvent::Disconnected { id: 9 },
                ModuleEvent::Connected { id: 9 }
            ]
        );
        assert_eq!(probe.lock().unwrap().init_calls, 2);
    }

    #[test]
    fn reconnect_with_failed_initialize_disables_module() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(11), Box::new(module), 0).unwrap();
        probe.lock().unwrap().present = false;
        registry.scan(1_000);
        registry.take_events();

        {
            let mut probe = probe.lock().unwrap();
            probe.present = true;
            probe.init_ok = false;
        }
        registry.scan(2_000);

        assert!(registry.is_detected(11));
        assert!(!registry.is_active(11));
        assert!(!registry.get(11).unwrap().enabled);
        let events = registry.take_events();
        assert_eq!(
            events,
            vec![
                ModuleEvent::Connected { id: 11 },
                ModuleEvent::Fault {
                    id: 11,
                    message: "module fault: init failed".into(),
                    error_count: 1,
                },
                ModuleEvent::Disabled { id: 11 },
            ]
        );
        assert_eq!(events[2].persisted_enablement(), Some((11, false)));
    }

    #[test]
    fn absent_module_is_reaped_after_grace_and_can_return() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(10), Box::new(module), 0).unwrap();

        registry.scan(4_000);
        probe.lock().unwrap().present = false;
        registry.scan(5_000);
        assert!(registry.reap(4_000 + REAP_GRACE_MS).is_empty());

        let mut removed = registry.reap(4_001 + REAP_GRACE_MS);
        assert_eq!(removed.len(), 1);
        assert!(registry.get(10).is_none());

        probe.lock().unwrap().present = true;
        let RemovedModule { descriptor, mut driver } = removed.remove(0);
        assert!(driver.detect());
        registry.register(descriptor, driver, 70_000).unwrap();
        assert!(registry.is_active(10));
    }

    #[test]
    fn poll_scans_on_interval() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(11), Box::new(module), 0).unwrap();
        let after_register = probe.lock().unwrap().detect_calls;

        registry.poll(0);
        registry.poll(SCAN_INTERVAL_MS - 1);
        assert_eq!(probe.lock().unwrap().detect_calls, after_register);

        registry.poll(SCAN_INTERVAL_MS);
        assert_eq!(probe.lock().unwrap().detect_calls, after_register + 1);
    }

    #[test]
    fn dispatch_checks_capabilities_and_activity() {
        let mut registry = ModuleRegistry::new();
        let (module, probe) = ScriptedModule::present();
        registry.register(descriptor(12), Box::new(module), 0).unwrap();

        registry.write_value(12, "relay1", 1).unwrap();
        assert_eq!(registry.read_value(12, "relay1"), Ok(1));
        assert!(registry.configure(12, "mode=fast").is_err());
        assert!(registry.read_value(13, "relay1").is_err());

        registry.set_enabled(12, false);
        assert!(registry.write_value(12, "relay1", 0).is_err());
        assert_eq!(probe.lock().unwrap().values.get("relay1"), Some(&1));
    }

    #[test]
    fn lookup_and_listing() {
        let mut registry = ModuleRegistry::new();
        let (module, _) = ScriptedModule::present();
        registry
            .register(
                descriptor(20).with_description("expander"),
                Box::new(module),
                0,
            )
            .unwrap();

        assert_eq!(registry.find_by_name("module-20").map(|d| d.id), Some(20));
        assert!(registry.find_by_name("missing").is_none());
        let entries = registry.entries();
        assert_eq!(entries[0].interface, InterfaceKind::I2c);
        assert_eq!(entries[0].capabilities, 0x43);
        assert_eq!(registry.status(20).as_deref(), Some("ok"));
        assert!(registry.unregister(20));
        assert!(!registry.unregister(20));
    }

    #[test]
    fn event_payloads_name_the_transition() {
        let payload = ModuleEvent::ForceDisabled {
            id: 3,
            error_count: 5,
        }
        .payload();

        assert_eq!(payload.event, "force_disabled");
        assert_eq!(payload.error_count, Some(5));
    }
}
