use log::{debug, info, warn};

use crate::{
    catalog,
    command::{
        ConfigCommand, Effect, LightsCommand, ModuleCommand, OtaCommand, PanelCommand, RELAY_CHANNELS,
    },
    config::ConfigRecord,
    config_store::{ConfigStore, DEFAULT_AUTO_SAVE_INTERVAL_MS},
    error::{CommandError, ConfigError, RegistryError},
    modules::{Module, ModuleDescriptor, ModuleEvent, ModuleRegistry, RemovedModule, SCAN_INTERVAL_MS},
    ota::{CancelHandle, FirmwareSlots, FirmwareSource, OtaAction, OtaManager, UpdatePolicy, UpdateRequest},
    queue::{publish_json, DrainReport, OutboundQueue, Outbox, StatusSink, Transport, MAX_DRAIN_PER_TICK},
    storage::{ByteRegion, FileStore},
    topics::{
        module_id_from_topic, relay_status_topic, TOPIC_COMMAND, TOPIC_CONFIG_COMMAND, TOPIC_CONFIG_EXPORT,
        TOPIC_CONFIG_STATUS, TOPIC_CONFIG_SUMMARY, TOPIC_EFFECTS, TOPIC_LIGHTS, TOPIC_MODULES_STATUS,
        TOPIC_OTA_COMMAND, TOPIC_STATUS, TOPIC_VOLUME,
    },
    types::{DeviceStatusPayload, EffectsPayload, LightsPayload, ModuleEventPayload},
};

pub const FACTORY_RESET_WINDOW_MS: u64 = 30_000;

/// Hardware effects the platform carries out on behalf of the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelAction {
    SetVolume(u8),
    SetLights(bool),
    SetBrightness(u8),
    SetMatrixBrightness(u8),
    SetRelay { channel: u8, on: bool },
    SetEffect(Effect),
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelState {
    pub volume: u8,
    pub lights_on: bool,
    pub brightness: u8,
    pub matrix_brightness: u8,
    pub effect: Effect,
    pub relays: [bool; RELAY_CHANNELS as usize],
}

impl PanelState {
    pub fn from_record(record: &ConfigRecord) -> Self {
        let prefs = &record.preferences;
        let hardware = &record.hardware;
        Self {
            volume: if prefs.mute_on_boot { 0 } else { prefs.default_volume },
            lights_on: prefs.lights_on_boot,
            brightness: prefs.default_brightness.min(hardware.led_strip.max_brightness),
            matrix_brightness: hardware.led_matrix.max_brightness,
            effect: Effect::from_index(hardware.led_matrix.default_effect).unwrap_or(Effect::Off),
            relays: [false; RELAY_CHANNELS as usize],
        }
    }

    /// Actions that bring freshly booted hardware in line with this state.
    pub fn actions(&self) -> Vec<PanelAction> {
        vec![
            PanelAction::SetVolume(self.volume),
            PanelAction::SetLights(self.lights_on),
            PanelAction::SetBrightness(self.brightness),
            PanelAction::SetMatrixBrightness(self.matrix_brightness),
            PanelAction::SetEffect(self.effect),
        ]
    }
}

impl Default for PanelState {
    fn default() -> Self {
        Self::from_record(&ConfigRecord::default())
    }
}

/// Owns the four subsystems and drives them from one cooperative tick.
pub struct Panel<R, F, S, P> {
    config: ConfigStore<R, F>,
    ota: OtaManager<S, P>,
    modules: ModuleRegistry,
    queue: OutboundQueue,
    state: PanelState,
    parked: Vec<RemovedModule>,
    last_parked_probe_ms: u64,
    factory_reset_deadline_ms: Option<u64>,
}

impl<R, F, S, P> Panel<R, F, S, P>
where
    R: ByteRegion,
    F: FileStore,
    S: FirmwareSource,
    P: FirmwareSlots,
{
    pub fn new(config: ConfigStore<R, F>, ota: OtaManager<S, P>) -> Self {
        Self {
            config,
            ota,
            modules: ModuleRegistry::new(),
            queue: OutboundQueue::default(),
            state: PanelState::default(),
            parked: Vec::new(),
            last_parked_probe_ms: 0,
            factory_reset_deadline_ms: None,
        }
    }

    pub fn config(&self) -> &ConfigStore<R, F> {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigStore<R, F> {
        &mut self.config
    }

    pub fn ota(&self) -> &OtaManager<S, P> {
        &self.ota
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn state(&self) -> &PanelState {
        &self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.ota.cancel_handle()
    }

    pub fn factory_reset_armed(&self) -> bool {
        self.factory_reset_deadline_ms.is_some()
    }

    /// Loads the configuration, confirms the running image and announces the initial state.
    pub fn boot<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) -> Vec<PanelAction> {
        if let Err(err) = self.config.initialize() {
            warn!("config storage unavailable: {err}");
        }
        let record = match self.config.load() {
            Ok(record) => record,
            Err(err) => {
                warn!("config load failed, running on defaults: {err}");
                ConfigRecord::default()
            }
        };
        self.config.enable_auto_save(DEFAULT_AUTO_SAVE_INTERVAL_MS);
        self.state = PanelState::from_record(&record);
        self.ota.set_policy(UpdatePolicy::from(&record.ota), now_ms);

        match self.ota.mark_current_version_valid() {
            Ok(true) => info!("boot confirmed, rollback cancelled"),
            Ok(false) => {}
            Err(err) => warn!("failed to confirm running image: {err}"),
        }

        let mut outbox = Outbox::new(&mut self.queue, transport, now_ms);
        self.ota.begin(now_ms, &mut outbox);
        self.publish_state(now_ms, transport);
        self.publish_config_summary(now_ms, transport);

        info!(
            "panel booted: firmware {}, volume {}, lights {}",
            self.ota.current_version(),
            self.state.volume,
            if self.state.lights_on { "on" } else { "off" }
        );
        self.state.actions()
    }

    /// Registers a module, applying persisted enablement over the descriptor default.
    pub fn register_module(
        &mut self,
        mut descriptor: ModuleDescriptor,
        driver: Box<dyn Module>,
        now_ms: u64,
    ) -> Result<(), RegistryError> {
        if let Some(enabled) = self.config.record().module_enabled(descriptor.id) {
            descriptor.enabled = enabled;
        }
        self.modules.register(descriptor, driver, now_ms)
    }

    /// Registers every catalog module the platform has a driver for.
    pub fn register_builtin_modules(
        &mut self,
        mut driver_for: impl FnMut(&ModuleDescriptor) -> Option<Box<dyn Module>>,
        now_ms: u64,
    ) -> usize {
        let mut registered = 0;
        for descriptor in catalog::builtin_modules() {
            let Some(driver) = driver_for(&descriptor) else {
                debug!("no driver for built-in module {}", descriptor.name);
                continue;
            };
            let name = descriptor.name.clone();
            match self.register_module(descriptor, driver, now_ms) {
                Ok(()) => registered += 1,
                Err(err) => warn!("failed to register {name}: {err}"),
            }
        }
        registered
    }

    pub fn tick<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) -> Vec<PanelAction> {
        let mut actions = Vec::new();

        self.config.handle_auto_save(now_ms);

        let removed = self.modules.poll(now_ms);
        self.parked.extend(removed);
        self.probe_parked(now_ms);
        self.publish_module_events(now_ms, transport);

        let mut outbox = Outbox::new(&mut self.queue, transport, now_ms);
        if let Some(OtaAction::Restart) = self.ota.tick(now_ms, &mut outbox) {
            actions.push(PanelAction::Restart);
        }

        if self
            .factory_reset_deadline_ms
            .is_some_and(|deadline| now_ms > deadline)
        {
            info!("factory reset confirmation window expired");
            self.factory_reset_deadline_ms = None;
        }

        let DrainReport { aborted, .. } = self.queue.drain(transport, MAX_DRAIN_PER_TICK, now_ms);
        if aborted {
            debug!("queue drain stopped, {} messages waiting", self.queue.len());
        }
        actions
    }

    pub fn handle_message<T: Transport + ?Sized>(
        &mut self,
        topic: &str,
        payload: &[u8],
        now_ms: u64,
        transport: &mut T,
    ) -> Vec<PanelAction> {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => {
                warn!("ignoring non-UTF-8 payload on {topic}");
                return Vec::new();
            }
        };
        debug!("message on {topic}: {text}");

        let result = match topic {
            TOPIC_COMMAND => PanelCommand::parse(text)
                .map(|command| self.apply_command(command, now_ms, transport)),
            TOPIC_OTA_COMMAND => OtaCommand::parse(text)
                .map(|command| self.apply_ota_command(command, now_ms, transport)),
            TOPIC_CONFIG_COMMAND => ConfigCommand::parse(text)
                .map(|command| self.apply_config_command(command, now_ms, transport)),
            _ => match module_id_from_topic(topic) {
                Some(id) => ModuleCommand::parse(text).map(|command| {
                    self.apply_module_command(id, command, now_ms, transport);
                    Vec::new()
                }),
                None => {
                    debug!("no handler for {topic}");
                    Ok(Vec::new())
                }
            },
        };

        result.unwrap_or_else(|err: CommandError| {
            warn!("rejected command on {topic}: {err}");
            Vec::new()
        })
    }

    pub fn snapshot(&self, now_ms: u64) -> DeviceStatusPayload {
        DeviceStatusPayload {
            firmware_version: self.ota.current_version().to_string(),
            uptime_ms: now_ms,
            volume: self.state.volume,
            lights_on: self.state.lights_on,
            brightness: self.state.brightness,
            matrix_brightness: self.state.matrix_brightness,
            effect: self.state.effect.as_str().to_string(),
            modules_registered: self.modules.len(),
            modules_active: self.modules.active_count(),
            queue_depth: self.queue.len(),
            ota_state: self.ota.state(),
            config_dirty: self.config.has_changed(),
        }
    }

    fn apply_command<T: Transport + ?Sized>(
        &mut self,
        command: PanelCommand,
        now_ms: u64,
        transport: &mut T,
    ) -> Vec<PanelAction> {
        let strip_max = self.config.record().hardware.led_strip.max_brightness;
        let matrix_max = self.config.record().hardware.led_matrix.max_brightness;

        let actions = match command {
            PanelCommand::Volume(volume) => {
                self.state.volume = volume;
                self.publish_volume(now_ms, transport);
                self.remember_state();
                vec![PanelAction::SetVolume(volume)]
            }
            PanelCommand::Lights(lights) => {
                self.state.lights_on = match lights {
                    LightsCommand::On => true,
                    LightsCommand::Off => false,
                    LightsCommand::Toggle => !self.state.lights_on,
                };
                self.publish_lights(now_ms, transport);
                self.remember_state();
                vec![PanelAction::SetLights(self.state.lights_on)]
            }
            PanelCommand::Brightness(level) => {
                self.state.brightness = level.min(strip_max);
                self.publish_lights(now_ms, transport);
                self.remember_state();
                vec![PanelAction::SetBrightness(self.state.brightness)]
            }
            PanelCommand::MatrixBrightness(level) => {
                self.state.matrix_brightness = level.min(matrix_max);
                self.publish_effects(now_ms, transport);
                vec![PanelAction::SetMatrixBrightness(self.state.matrix_brightness)]
            }
            PanelCommand::Relay { channel, on } => {
                let Some(slot) = channel
                    .checked_sub(1)
                    .and_then(|index| self.state.relays.get_mut(usize::from(index)))
                else {
                    warn!("relay channel {channel} out of range");
                    return Vec::new();
                };
                *slot = on;
                let payload = if on { "ON" } else { "OFF" };
                self.outbox(transport, now_ms)
                    .publish(&relay_status_topic(channel), payload.as_bytes(), true);
                vec![PanelAction::SetRelay { channel, on }]
            }
            PanelCommand::Effect(effect) => {
                self.state.effect = effect;
                self.publish_effects(now_ms, transport);
                vec![PanelAction::SetEffect(effect)]
            }
            PanelCommand::Status => {
                self.publish_state(now_ms, transport);
                Vec::new()
            }
            PanelCommand::Reboot => {
                info!("reboot requested");
                vec![PanelAction::Restart]
            }
            PanelCommand::Ota(command) => return self.apply_ota_command(command, now_ms, transport),
        };
        self.publish_status(now_ms, transport);
        actions
    }

    fn apply_ota_command<T: Transport + ?Sized>(
        &mut self,
        command: OtaCommand,
        now_ms: u64,
        transport: &mut T,
    ) -> Vec<PanelAction> {
        if let OtaCommand::SetAutoUpdate(enabled) = command {
            if let Err(err) = self.config.set_auto_update(enabled) {
                warn!("failed to persist auto-update flag: {err}");
            }
        }

        let mut outbox = Outbox::new(&mut self.queue, transport, now_ms);
        match command {
            OtaCommand::CheckUpdate => {
                self.ota.check_for_updates(now_ms, &mut outbox);
            }
            OtaCommand::StartUpdate => {
                if !self.ota.start_update(UpdateRequest::Available, now_ms, &mut outbox) {
                    self.ota.publish_status(&mut outbox);
                }
            }
            OtaCommand::CancelUpdate => {
                if !self.ota.cancel_update(now_ms, &mut outbox) {
                    info!("nothing to cancel");
                }
            }
            OtaCommand::Rollback => {
                self.ota.rollback_to_previous(now_ms, &mut outbox);
            }
            OtaCommand::SetAutoUpdate(enabled) => {
                self.ota.set_auto_update(enabled, now_ms, &mut outbox);
            }
            OtaCommand::MarkValid => {
                if let Err(err) = self.ota.mark_current_version_valid() {
                    warn!("mark valid failed: {err}");
                }
                self.ota.publish_status(&mut outbox);
            }
            OtaCommand::ForceUpdate { url, checksum } => {
                self.ota
                    .start_update(UpdateRequest::Forced { url, checksum }, now_ms, &mut outbox);
            }
            OtaCommand::GetStatus => self.ota.publish_status(&mut outbox),
        }
        // Success and rollback restarts are scheduled and surface through `tick`.
        Vec::new()
    }

    fn apply_config_command<T: Transport + ?Sized>(
        &mut self,
        command: ConfigCommand,
        now_ms: u64,
        transport: &mut T,
    ) -> Vec<PanelAction> {
        let mut actions = Vec::new();
        let result: Result<(), ConfigError> = match command {
            ConfigCommand::GetConfig => {
                self.publish_config(now_ms, transport);
                Ok(())
            }
            ConfigCommand::SetWifi { ssid, password } => self
                .config
                .set_wifi_credentials(&ssid, &password)
                .and_then(|()| self.config.save(false)),
            ConfigCommand::SetMqtt {
                server,
                port,
                credentials,
            } => self
                .config
                .set_mqtt_server(&server, port)
                .and_then(|()| match &credentials {
                    Some((user, password)) => self.config.set_mqtt_credentials(user, password),
                    None => Ok(()),
                })
                .and_then(|()| self.config.save(false)),
            ConfigCommand::ResetConfig => self.config.reset().map(|()| {
                self.apply_record(now_ms);
                actions = self.state.actions();
            }),
            ConfigCommand::BackupConfig => self.config.backup(),
            ConfigCommand::RestoreConfig => self.config.restore().map(|_| {
                self.apply_record(now_ms);
                actions = self.state.actions();
            }),
            ConfigCommand::SaveConfig => self.config.save(true),
            ConfigCommand::ExportConfig => self.config.to_json().map(|json| {
                self.outbox(transport, now_ms)
                    .publish(TOPIC_CONFIG_EXPORT, json.as_bytes(), false);
            }),
            ConfigCommand::ImportConfig(json) => self
                .config
                .from_json(&json)
                .and_then(|()| self.config.save(true))
                .map(|()| {
                    self.apply_record(now_ms);
                    actions = self.state.actions();
                }),
            ConfigCommand::FactoryReset => {
                let deadline = now_ms.saturating_add(FACTORY_RESET_WINDOW_MS);
                warn!("factory reset requested, confirm within {FACTORY_RESET_WINDOW_MS} ms");
                self.factory_reset_deadline_ms = Some(deadline);
                Ok(())
            }
            ConfigCommand::ConfirmFactoryReset => match self.factory_reset_deadline_ms.take() {
                Some(deadline) if now_ms <= deadline => {
                    warn!("performing factory reset");
                    let result = self.config.factory_reset();
                    self.queue.clear();
                    actions.push(PanelAction::Restart);
                    result
                }
                _ => {
                    warn!("no factory reset pending");
                    Ok(())
                }
            },
        };

        match result {
            Ok(()) => info!("config command applied"),
            Err(err) => warn!("config command failed: {err}"),
        }
        self.publish_config_summary(now_ms, transport);
        actions
    }

    fn apply_module_command<T: Transport + ?Sized>(
        &mut self,
        id: u8,
        command: ModuleCommand,
        now_ms: u64,
        transport: &mut T,
    ) {
        let result = match &command {
            ModuleCommand::WriteValue { name, value } => self.modules.write_value(id, name, *value),
            ModuleCommand::Configure(config) => self.modules.configure(id, config),
        };
        let payload = match result {
            Ok(()) => ModuleEventPayload {
                event: "command_applied",
                id,
                name: self.modules.get(id).map(|descriptor| descriptor.name.clone()),
                message: None,
                error_count: None,
            },
            Err(err) => {
                warn!("module {id} rejected {command:?}: {err}");
                ModuleEventPayload {
                    event: "command_rejected",
                    id,
                    name: self.modules.get(id).map(|descriptor| descriptor.name.clone()),
                    message: Some(err.to_string()),
                    error_count: None,
                }
            }
        };
        publish_json(
            &mut self.outbox(transport, now_ms),
            TOPIC_MODULES_STATUS,
            &payload,
            false,
        );
    }

    /// Re-registers parked modules whose hardware has come back.
    fn probe_parked(&mut self, now_ms: u64) {
        if self.parked.is_empty()
            || now_ms.saturating_sub(self.last_parked_probe_ms) < SCAN_INTERVAL_MS
        {
            return;
        }
        self.last_parked_probe_ms = now_ms;

        let mut still_parked = Vec::new();
        for RemovedModule {
            descriptor,
            mut driver,
        } in std::mem::take(&mut self.parked)
        {
            if !driver.detect() {
                still_parked.push(RemovedModule { descriptor, driver });
                continue;
            }
            let name = descriptor.name.clone();
            info!("module {name} reappeared, registering again");
            if let Err(err) = self.register_module(descriptor, driver, now_ms) {
                warn!("failed to re-register {name}: {err}");
            }
        }
        self.parked = still_parked;
    }

    fn publish_module_events<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) {
        for event in self.modules.take_events() {
            if let Some((id, enabled)) = event.persisted_enablement() {
                if let Err(err) = self.config.set_module_enabled(id, enabled) {
                    warn!("failed to persist module {id} enablement: {err}");
                }
            }
            if let ModuleEvent::ForceDisabled { id, error_count } = &event {
                warn!("module {id} force-disabled after {error_count} errors");
            }
            publish_json(
                &mut self.outbox(transport, now_ms),
                TOPIC_MODULES_STATUS,
                &event.payload(),
                false,
            );
        }
    }

    fn apply_record(&mut self, now_ms: u64) {
        let record = self.config.record().clone();
        self.state = PanelState::from_record(&record);
        self.ota.set_policy(UpdatePolicy::from(&record.ota), now_ms);
    }

    fn remember_state(&mut self) {
        if !self.config.record().preferences.remember_state {
            return;
        }
        let volume = self.state.volume.min(100);
        if let Err(err) =
            self.config
                .set_user_preferences(volume, self.state.lights_on, self.state.brightness)
        {
            warn!("failed to remember panel state: {err}");
        }
    }

    fn outbox<'a, T: Transport + ?Sized>(
        &'a mut self,
        transport: &'a mut T,
        now_ms: u64,
    ) -> Outbox<'a, T> {
        Outbox::new(&mut self.queue, transport, now_ms)
    }

    fn publish_state<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) {
        self.publish_volume(now_ms, transport);
        self.publish_lights(now_ms, transport);
        self.publish_effects(now_ms, transport);
        self.publish_status(now_ms, transport);
    }

    fn publish_volume<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) {
        let payload = self.state.volume.to_string();
        self.outbox(transport, now_ms)
            .publish(TOPIC_VOLUME, payload.as_bytes(), true);
    }

    fn publish_lights<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) {
        let payload = LightsPayload {
            state: if self.state.lights_on { "ON" } else { "OFF" },
            brightness: self.state.brightness,
        };
        publish_json(&mut self.outbox(transport, now_ms), TOPIC_LIGHTS, &payload, true);
    }

    fn publish_effects<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) {
        let payload = EffectsPayload {
            effect: self.state.effect.as_str().to_string(),
            matrix_brightness: self.state.matrix_brightness,
        };
        publish_json(&mut self.outbox(transport, now_ms), TOPIC_EFFECTS, &payload, true);
    }

    fn publish_status<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) {
        let payload = self.snapshot(now_ms);
        publish_json(&mut self.outbox(transport, now_ms), TOPIC_STATUS, &payload, true);
    }

    fn publish_config<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) {
        match self.config.to_json() {
            Ok(json) => {
                self.outbox(transport, now_ms)
                    .publish(TOPIC_CONFIG_STATUS, json.as_bytes(), true);
            }
            Err(err) => warn!("failed to export config: {err}"),
        }
    }

    fn publish_config_summary<T: Transport + ?Sized>(&mut self, now_ms: u64, transport: &mut T) {
        let summary = self.config.summary();
        publish_json(
            &mut self.outbox(transport, now_ms),
            TOPIC_CONFIG_SUMMARY,
            &summary,
            true,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        catalog::{BUZZER_ID, RELAY_EXPANSION_ID},
        config_store::CONFIG_FILE,
        modules::{MAX_CONSECUTIVE_FAILURES, REAP_GRACE_MS},
        ota::SlotState,
        storage::{MemoryFiles, MemoryRegion},
        testing::{ModuleProbe, ScriptedModule, ScriptedSlots, ScriptedSource, ScriptedTransport},
        topics::TOPIC_OTA_STATUS,
        types::OtaState,
    };

    type TestPanel = Panel<MemoryRegion, MemoryFiles, ScriptedSource, ScriptedSlots>;

    fn panel_with(slots: ScriptedSlots) -> TestPanel {
        let store = ConfigStore::new(MemoryRegion::new(1024), MemoryFiles::default());
        let source = ScriptedSource::serving(Vec::new(), Vec::new());
        let ota = OtaManager::new(source, slots, "1.0.0", UpdatePolicy::default());
        Panel::new(store, ota)
    }

    fn booted() -> (TestPanel, ScriptedTransport) {
        let mut panel = panel_with(ScriptedSlots::default());
        let mut transport = ScriptedTransport::connected();
        panel.boot(0, &mut transport);
        transport.sent.clear();
        (panel, transport)
    }

    fn relay_module(panel: &mut TestPanel, now_ms: u64) -> Arc<Mutex<ModuleProbe>> {
        let (module, probe) = ScriptedModule::present();
        panel
            .register_module(catalog::relay_expansion(), Box::new(module), now_ms)
            .unwrap();
        probe
    }

    #[test]
    fn boot_publishes_state_and_returns_initial_actions() {
        let mut panel = panel_with(ScriptedSlots::default());
        let mut transport = ScriptedTransport::connected();

        let actions = panel.boot(0, &mut transport);

        assert_eq!(
            actions,
            vec![
                PanelAction::SetVolume(0),
                PanelAction::SetLights(false),
                PanelAction::SetBrightness(0),
                PanelAction::SetMatrixBrightness(128),
                PanelAction::SetEffect(Effect::Off),
            ]
        );
        let topics = transport.topics();
        assert!(topics.contains(&TOPIC_OTA_STATUS.to_string()));
        assert!(topics.contains(&TOPIC_STATUS.to_string()));
        assert!(topics.contains(&TOPIC_CONFIG_SUMMARY.to_string()));
        assert!(panel.config().is_loaded());
        assert!(panel.config_mut().files_mut().get(CONFIG_FILE).is_some());
    }

    #[test]
    fn boot_enables_auto_save_at_store_default() {
        let (mut panel, mut transport) = booted();
        panel.config_mut().set_wifi_timeout(5_000).unwrap();

        panel.tick(100, &mut transport);
        panel.tick(100 + DEFAULT_AUTO_SAVE_INTERVAL_MS - 1, &mut transport);
        assert!(panel.config().has_changed());

        panel.tick(100 + DEFAULT_AUTO_SAVE_INTERVAL_MS, &mut transport);
        assert!(!panel.config().has_changed());
    }

    #[test]
    fn boot_confirms_pending_image() {
        let slots = ScriptedSlots {
            running: SlotState::PendingVerify,
            ..ScriptedSlots::default()
        };
        let mut panel = panel_with(slots);
        let mut transport = ScriptedTransport::connected();

        panel.boot(0, &mut transport);

        assert_eq!(panel.ota().slots().running, SlotState::Valid);
    }

    #[test]
    fn main_commands_update_state_and_publish() {
        let (mut panel, mut transport) = booted();

        let actions = panel.handle_message(TOPIC_COMMAND, b"VOLUME:150", 10, &mut transport);
        assert_eq!(actions, vec![PanelAction::SetVolume(100)]);
        assert_eq!(transport.last_on(TOPIC_VOLUME).unwrap().text(), "100");

        let actions = panel.handle_message(TOPIC_COMMAND, b"LIGHTS:TOGGLE", 20, &mut transport);
        assert_eq!(actions, vec![PanelAction::SetLights(true)]);
        assert_eq!(transport.last_on(TOPIC_LIGHTS).unwrap().json()["state"], "ON");

        let actions = panel.handle_message(TOPIC_COMMAND, b"RELAY3:ON", 30, &mut transport);
        assert_eq!(actions, vec![PanelAction::SetRelay { channel: 3, on: true }]);
        assert_eq!(panel.state().relays, [false, false, true, false]);
        assert_eq!(transport.last_on(&relay_status_topic(3)).unwrap().text(), "ON");

        let actions = panel.handle_message(TOPIC_COMMAND, b"EFFECT:rainbow", 40, &mut transport);
        assert_eq!(actions, vec![PanelAction::SetEffect(Effect::Rainbow)]);
        assert_eq!(transport.last_on(TOPIC_EFFECTS).unwrap().json()["effect"], "RAINBOW");
    }

    #[test]
    fn matrix_brightness_is_capped_by_hardware_limit() {
        let (mut panel, mut transport) = booted();

        let actions =
            panel.handle_message(TOPIC_COMMAND, b"MATRIX_BRIGHTNESS:255", 10, &mut transport);

        assert_eq!(actions, vec![PanelAction::SetMatrixBrightness(128)]);
    }

    #[test]
    fn remembered_state_marks_config_dirty() {
        let (mut panel, mut transport) = booted();
        assert!(!panel.config().has_changed());

        panel.handle_message(TOPIC_COMMAND, b"VOLUME:40", 10, &mut transport);

        assert!(panel.config().has_changed());
        assert_eq!(panel.config().record().preferences.default_volume, 40);
    }

    #[test]
    fn invalid_commands_change_nothing() {
        let (mut panel, mut transport) = booted();
        let before = panel.state().clone();

        assert!(panel
            .handle_message(TOPIC_COMMAND, b"VOLUME:loud", 10, &mut transport)
            .is_empty());
        assert!(panel
            .handle_message(TOPIC_COMMAND, b"SELF_DESTRUCT", 10, &mut transport)
            .is_empty());
        assert!(panel
            .handle_message("homecontrol/unknown", b"x", 10, &mut transport)
            .is_empty());

        assert_eq!(panel.state(), &before);
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn reboot_and_ota_prefix_on_main_topic() {
        let (mut panel, mut transport) = booted();

        assert_eq!(
            panel.handle_message(TOPIC_COMMAND, b"REBOOT", 10, &mut transport),
            vec![PanelAction::Restart]
        );

        transport.sent.clear();
        panel.handle_message(TOPIC_COMMAND, b"OTA:get_status", 20, &mut transport);
        assert_eq!(transport.topics(), vec![TOPIC_OTA_STATUS.to_string()]);
    }

    #[test]
    fn set_auto_update_is_persisted_and_applied() {
        let (mut panel, mut transport) = booted();

        panel.handle_message(TOPIC_OTA_COMMAND, b"set_auto_update:true", 10, &mut transport);

        assert!(panel.config().record().ota.auto_update);
        assert!(panel.ota().policy().auto_update);
    }

    #[test]
    fn factory_reset_requires_confirmation_within_window() {
        let (mut panel, mut transport) = booted();
        panel.handle_message(TOPIC_COMMAND, b"VOLUME:60", 10, &mut transport);

        let early = panel.handle_message(
            TOPIC_CONFIG_COMMAND,
            b"confirm_factory_reset",
            20,
            &mut transport,
        );
        assert!(early.is_empty());

        panel.handle_message(TOPIC_CONFIG_COMMAND, b"factory_reset", 100, &mut transport);
        assert!(panel.factory_reset_armed());
        let actions = panel.handle_message(
            TOPIC_CONFIG_COMMAND,
            b"confirm_factory_reset",
            100 + FACTORY_RESET_WINDOW_MS,
            &mut transport,
        );

        assert_eq!(actions, vec![PanelAction::Restart]);
        assert_eq!(panel.config().record(), &ConfigRecord::default());
        assert!(panel.queue().is_empty());
    }

    #[test]
    fn factory_reset_window_expires_on_tick() {
        let (mut panel, mut transport) = booted();
        panel.handle_message(TOPIC_CONFIG_COMMAND, b"factory_reset", 100, &mut transport);

        panel.tick(101 + FACTORY_RESET_WINDOW_MS, &mut transport);

        assert!(!panel.factory_reset_armed());
    }

    #[test]
    fn export_and_import_round_through_topics() {
        let (mut panel, mut transport) = booted();
        panel
            .config_mut()
            .set_wifi_credentials("home", "secret")
            .unwrap();

        panel.handle_message(TOPIC_CONFIG_COMMAND, b"export_config", 10, &mut transport);
        let exported = transport.last_on(TOPIC_CONFIG_EXPORT).unwrap().text();
        assert!(!transport.last_on(TOPIC_CONFIG_EXPORT).unwrap().retain);

        panel.handle_message(TOPIC_CONFIG_COMMAND, b"reset_config", 20, &mut transport);
        assert_eq!(panel.config().record().wifi.ssid, "");

        let import = format!("import_config:{exported}");
        panel.handle_message(TOPIC_CONFIG_COMMAND, import.as_bytes(), 30, &mut transport);
        assert_eq!(panel.config().record().wifi.ssid, "home");
        assert!(!panel.config().has_changed());
    }

    #[test]
    fn set_wifi_saves_immediately() {
        let (mut panel, mut transport) = booted();

        panel.handle_message(
            TOPIC_CONFIG_COMMAND,
            br#"set_wifi:{"ssid":"attic","password":"pw"}"#,
            10,
            &mut transport,
        );

        assert_eq!(panel.config().record().wifi.ssid, "attic");
        assert!(!panel.config().has_changed());
        assert!(transport.last_on(TOPIC_CONFIG_SUMMARY).unwrap().json()["wifi_configured"]
            .as_bool()
            .unwrap());
    }

    #[test]
    fn persisted_enablement_overrides_catalog_default() {
        let (mut panel, _) = booted();
        panel
            .config_mut()
            .set_module_enabled(RELAY_EXPANSION_ID, true)
            .unwrap();

        relay_module(&mut panel, 0);

        assert!(panel.modules().is_active(RELAY_EXPANSION_ID));
    }

    #[test]
    fn builtins_register_only_with_drivers() {
        let (mut panel, _) = booted();

        let registered = panel.register_builtin_modules(
            |descriptor| {
                (descriptor.id == BUZZER_ID).then(|| {
                    let (module, _) = ScriptedModule::present();
                    Box::new(module) as Box<dyn Module>
                })
            },
            0,
        );

        assert_eq!(registered, 1);
        assert_eq!(panel.modules().len(), 1);
        assert!(!panel.modules().is_active(BUZZER_ID));
    }

    #[test]
    fn module_set_topic_dispatches_to_driver() {
        let (mut panel, mut transport) = booted();
        panel
            .config_mut()
            .set_module_enabled(RELAY_EXPANSION_ID, true)
            .unwrap();
        let probe = relay_module(&mut panel, 0);

        panel.handle_message("homecontrol/modules/100/set", b"relay2:1", 10, &mut transport);
        assert_eq!(probe.lock().unwrap().values.get("relay2"), Some(&1));
        let reply = transport.last_on(TOPIC_MODULES_STATUS).unwrap().json();
        assert_eq!(reply["event"], "command_applied");

        panel.handle_message("homecontrol/modules/100/set", b"mode=latched", 20, &mut transport);
        assert_eq!(probe.lock().unwrap().configured, vec!["mode=latched".to_string()]);

        panel.handle_message("homecontrol/modules/7/set", b"x:1", 30, &mut transport);
        let reply = transport.last_on(TOPIC_MODULES_STATUS).unwrap().json();
        assert_eq!(reply["event"], "command_rejected");
    }

    #[test]
    fn force_disable_is_published_and_persisted() {
        let (mut panel, mut transport) = booted();
        panel
            .config_mut()
            .set_module_enabled(RELAY_EXPANSION_ID, true)
            .unwrap();
        let probe = relay_module(&mut panel, 0);
        probe.lock().unwrap().fail_updates = true;

        for step in 0..u64::from(MAX_CONSECUTIVE_FAILURES) {
            panel.tick(step * 1_000, &mut transport);
        }

        assert!(!panel.modules().is_active(RELAY_EXPANSION_ID));
        assert_eq!(
            panel.config().record().module_enabled(RELAY_EXPANSION_ID),
            Some(false)
        );
        let events: Vec<String> = transport
            .sent
            .iter()
            .filter(|message| message.topic == TOPIC_MODULES_STATUS)
            .map(|message| message.json()["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(events.last().map(String::as_str), Some("force_disabled"));
    }

    #[test]
    fn reaped_module_is_registered_again_when_it_returns() {
        let (mut panel, mut transport) = booted();
        panel
            .config_mut()
            .set_module_enabled(RELAY_EXPANSION_ID, true)
            .unwrap();
        let probe = relay_module(&mut panel, 0);

        probe.lock().unwrap().present = false;
        let mut now = 0;
        while panel.modules().get(RELAY_EXPANSION_ID).is_some() {
            now += SCAN_INTERVAL_MS;
            panel.tick(now, &mut transport);
            assert!(now <= 4 * SCAN_INTERVAL_MS + REAP_GRACE_MS);
        }

        probe.lock().unwrap().present = true;
        panel.tick(now + SCAN_INTERVAL_MS, &mut transport);

        assert!(panel.modules().is_active(RELAY_EXPANSION_ID));
    }

    #[test]
    fn messages_queue_while_offline_and_drain_on_tick() {
        let (mut panel, _) = booted();
        let mut offline = ScriptedTransport::disconnected();

        panel.handle_message(TOPIC_COMMAND, b"VOLUME:30", 10, &mut offline);
        assert!(!panel.queue().is_empty());

        let mut online = ScriptedTransport::connected();
        let depth = panel.queue().len();
        panel.tick(20, &mut online);

        assert_eq!(online.sent.len(), depth.min(MAX_DRAIN_PER_TICK));
        assert_eq!(online.topics()[0], TOPIC_VOLUME);
    }

    #[test]
    fn snapshot_reflects_subsystems() {
        let (mut panel, mut transport) = booted();
        panel.handle_message(TOPIC_COMMAND, b"BRIGHTNESS:77", 10, &mut transport);

        let snapshot = panel.snapshot(50);

        assert_eq!(snapshot.firmware_version, "1.0.0");
        assert_eq!(snapshot.brightness, 77);
        assert_eq!(snapshot.ota_state, OtaState::Idle);
        assert_eq!(snapshot.uptime_ms, 50);
    }
}
