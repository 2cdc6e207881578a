use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TryRecvError},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method, Status},
    io::Read,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, Input, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::{EspOta, SlotState as EspSlotState},
    sys::{self, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use homecontrol_common::{
    catalog::MOTION_SENSOR_ID,
    config::{MqttSettings, WifiSettings},
    error::{ModuleError, StorageError, TransportError, UpdateError},
    modules::{InterfaceConfig, Module, ModuleDescriptor},
    ota::{FirmwareSlots, FirmwareSource, FirmwareStream, SlotState},
    storage::{ByteRegion, FileStore},
    ConfigStore, OtaManager, Panel, PanelAction, Transport, UpdatePolicy, SUBSCRIBED_TOPICS,
};

const NVS_FILES_NAMESPACE: &str = "hc_cfg";
const NVS_IMAGE_NAMESPACE: &str = "hc_img";
const NVS_IMAGE_KEY: &str = "image";
const NVS_KEY_MAX_LEN: usize = 15;
const REGION_CAPACITY: usize = 4_096;
const MAX_FILE_BYTES: usize = 8_192;
const MAX_DESCRIPTOR_BYTES: usize = 16 * 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 4_096;
const INBOX_CAPACITY: usize = 32;
const CONTROL_TICK_MS: u64 = 20;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const RESTART_FLUSH_MS: u64 = 200;

type DevicePanel = Panel<NvsRegion, NvsFiles, HttpFirmwareSource, EspFirmwareSlots>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let store = ConfigStore::new(
        NvsRegion::new(nvs_partition.clone()),
        NvsFiles::new(nvs_partition.clone()),
    );
    let ota = OtaManager::new(
        HttpFirmwareSource,
        EspFirmwareSlots::default(),
        env!("CARGO_PKG_VERSION"),
        UpdatePolicy::default(),
    );
    let mut panel: DevicePanel = Panel::new(store, ota);
    let mut link = MqttLink {
        client: None,
        connected: Arc::new(AtomicBool::new(false)),
    };

    let boot_actions = panel.boot(monotonic_ms(), &mut link);
    let record = panel.config().record().clone();
    info!(
        "config loaded from {:?}: ssid=`{}`, mqtt=`{}:{}`",
        panel.config().source(),
        record.wifi.ssid,
        record.mqtt.server,
        record.mqtt.port,
    );
    execute_actions(&boot_actions);

    let registered = panel.register_builtin_modules(builtin_driver, monotonic_ms());
    info!("{registered} built-in module drivers registered");

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = if record.wifi.auto_connect {
        match connect_wifi(modem, sys_loop, nvs_partition, &record.wifi) {
            Ok(wifi) => Some(wifi),
            Err(err) => {
                warn!("wifi unavailable, status stays queued: {err:#}");
                None
            }
        }
    } else {
        info!("wifi auto-connect disabled");
        None
    };

    let (inbox_tx, inbox_rx) = mpsc::sync_channel(INBOX_CAPACITY);
    if wifi.is_some() && record.mqtt.auto_connect && !record.mqtt.server.is_empty() {
        let (client, conn) = create_mqtt_client(&record.mqtt)?;
        let client = Arc::new(Mutex::new(client));
        spawn_mqtt_receiver(conn, Arc::clone(&client), Arc::clone(&link.connected), inbox_tx);
        link.client = Some(client);
    } else {
        warn!("mqtt not started");
    }

    if record.system.watchdog {
        init_watchdog(record.system.watchdog_timeout)?;
        add_current_task_to_watchdog()?;
    }

    // Keep wifi alive for the program lifetime.
    let _wifi = wifi;
    control_loop(panel, link, inbox_rx)
}

fn control_loop(
    mut panel: DevicePanel,
    mut link: MqttLink,
    inbox: Receiver<(String, Vec<u8>)>,
) -> anyhow::Result<()> {
    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();
        let mut actions = Vec::new();

        loop {
            match inbox.try_recv() {
                Ok((topic, payload)) => {
                    actions.extend(panel.handle_message(&topic, &payload, now_ms, &mut link));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("mqtt receiver gone");
                    break;
                }
            }
        }

        actions.extend(panel.tick(now_ms, &mut link));
        if execute_actions(&actions) {
            info!("restarting");
            thread::sleep(Duration::from_millis(RESTART_FLUSH_MS));
            unsafe { sys::esp_restart() };
        }
        thread::sleep(Duration::from_millis(CONTROL_TICK_MS));
    }
}

/// Motor, strip, matrix and relay drivers live outside this firmware; actions are logged.
fn execute_actions(actions: &[PanelAction]) -> bool {
    let mut restart = false;
    for action in actions {
        match action {
            PanelAction::Restart => restart = true,
            other => info!("panel action: {other:?}"),
        }
    }
    restart
}

fn builtin_driver(descriptor: &ModuleDescriptor) -> Option<Box<dyn Module>> {
    match (&descriptor.interface, descriptor.id) {
        (InterfaceConfig::Gpio { pins }, MOTION_SENSOR_ID) => {
            let pin = *pins.first()?;
            Some(Box::new(GpioInputModule::new(pin)))
        }
        _ => None,
    }
}

/// A digital input read on every update, exposed as the `state` value.
struct GpioInputModule {
    pin: u8,
    driver: Option<PinDriver<'static, AnyIOPin, Input>>,
    level: bool,
}

impl GpioInputModule {
    fn new(pin: u8) -> Self {
        Self {
            pin,
            driver: None,
            level: false,
        }
    }
}

impl Module for GpioInputModule {
    fn detect(&mut self) -> bool {
        if self.driver.is_some() {
            return true;
        }
        let driver = unsafe { PinDriver::input(AnyIOPin::new(i32::from(self.pin))) };
        match driver {
            Ok(mut driver) => {
                if let Err(err) = driver.set_pull(Pull::Down) {
                    warn!("GPIO{} pull-down failed: {err:?}", self.pin);
                }
                self.driver = Some(driver);
                true
            }
            Err(err) => {
                warn!("GPIO{} unavailable: {err:?}", self.pin);
                false
            }
        }
    }

    fn initialize(&mut self) -> Result<(), ModuleError> {
        self.update()
    }

    fn update(&mut self) -> Result<(), ModuleError> {
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| ModuleError::new("pin not claimed"))?;
        self.level = driver.is_high();
        Ok(())
    }

    fn shutdown(&mut self) {
        self.driver = None;
    }

    fn read_value(&mut self, name: &str) -> Result<i32, ModuleError> {
        match name {
            "state" | "motion" => Ok(i32::from(self.level)),
            _ => Err(ModuleError::new(format!("no readable value `{name}`"))),
        }
    }

    fn status(&self) -> Option<String> {
        Some(format!("GPIO{} {}", self.pin, if self.level { "high" } else { "low" }))
    }
}

/// The byte-addressed config backend: one NVS blob mirrored in RAM between commits.
struct NvsRegion {
    partition: EspDefaultNvsPartition,
    bytes: Vec<u8>,
}

impl NvsRegion {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            bytes: Vec::new(),
        }
    }

    fn nvs(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StorageError> {
        EspNvs::new(self.partition.clone(), NVS_IMAGE_NAMESPACE, true).map_err(storage_error)
    }

    fn bounds(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let end = offset + len;
        if end > self.bytes.len() {
            return Err(StorageError::RegionTooSmall {
                needed: end,
                capacity: self.bytes.len(),
            });
        }
        Ok(offset..end)
    }
}

impl ByteRegion for NvsRegion {
    fn open(&mut self) -> Result<(), StorageError> {
        let nvs = self.nvs()?;
        let mut buffer = vec![0_u8; REGION_CAPACITY];
        self.bytes = nvs
            .get_blob(NVS_IMAGE_KEY, &mut buffer)
            .map_err(storage_error)?
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        self.bytes.resize(REGION_CAPACITY, 0xFF);
        Ok(())
    }

    fn capacity(&self) -> usize {
        REGION_CAPACITY
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let range = self.bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        let range = self.bounds(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let mut nvs = self.nvs()?;
        nvs.set_blob(NVS_IMAGE_KEY, &self.bytes).map_err(storage_error)
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.bytes.fill(0xFF);
        let mut nvs = self.nvs()?;
        nvs.remove(NVS_IMAGE_KEY).map_err(storage_error)?;
        Ok(())
    }
}

/// The file-style config backend: each JSON document is a blob keyed by its file stem.
struct NvsFiles {
    partition: EspDefaultNvsPartition,
}

impl NvsFiles {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self { partition }
    }

    fn nvs(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StorageError> {
        EspNvs::new(self.partition.clone(), NVS_FILES_NAMESPACE, true).map_err(storage_error)
    }
}

fn nvs_key(name: &str) -> &str {
    let stem = name.split('.').next().unwrap_or(name);
    &stem[..stem.len().min(NVS_KEY_MAX_LEN)]
}

impl FileStore for NvsFiles {
    fn open(&mut self) -> Result<(), StorageError> {
        self.nvs().map(drop)
    }

    fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let nvs = self.nvs()?;
        let mut buffer = vec![0_u8; MAX_FILE_BYTES];
        Ok(nvs
            .get_blob(nvs_key(name), &mut buffer)
            .map_err(storage_error)?
            .map(<[u8]>::to_vec))
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > MAX_FILE_BYTES {
            return Err(StorageError::Backend(format!(
                "{name} is {} bytes, limit {MAX_FILE_BYTES}",
                data.len()
            )));
        }
        let mut nvs = self.nvs()?;
        nvs.set_blob(nvs_key(name), data).map_err(storage_error)
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        let mut nvs = self.nvs()?;
        nvs.remove(nvs_key(name)).map_err(storage_error)?;
        Ok(())
    }
}

fn storage_error(err: EspError) -> StorageError {
    StorageError::Backend(err.to_string())
}

/// Version checks and firmware downloads over HTTPS with the bundled certificate store.
struct HttpFirmwareSource;

impl HttpFirmwareSource {
    fn get(url: &str, timeout_ms: u64) -> Result<EspHttpConnection, UpdateError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_millis(timeout_ms)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut conn = EspHttpConnection::new(&http_conf).map_err(update_error)?;
        conn.initiate_request(Method::Get, url, &[])
            .map_err(update_error)?;
        conn.initiate_response().map_err(update_error)?;

        let status = conn.status();
        if !(200..300).contains(&status) {
            return Err(UpdateError::HttpStatus(status));
        }
        Ok(conn)
    }
}

impl FirmwareSource for HttpFirmwareSource {
    type Stream = HttpFirmwareStream;

    fn is_reachable(&self) -> bool {
        is_wifi_station_connected()
    }

    fn fetch(&mut self, url: &str, timeout_ms: u64) -> Result<Vec<u8>, UpdateError> {
        let mut conn = Self::get(url, timeout_ms)?;
        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = conn.read(&mut chunk).map_err(update_error)?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_DESCRIPTOR_BYTES {
                return Err(UpdateError::Descriptor("version info too large".into()));
            }
            body.extend_from_slice(&chunk[..read]);
        }
        Ok(body)
    }

    fn open(&mut self, url: &str, timeout_ms: u64) -> Result<HttpFirmwareStream, UpdateError> {
        let conn = Self::get(url, timeout_ms)?;
        let content_length = conn
            .header("content-length")
            .or_else(|| conn.header("Content-Length"))
            .and_then(|value| value.parse::<u64>().ok());
        Ok(HttpFirmwareStream {
            conn,
            content_length,
        })
    }
}

struct HttpFirmwareStream {
    conn: EspHttpConnection,
    content_length: Option<u64>,
}

impl FirmwareStream for HttpFirmwareStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError> {
        self.conn.read(buf).map_err(update_error)
    }
}

fn update_error(err: EspError) -> UpdateError {
    if err.code() == sys::ESP_ERR_TIMEOUT {
        UpdateError::Timeout
    } else {
        UpdateError::Download(err.to_string())
    }
}

/// The inactive OTA partition, written through the raw `esp_ota_*` calls so the
/// handle can live across ticks.
#[derive(Default)]
struct EspFirmwareSlots {
    handle: Option<sys::esp_ota_handle_t>,
    target: Option<*const sys::esp_partition_t>,
    finalized: bool,
}

fn esp_check(rc: sys::esp_err_t, what: &str) -> Result<(), UpdateError> {
    if rc == sys::ESP_OK {
        Ok(())
    } else {
        Err(UpdateError::Partition(format!("{what} failed with code {rc}")))
    }
}

impl FirmwareSlots for EspFirmwareSlots {
    fn begin(&mut self, size: u64) -> Result<(), UpdateError> {
        self.abort();
        let partition = unsafe { sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            return Err(UpdateError::Partition("no update partition".into()));
        }
        let image_size = usize::try_from(size).map_err(|_| UpdateError::InvalidSize)?;
        let mut handle: sys::esp_ota_handle_t = 0;
        esp_check(
            unsafe { sys::esp_ota_begin(partition, image_size, &mut handle) },
            "esp_ota_begin",
        )?;
        self.handle = Some(handle);
        self.target = Some(partition);
        self.finalized = false;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        let handle = self
            .handle
            .ok_or_else(|| UpdateError::Partition("no update in progress".into()))?;
        esp_check(
            unsafe { sys::esp_ota_write(handle, chunk.as_ptr().cast(), chunk.len()) },
            "esp_ota_write",
        )
    }

    fn finalize(&mut self) -> Result<(), UpdateError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| UpdateError::Partition("no update in progress".into()))?;
        esp_check(unsafe { sys::esp_ota_end(handle) }, "esp_ota_end")?;
        self.finalized = true;
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = unsafe { sys::esp_ota_abort(handle) };
        }
        self.target = None;
        self.finalized = false;
    }

    fn activate(&mut self) -> Result<(), UpdateError> {
        let target = self
            .target
            .filter(|_| self.finalized)
            .ok_or_else(|| UpdateError::Partition("image not finalized".into()))?;
        esp_check(
            unsafe { sys::esp_ota_set_boot_partition(target) },
            "esp_ota_set_boot_partition",
        )?;
        self.target = None;
        self.finalized = false;
        Ok(())
    }

    fn running_state(&self) -> SlotState {
        let slot = EspOta::new().and_then(|ota| ota.get_running_slot());
        match slot.map(|slot| slot.state) {
            Ok(EspSlotState::Valid | EspSlotState::Factory) => SlotState::Valid,
            Ok(EspSlotState::Unverified) => SlotState::PendingVerify,
            Ok(EspSlotState::Invalid) => SlotState::Invalid,
            Ok(_) | Err(_) => SlotState::Unknown,
        }
    }

    fn mark_running_valid(&mut self) -> Result<(), UpdateError> {
        let mut ota = EspOta::new().map_err(|err| UpdateError::Partition(err.to_string()))?;
        ota.mark_running_slot_valid()
            .map_err(|err| UpdateError::Partition(err.to_string()))
    }

    fn rollback_target(&self) -> Option<String> {
        if !unsafe { sys::esp_ota_check_rollback_is_possible() } {
            return None;
        }
        let ota = EspOta::new().ok()?;
        let slot = ota.get_update_slot().ok()?;
        Some(slot.label.as_str().to_string())
    }

    fn activate_rollback(&mut self) -> Result<(), UpdateError> {
        if self.rollback_target().is_none() {
            return Err(UpdateError::NoRollbackTarget);
        }
        let partition = unsafe { sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            return Err(UpdateError::NoRollbackTarget);
        }
        esp_check(
            unsafe { sys::esp_ota_set_boot_partition(partition) },
            "esp_ota_set_boot_partition",
        )
    }

    fn free_heap(&self) -> u32 {
        unsafe { sys::esp_get_free_heap_size() }
    }
}

struct MqttLink {
    client: Option<Arc<Mutex<EspMqttClient<'static>>>>,
    connected: Arc<AtomicBool>,
}

impl Transport for MqttLink {
    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let client = self.client.as_ref().ok_or(TransportError::Disconnected)?;
        let mut client = client
            .lock()
            .map_err(|_| TransportError::PublishFailed("mqtt client lock poisoned".into()))?;
        client
            .enqueue(topic, QoS::AtLeastOnce, retain, payload)
            .map(drop)
            .map_err(|err| TransportError::PublishFailed(err.to_string()))
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    settings: &WifiSettings,
) -> anyhow::Result<EspWifi<'static>> {
    if settings.ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if settings.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: settings
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: settings
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", settings.ssid);

    let deadline = Instant::now() + Duration::from_millis(u64::from(settings.timeout));
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        let result = wifi.connect().and_then(|()| wifi.wait_netif_up());
        match result {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                break;
            }
            Err(err) if Instant::now() >= deadline => {
                let _ = wifi.disconnect();
                let _ = wifi.stop();
                return Err(err).context(format!("wifi connect gave up after {attempt} attempts"));
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt} failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    settings: &MqttSettings,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", settings.server, settings.port);

    let conf = MqttClientConfiguration {
        client_id: Some(settings.client_id.as_str()),
        username: if settings.user.is_empty() {
            None
        } else {
            Some(settings.user.as_str())
        },
        password: if settings.password.is_empty() {
            None
        } else {
            Some(settings.password.as_str())
        },
        reconnect_timeout: Some(Duration::from_millis(u64::from(settings.reconnect_delay))),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Mutex<EspMqttClient<'static>>) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    for topic in SUBSCRIBED_TOPICS {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    connected: Arc<AtomicBool>,
    inbox: SyncSender<(String, Vec<u8>)>,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        connected.store(true, Ordering::Relaxed);
                        if let Err(err) = subscribe_topics(&mqtt) {
                            warn!("mqtt subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Only full payloads are processed.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if inbox.send((topic.to_string(), data.to_vec())).is_err() {
                            break;
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread: {err}");
    }
}

fn init_watchdog(timeout_ms: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms,
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
