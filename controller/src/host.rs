use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{
        mpsc::{self, error::TryRecvError},
        watch,
    },
};
use tracing::{debug, info, warn};

use homecontrol_common::{
    config::MqttSettings,
    modules::Module,
    queue::QueueStats,
    topics::module_set_topic,
    types::{ConfigSummary, ModuleListEntry},
    CancelHandle, ConfigRecord, ConfigStore, DeviceStatusPayload, OtaCommand, OtaManager,
    OtaStatusPayload, Panel, PanelAction, PanelCommand, Transport, TransportError, UpdatePolicy, SUBSCRIBED_TOPICS,
    TOPIC_COMMAND, TOPIC_CONFIG_COMMAND, TOPIC_OTA_COMMAND,
};

use crate::sim::{DirFiles, FileRegion, FileSlots, LocalFirmwareSource, SimulatedModule, REGION_CAPACITY};

type HostPanel = Panel<FileRegion, DirFiles, LocalFirmwareSource, FileSlots>;

const MAX_MQTT_PAYLOAD_BYTES: usize = 4_096;
const INBOX_CAPACITY: usize = 64;
const REDACTED: &str = "********";

#[derive(Debug, Clone)]
struct HostSettings {
    data_dir: PathBuf,
    http_port: u16,
    tick_ms: u64,
    firmware_version: String,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_user: Option<String>,
    mqtt_pass: Option<String>,
}

impl HostSettings {
    fn from_env() -> Self {
        Self {
            data_dir: std::env::var("HOMECONTROL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.homecontrol")),
            http_port: env_parse("CONTROLLER_HTTP_PORT").unwrap_or(8080),
            tick_ms: env_parse("HOMECONTROL_TICK_MS").unwrap_or(50).max(1),
            firmware_version: std::env::var("HOMECONTROL_FIRMWARE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            mqtt_host: std::env::var("MQTT_HOST").ok(),
            mqtt_port: env_parse("MQTT_PORT"),
            mqtt_user: std::env::var("MQTT_USER").ok(),
            mqtt_pass: std::env::var("MQTT_PASS").ok(),
        }
    }

    fn mqtt_options(&self, mqtt: &MqttSettings) -> MqttOptions {
        let host = self
            .mqtt_host
            .clone()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| {
                if mqtt.server.is_empty() {
                    "localhost".to_string()
                } else {
                    mqtt.server.clone()
                }
            });
        let port = self.mqtt_port.unwrap_or(mqtt.port);
        let mut options = MqttOptions::new(mqtt.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let user = self.mqtt_user.clone().unwrap_or_else(|| mqtt.user.clone());
        let pass = self.mqtt_pass.clone().unwrap_or_else(|| mqtt.password.clone());
        if !user.is_empty() {
            options.set_credentials(user, pass);
        }
        options
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Publishes through rumqttc without blocking the control loop.
struct MqttLink {
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
}

impl Transport for MqttLink {
    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        let Some(client) = self.client.as_ref().filter(|_| self.connected.load(Ordering::Relaxed))
        else {
            return Err(TransportError::Disconnected);
        };
        client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|err| TransportError::PublishFailed(err.to_string()))
    }
}

#[derive(Debug)]
enum Inbound {
    Message { topic: String, payload: Vec<u8> },
    ImportConfig(Value),
}

#[derive(Debug, Clone, Serialize)]
struct Snapshot {
    status: DeviceStatusPayload,
    ota: OtaStatusPayload,
    modules: Vec<ModuleListEntry>,
    config: Value,
    summary: ConfigSummary,
    queue: QueueStats,
}

impl Snapshot {
    fn capture(panel: &HostPanel, now_ms: u64) -> Self {
        Self {
            status: panel.snapshot(now_ms),
            ota: panel.ota().status_payload(),
            modules: panel.modules().entries(),
            config: redacted_config(panel.config().record()),
            summary: panel.config().summary(),
            queue: panel.queue().stats(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    inbox: mpsc::Sender<Inbound>,
    snapshot: watch::Receiver<Option<Arc<Snapshot>>>,
    cancel: CancelHandle,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: bool,
    topic: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    info!("data directory {}", settings.data_dir.display());

    let cancel = CancelHandle::default();
    let mut link = MqttLink {
        client: None,
        connected: Arc::new(AtomicBool::new(false)),
    };
    let panel = boot_panel(&settings, &cancel, &mut link)?;

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let (snapshot_tx, snapshot_rx) = watch::channel(None);

    let mqtt = panel.config().record().mqtt.clone();
    if mqtt.auto_connect {
        let (client, eventloop) = AsyncClient::new(settings.mqtt_options(&mqtt), 64);
        spawn_mqtt_loop(
            client.clone(),
            eventloop,
            Arc::clone(&link.connected),
            inbox_tx.clone(),
        );
        link.client = Some(client);
    } else {
        warn!("mqtt auto-connect disabled, status stays queued");
    }

    let loop_settings = settings.clone();
    let loop_cancel = cancel.clone();
    let control = tokio::task::spawn_blocking(move || {
        control_loop(&loop_settings, &loop_cancel, panel, link, inbox_rx, snapshot_tx)
    });

    let app_state = AppState {
        inbox: inbox_tx,
        snapshot: snapshot_rx,
        cancel,
    };
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .route("/api/modules", get(handle_get_modules))
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/command", post(handle_post_command))
        .route("/api/ota/command", post(handle_post_ota_command))
        .route("/api/config/command", post(handle_post_config_command))
        .route("/api/modules/{id}/set", post(handle_post_module_set))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;
    info!("controller listening on http://{addr}");

    tokio::select! {
        served = axum::serve(listener, app) => served?,
        finished = control => finished.context("control loop panicked")??,
    }
    Ok(())
}

fn boot_panel(
    settings: &HostSettings,
    cancel: &CancelHandle,
    link: &mut MqttLink,
) -> anyhow::Result<HostPanel> {
    let data_dir = settings.data_dir.as_path();
    let store = ConfigStore::new(
        FileRegion::new(data_dir, REGION_CAPACITY),
        DirFiles::new(data_dir),
    );
    let slots = FileSlots::boot(data_dir).context("failed to open firmware slots")?;
    let ota = OtaManager::new(
        LocalFirmwareSource::new(data_dir),
        slots,
        settings.firmware_version.clone(),
        UpdatePolicy::default(),
    )
    .with_cancel_handle(cancel.clone());

    let mut panel = Panel::new(store, ota);
    let now_ms = monotonic_ms();
    let actions = panel.boot(now_ms, link);
    execute_actions(&actions);

    let modules_dir = data_dir.to_path_buf();
    let registered = panel.register_builtin_modules(
        |descriptor| {
            Some(Box::new(SimulatedModule::new(&modules_dir, descriptor.id)) as Box<dyn Module>)
        },
        now_ms,
    );
    info!(
        "panel ready: firmware {}, {registered} built-in modules",
        settings.firmware_version
    );
    Ok(panel)
}

fn spawn_mqtt_loop(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    connected: Arc<AtomicBool>,
    inbox: mpsc::Sender<Inbound>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    let inbound = Inbound::Message {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    };
                    if inbox.send(inbound).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    connected.store(true, Ordering::Relaxed);
                    for topic in SUBSCRIBED_TOPICS {
                        if let Err(err) = client.try_subscribe(topic, QoS::AtMostOnce) {
                            warn!("mqtt subscribe to {topic} failed: {err}");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if connected.swap(false, Ordering::Relaxed) {
                        warn!("mqtt disconnected: {err}");
                    } else {
                        debug!("mqtt poll error: {err}");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Owns the panel: drains inbound commands, ticks, runs actions, publishes a snapshot.
fn control_loop(
    settings: &HostSettings,
    cancel: &CancelHandle,
    mut panel: HostPanel,
    mut link: MqttLink,
    mut inbox: mpsc::Receiver<Inbound>,
    snapshot: watch::Sender<Option<Arc<Snapshot>>>,
) -> anyhow::Result<()> {
    let tick = Duration::from_millis(settings.tick_ms);
    loop {
        let now_ms = monotonic_ms();
        let mut actions = Vec::new();

        loop {
            match inbox.try_recv() {
                Ok(Inbound::Message { topic, payload }) => {
                    actions.extend(panel.handle_message(&topic, &payload, now_ms, &mut link));
                }
                Ok(Inbound::ImportConfig(mut value)) => {
                    restore_secrets(&mut value, panel.config().record());
                    let payload = format!("import_config:{value}");
                    actions.extend(panel.handle_message(
                        TOPIC_CONFIG_COMMAND,
                        payload.as_bytes(),
                        now_ms,
                        &mut link,
                    ));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }

        actions.extend(panel.tick(now_ms, &mut link));
        let restart = execute_actions(&actions);
        snapshot.send_replace(Some(Arc::new(Snapshot::capture(&panel, now_ms))));

        if restart {
            info!("restarting panel");
            drop(panel);
            panel = boot_panel(settings, cancel, &mut link)?;
        }
        std::thread::sleep(tick);
    }
}

/// The host has no actuators; actions are logged. Returns true when a restart was requested.
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

async fn handle_get_status(State(state): State<AppState>) -> axum::response::Response {
    with_snapshot(&state, |snapshot| Json(snapshot.status.clone()).into_response())
}

async fn handle_get_config(State(state): State<AppState>) -> axum::response::Response {
    with_snapshot(&state, |snapshot| {
        Json(serde_json::json!({
            "config": snapshot.config,
            "summary": snapshot.summary,
        }))
        .into_response()
    })
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(config): Json<Value>,
) -> axum::response::Response {
    if !config.is_object() {
        return error_response(StatusCode::BAD_REQUEST, "config must be a JSON object");
    }
    submit(&state, TOPIC_CONFIG_COMMAND, Inbound::ImportConfig(config)).await
}

async fn handle_get_modules(State(state): State<AppState>) -> axum::response::Response {
    with_snapshot(&state, |snapshot| Json(snapshot.modules.clone()).into_response())
}

async fn handle_get_ota_status(State(state): State<AppState>) -> axum::response::Response {
    with_snapshot(&state, |snapshot| {
        Json(serde_json::json!({
            "ota": snapshot.ota,
            "queue": snapshot.queue,
        }))
        .into_response()
    })
}

async fn handle_post_command(State(state): State<AppState>, body: String) -> axum::response::Response {
    if matches!(
        PanelCommand::parse(&body),
        Ok(PanelCommand::Ota(OtaCommand::CancelUpdate))
    ) {
        state.cancel.request();
    }
    submit_text(&state, TOPIC_COMMAND, body).await
}

async fn handle_post_ota_command(
    State(state): State<AppState>,
    body: String,
) -> axum::response::Response {
    // A download blocks the control loop, so cancellation goes straight to the shared flag.
    if matches!(OtaCommand::parse(body.trim()), Ok(OtaCommand::CancelUpdate)) {
        state.cancel.request();
    }
    submit_text(&state, TOPIC_OTA_COMMAND, body).await
}

async fn handle_post_config_command(
    State(state): State<AppState>,
    body: String,
) -> axum::response::Response {
    submit_text(&state, TOPIC_CONFIG_COMMAND, body).await
}

async fn handle_post_module_set(
    State(state): State<AppState>,
    Path(id): Path<u8>,
    body: String,
) -> axum::response::Response {
    submit_text(&state, &module_set_topic(id), body).await
}

async fn submit_text(state: &AppState, topic: &str, body: String) -> axum::response::Response {
    if body.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "command body is empty");
    }
    if body.len() > MAX_MQTT_PAYLOAD_BYTES {
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "command body too large");
    }
    let inbound = Inbound::Message {
        topic: topic.to_string(),
        payload: body.into_bytes(),
    };
    submit(state, topic, inbound).await
}

async fn submit(state: &AppState, topic: &str, inbound: Inbound) -> axum::response::Response {
    if state.inbox.send(inbound).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop stopped");
    }
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            topic: topic.to_string(),
        }),
    )
        .into_response()
}

fn with_snapshot(
    state: &AppState,
    render: impl FnOnce(&Snapshot) -> axum::response::Response,
) -> axum::response::Response {
    let snapshot = state.snapshot.borrow().clone();
    match snapshot {
        Some(snapshot) => render(&snapshot),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "panel is still booting"),
    }
}

fn redacted_config(record: &ConfigRecord) -> Value {
    let mut record = record.clone();
    for secret in [&mut record.wifi.password, &mut record.mqtt.password] {
        if !secret.is_empty() {
            *secret = REDACTED.to_string();
        }
    }
    serde_json::to_value(record).unwrap_or(Value::Null)
}

/// Puts stored secrets back where a client echoed the redaction marker.
fn restore_secrets(config: &mut Value, current: &ConfigRecord) {
    let secrets = [
        ("wifi", current.wifi.password.as_str()),
        ("mqtt", current.mqtt.password.as_str()),
    ];
    for (section, stored) in secrets {
        if let Some(password) = config.pointer_mut(&format!("/{section}/password")) {
            if password.as_str() == Some(REDACTED) {
                *password = Value::String(stored.to_string());
            }
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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
