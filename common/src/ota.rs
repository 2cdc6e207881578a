use std::{
    cmp::Ordering,
    fmt::Write as _,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::OtaSettings,
    error::UpdateError,
    queue::{publish_json, StatusSink},
    topics::{TOPIC_OTA_PROGRESS, TOPIC_OTA_STATUS},
    types::{OtaProgressPayload, OtaState, OtaStatusPayload},
};

pub const OTA_CHUNK_SIZE: usize = 1_024;
pub const NETWORK_TIMEOUT_MS: u64 = 30_000;
pub const MAX_RETRIES: u8 = 3;
pub const RETRY_DELAY_MS: u64 = 60_000;
pub const AUTO_START_GRACE_MS: u64 = 10_000;
pub const RESTART_DELAY_MS: u64 = 3_000;
pub const ROLLBACK_RESTART_DELAY_MS: u64 = 1_000;
pub const VERSION_FILE: &str = "version.json";

const SHA256_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub checksum: String,
    pub size: u64,
    #[serde(rename = "releaseNotes", default)]
    pub release_notes: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(rename = "minVersion", default)]
    pub min_version: String,
}

impl UpdateDescriptor {
    pub fn parse(body: &[u8]) -> Result<Self, UpdateError> {
        let descriptor: Self =
            serde_json::from_slice(body).map_err(|err| UpdateError::Descriptor(err.to_string()))?;
        if descriptor.version.trim().is_empty() {
            return Err(UpdateError::Descriptor("missing version".into()));
        }
        if descriptor.url.trim().is_empty() {
            return Err(UpdateError::Descriptor("missing url".into()));
        }
        if descriptor.size == 0 {
            return Err(UpdateError::InvalidSize);
        }
        Ok(descriptor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub auto_update: bool,
    pub check_interval_ms: u64,
    pub server: String,
    pub allow_beta: bool,
    pub require_confirmation: bool,
}

impl From<&OtaSettings> for UpdatePolicy {
    fn from(settings: &OtaSettings) -> Self {
        Self {
            auto_update: settings.auto_update,
            check_interval_ms: u64::from(settings.check_interval),
            server: settings.server.clone(),
            allow_beta: settings.allow_beta,
            require_confirmation: settings.require_confirmation,
        }
    }
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self::from(&OtaSettings::default())
    }
}

impl UpdatePolicy {
    pub fn version_url(&self) -> String {
        format!("{}/{VERSION_FILE}", self.server.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRequest {
    /// The descriptor found by the last version check.
    Available,
    Forced {
        url: String,
        checksum: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Valid,
    PendingVerify,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaAction {
    Restart,
}

/// Fetches version descriptors and firmware bodies (HTTP on the device, files on a host).
pub trait FirmwareSource {
    type Stream: FirmwareStream;

    fn is_reachable(&self) -> bool;
    fn fetch(&mut self, url: &str, timeout_ms: u64) -> Result<Vec<u8>, UpdateError>;
    fn open(&mut self, url: &str, timeout_ms: u64) -> Result<Self::Stream, UpdateError>;
}

pub trait FirmwareStream {
    fn content_length(&self) -> Option<u64>;
    /// Returns 0 at end of stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError>;
}

/// The alternate firmware partition plus the boot selector.
pub trait FirmwareSlots {
    fn begin(&mut self, size: u64) -> Result<(), UpdateError>;
    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError>;
    /// Closes the written image without making it bootable.
    fn finalize(&mut self) -> Result<(), UpdateError>;
    /// Discards a staged image. Must be safe to call in any state.
    fn abort(&mut self);
    /// Marks the finalized image as the next boot target.
    fn activate(&mut self) -> Result<(), UpdateError>;
    fn running_state(&self) -> SlotState;
    fn mark_running_valid(&mut self) -> Result<(), UpdateError>;
    fn rollback_target(&self) -> Option<String>;
    fn activate_rollback(&mut self) -> Result<(), UpdateError>;

    fn free_heap(&self) -> u32 {
        0
    }
}

/// Cancellation flag shared with input surfaces; observed between download chunks and during the
/// auto-start grace window.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn request(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, AtomicOrdering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, AtomicOrdering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

pub struct OtaManager<S, P> {
    source: S,
    slots: P,
    policy: UpdatePolicy,
    current_version: String,
    cancel: CancelHandle,

    state: OtaState,
    message: String,
    progress: u8,
    descriptor: Option<UpdateDescriptor>,
    last_error: Option<UpdateError>,
    retry_count: u8,
    uptime_ms: u64,

    next_check_ms: Option<u64>,
    auto_start_at_ms: Option<u64>,
    retry_at_ms: Option<u64>,
    restart_at_ms: Option<u64>,
}

impl<S: FirmwareSource, P: FirmwareSlots> OtaManager<S, P> {
    pub fn new(
        source: S,
        slots: P,
        current_version: impl Into<String>,
        policy: UpdatePolicy,
    ) -> Self {
        Self {
            source,
            slots,
            policy,
            current_version: current_version.into(),
            cancel: CancelHandle::default(),
            state: OtaState::Idle,
            message: "OTA ready".to_string(),
            progress: 0,
            descriptor: None,
            last_error: None,
            retry_count: 0,
            uptime_ms: 0,
            next_check_ms: None,
            auto_start_at_ms: None,
            retry_at_ms: None,
            restart_at_ms: None,
        }
    }

    /// Shares an existing cancel flag, so a surface holding it keeps working across restarts.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn begin(&mut self, now_ms: u64, sink: &mut impl StatusSink) {
        self.uptime_ms = now_ms;
        self.next_check_ms = Some(now_ms.saturating_add(self.policy.check_interval_ms));
        info!(
            "OTA ready: running {} ({:?}), auto-update {}",
            self.current_version,
            self.slots.running_state(),
            self.policy.auto_update
        );
        self.publish_status(sink);
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn descriptor(&self) -> Option<&UpdateDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn auto_start_pending(&self) -> bool {
        self.auto_start_at_ms.is_some()
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_at_ms.is_some()
    }

    pub fn slots(&self) -> &P {
        &self.slots
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn set_policy(&mut self, policy: UpdatePolicy, now_ms: u64) {
        if !policy.auto_update {
            self.auto_start_at_ms = None;
            self.retry_at_ms = None;
        }
        if policy.check_interval_ms != self.policy.check_interval_ms || self.next_check_ms.is_none()
        {
            self.next_check_ms = Some(now_ms.saturating_add(policy.check_interval_ms));
        }
        self.policy = policy;
    }

    pub fn set_auto_update(&mut self, enabled: bool, now_ms: u64, sink: &mut impl StatusSink) {
        let policy = UpdatePolicy {
            auto_update: enabled,
            ..self.policy.clone()
        };
        self.set_policy(policy, now_ms);
        info!("auto-update {}", if enabled { "enabled" } else { "disabled" });
        self.publish_status(sink);
    }

    /// Fetches the version descriptor. Returns true when a compatible, different version exists.
    pub fn check_for_updates(&mut self, now_ms: u64, sink: &mut impl StatusSink) -> bool {
        self.uptime_ms = now_ms;
        if self.is_locked() {
            debug!("ignoring version check while {}", self.state.as_str());
            return false;
        }
        if !self.source.is_reachable() {
            warn!("network unreachable, cannot check for updates");
            self.fail(UpdateError::NetworkUnreachable, now_ms, sink);
            return false;
        }

        self.auto_start_at_ms = None;
        self.progress = 0;
        self.set_state(OtaState::CheckingVersion, "Checking for updates...", sink);

        let url = self.policy.version_url();
        let descriptor = match self
            .source
            .fetch(&url, NETWORK_TIMEOUT_MS)
            .and_then(|body| UpdateDescriptor::parse(&body))
        {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!("version check against {url} failed: {err}");
                self.fail(err, now_ms, sink);
                return false;
            }
        };

        if compare_versions(&descriptor.version, &self.current_version) == Ordering::Equal {
            self.descriptor = None;
            self.set_state(OtaState::Idle, "No updates available", sink);
            return false;
        }

        if !descriptor.min_version.trim().is_empty()
            && compare_versions(&self.current_version, &descriptor.min_version) == Ordering::Less
        {
            let err = UpdateError::Incompatible {
                running: self.current_version.clone(),
                required: descriptor.min_version.clone(),
            };
            self.fail(err, now_ms, sink);
            return false;
        }

        if is_prerelease(&descriptor.version) && !self.policy.allow_beta {
            info!("ignoring pre-release {}", descriptor.version);
            self.descriptor = None;
            self.set_state(OtaState::Idle, "No updates available", sink);
            return false;
        }

        info!(
            "update available: {} -> {}",
            self.current_version, descriptor.version
        );
        let message = format!("Update available: {}", descriptor.version);
        self.descriptor = Some(descriptor);
        self.last_error = None;
        self.set_state(OtaState::UpdateAvailable, &message, sink);
        true
    }

    /// Downloads, verifies and activates firmware. Blocks for the whole copy; cancellation is
    /// observed between chunks.
    pub fn start_update(
        &mut self,
        request: UpdateRequest,
        now_ms: u64,
        sink: &mut impl StatusSink,
    ) -> bool {
        self.uptime_ms = now_ms;
        if self.is_locked() {
            warn!("cannot start update while {}", self.state.as_str());
            return false;
        }
        let (url, size, checksum) = match request {
            UpdateRequest::Available => match (&self.descriptor, self.state) {
                (Some(descriptor), OtaState::UpdateAvailable) => (
                    descriptor.url.clone(),
                    Some(descriptor.size),
                    Some(descriptor.checksum.clone()),
                ),
                _ => {
                    warn!("no update available to start");
                    return false;
                }
            },
            UpdateRequest::Forced { url, checksum } => (url, None, checksum),
        };

        if !self.source.is_reachable() {
            self.fail(UpdateError::NetworkUnreachable, now_ms, sink);
            return false;
        }

        self.auto_start_at_ms = None;
        self.retry_at_ms = None;
        self.cancel.clear();
        self.progress = 0;
        info!("starting update from {url}");
        self.set_state(OtaState::Downloading, "Starting firmware download...", sink);

        match self.install(&url, size, checksum.as_deref(), sink) {
            Ok(written) => {
                info!("firmware installed ({written} bytes), restarting");
                self.retry_count = 0;
                self.last_error = None;
                self.progress = 100;
                self.restart_at_ms = Some(now_ms.saturating_add(RESTART_DELAY_MS));
                self.set_state(OtaState::Success, "Update complete, restarting", sink);
                true
            }
            Err(err) => {
                self.slots.abort();
                self.fail(err, now_ms, sink);
                false
            }
        }
    }

    /// Stops a pending auto-start or an in-flight download.
    pub fn cancel_update(&mut self, now_ms: u64, sink: &mut impl StatusSink) -> bool {
        if self.auto_start_at_ms.take().is_some() {
            info!("auto-update cancelled");
            self.message = "Auto-update cancelled by user".to_string();
            self.publish_status(sink);
            return true;
        }
        if matches!(self.state, OtaState::Downloading | OtaState::Installing) {
            self.slots.abort();
            self.fail(UpdateError::Cancelled, now_ms, sink);
            return true;
        }
        false
    }

    /// True while a transfer runs or a restart into a newly selected slot is pending. The
    /// alternate slot must not be touched then.
    fn is_locked(&self) -> bool {
        self.state.is_busy()
            || self.restart_at_ms.is_some()
            || matches!(self.state, OtaState::Success | OtaState::RollbackRequired)
    }

    pub fn can_rollback(&self) -> bool {
        self.slots.rollback_target().is_some()
    }

    pub fn rollback_to_previous(&mut self, now_ms: u64, sink: &mut impl StatusSink) -> bool {
        self.uptime_ms = now_ms;
        if self.is_locked() {
            warn!("cannot roll back while {}", self.state.as_str());
            return false;
        }
        let Some(target) = self.slots.rollback_target() else {
            self.fail(UpdateError::NoRollbackTarget, now_ms, sink);
            return false;
        };

        match self.slots.activate_rollback() {
            Ok(()) => {
                info!("rolling back to {target}");
                self.auto_start_at_ms = None;
                self.retry_at_ms = None;
                self.restart_at_ms = Some(now_ms.saturating_add(ROLLBACK_RESTART_DELAY_MS));
                let message = format!("Rolling back to {target}");
                self.set_state(OtaState::RollbackRequired, &message, sink);
                true
            }
            Err(err) => {
                self.fail(err, now_ms, sink);
                false
            }
        }
    }

    /// Called when the running image judges itself unhealthy.
    pub fn report_unhealthy(&mut self, reason: &str, now_ms: u64, sink: &mut impl StatusSink) -> bool {
        warn!("running image reported unhealthy: {reason}");
        if !self.can_rollback() {
            self.message = format!("Unhealthy ({reason}), no rollback target");
            self.publish_status(sink);
            return false;
        }
        self.rollback_to_previous(now_ms, sink)
    }

    /// Confirms a tentative boot. Returns true when the running image was pending verification.
    pub fn mark_current_version_valid(&mut self) -> Result<bool, UpdateError> {
        if self.slots.running_state() != SlotState::PendingVerify {
            return Ok(false);
        }
        self.slots.mark_running_valid()?;
        info!("running firmware {} marked valid", self.current_version);
        Ok(true)
    }

    pub fn tick(&mut self, now_ms: u64, sink: &mut impl StatusSink) -> Option<OtaAction> {
        self.uptime_ms = now_ms;

        if let Some(restart_at) = self.restart_at_ms {
            if now_ms >= restart_at {
                self.restart_at_ms = None;
                return Some(OtaAction::Restart);
            }
            return None;
        }

        if let Some(start_at) = self.auto_start_at_ms {
            if self.cancel.take() {
                self.cancel_update(now_ms, sink);
            } else if now_ms >= start_at {
                self.auto_start_at_ms = None;
                info!("starting auto-update");
                self.start_update(UpdateRequest::Available, now_ms, sink);
            }
            return None;
        }

        if !self.policy.auto_update {
            return None;
        }

        if self.state == OtaState::Failed {
            if let Some(retry_at) = self.retry_at_ms {
                if now_ms >= retry_at {
                    self.retry_at_ms = None;
                    self.retry_count = self.retry_count.saturating_add(1);
                    info!("retry attempt {}/{MAX_RETRIES}", self.retry_count);
                    self.policy_check(now_ms, sink);
                }
                return None;
            }
        }

        let due = self.next_check_ms.is_some_and(|next| now_ms >= next);
        if due && matches!(self.state, OtaState::Idle | OtaState::Failed | OtaState::UpdateAvailable)
        {
            self.next_check_ms = Some(now_ms.saturating_add(self.policy.check_interval_ms));
            self.retry_count = 0;
            self.policy_check(now_ms, sink);
        }
        None
    }

    pub fn status_payload(&self) -> OtaStatusPayload {
        let descriptor = self.descriptor.as_ref();
        OtaStatusPayload {
            state: self.state,
            message: self.message.clone(),
            progress: self.progress,
            current_version: self.current_version.clone(),
            available_version: descriptor.map(|descriptor| descriptor.version.clone()),
            release_notes: descriptor
                .map(|descriptor| descriptor.release_notes.clone())
                .filter(|notes| !notes.is_empty()),
            mandatory: descriptor.is_some_and(|descriptor| descriptor.mandatory),
            auto_update: self.policy.auto_update,
            auto_start_pending: self.auto_start_pending(),
            can_rollback: self.can_rollback(),
            retry_count: self.retry_count,
            free_heap: self.slots.free_heap(),
            uptime_ms: self.uptime_ms,
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    pub fn publish_status(&self, sink: &mut impl StatusSink) {
        publish_json(sink, TOPIC_OTA_STATUS, &self.status_payload(), true);
    }

    /// A check driven by the auto-update policy rather than by a command.
    fn policy_check(&mut self, now_ms: u64, sink: &mut impl StatusSink) {
        if !self.check_for_updates(now_ms, sink) {
            return;
        }
        let mandatory = self.descriptor.as_ref().is_some_and(|d| d.mandatory);
        if mandatory {
            info!("starting mandatory update");
            self.start_update(UpdateRequest::Available, now_ms, sink);
        } else if self.policy.require_confirmation {
            info!("update waiting for confirmation");
        } else {
            self.cancel.clear();
            self.auto_start_at_ms = Some(now_ms.saturating_add(AUTO_START_GRACE_MS));
            self.message = format!(
                "Update {} starts in {}s unless cancelled",
                self.descriptor
                    .as_ref()
                    .map(|d| d.version.as_str())
                    .unwrap_or_default(),
                AUTO_START_GRACE_MS / 1_000
            );
            self.publish_status(sink);
        }
    }

    fn install(
        &mut self,
        url: &str,
        declared_size: Option<u64>,
        checksum: Option<&str>,
        sink: &mut impl StatusSink,
    ) -> Result<u64, UpdateError> {
        let expected_digest = checksum.map(parse_checksum).transpose()?.flatten();
        let mut stream = self.source.open(url, NETWORK_TIMEOUT_MS)?;

        let total = match (declared_size, stream.content_length()) {
            (Some(declared), Some(served)) if declared != served => {
                return Err(UpdateError::SizeMismatch { declared, served });
            }
            (Some(size), _) | (None, Some(size)) => size,
            (None, None) => return Err(UpdateError::InvalidSize),
        };
        if total == 0 {
            return Err(UpdateError::InvalidSize);
        }

        self.slots.begin(total)?;

        let mut hasher = Sha256::new();
        let mut written = 0_u64;
        let mut chunk = [0_u8; OTA_CHUNK_SIZE];
        while written < total {
            if self.cancel.take() {
                return Err(UpdateError::Cancelled);
            }
            let remaining = usize::try_from(total - written).unwrap_or(usize::MAX);
            let want = remaining.min(OTA_CHUNK_SIZE);
            let read = stream.read_chunk(&mut chunk[..want])?;
            if read == 0 {
                break;
            }
            self.slots.write(&chunk[..read])?;
            hasher.update(&chunk[..read]);
            written += read as u64;

            self.progress = u8::try_from(written.saturating_mul(100) / total).unwrap_or(100);
            let progress = OtaProgressPayload {
                progress: self.progress,
                written,
                total,
            };
            publish_json(sink, TOPIC_OTA_PROGRESS, &progress, false);
        }

        if written < total {
            return Err(UpdateError::Incomplete {
                written,
                expected: total,
            });
        }

        self.set_state(OtaState::Installing, "Installing firmware...", sink);
        if self.cancel.take() {
            return Err(UpdateError::Cancelled);
        }
        self.slots.finalize()?;

        if let Some(expected) = expected_digest {
            let actual = hex_digest(&hasher.finalize());
            if actual != expected {
                warn!("sha256 mismatch (expected {expected}, got {actual})");
                return Err(UpdateError::ChecksumMismatch);
            }
            debug!("sha256 verified: {actual}");
        } else {
            warn!("firmware from {url} carries no checksum, skipping verification");
        }

        self.slots.activate()?;
        Ok(written)
    }

    fn fail(&mut self, err: UpdateError, now_ms: u64, sink: &mut impl StatusSink) {
        warn!("OTA failed: {err}");
        let retryable = !matches!(
            err,
            UpdateError::Cancelled | UpdateError::Incompatible { .. } | UpdateError::NoRollbackTarget
        );
        self.retry_at_ms = (retryable && self.policy.auto_update && self.retry_count < MAX_RETRIES)
            .then(|| now_ms.saturating_add(RETRY_DELAY_MS));
        self.auto_start_at_ms = None;
        let message = match &err {
            UpdateError::Cancelled => "Update cancelled by user".to_string(),
            other => other.to_string(),
        };
        self.last_error = Some(err);
        self.set_state(OtaState::Failed, &message, sink);
    }

    fn set_state(&mut self, state: OtaState, message: &str, sink: &mut impl StatusSink) {
        if self.state != state {
            debug!("OTA {} -> {}", self.state.as_str(), state.as_str());
        }
        self.state = state;
        self.message = message.to_string();
        self.publish_status(sink);
    }
}

/// Numeric comparison per dot-separated component; a pre-release orders before its release.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let (left_core, left_pre) = split_version(left);
    let (right_core, right_pre) = split_version(right);

    let len = left_core.len().max(right_core.len());
    for index in 0..len {
        let a = left_core.get(index).copied().unwrap_or(0);
        let b = right_core.get(index).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    match (left_pre, right_pre) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

pub fn is_prerelease(version: &str) -> bool {
    split_version(version).1.is_some()
}

fn split_version(version: &str) -> (Vec<u64>, Option<&str>) {
    let version = version.trim().trim_start_matches(['v', 'V']);
    let (core, pre) = match version.split_once(['-', '+']) {
        Some((core, pre)) => (core, Some(pre).filter(|pre| !pre.is_empty())),
        None => (version, None),
    };
    let numbers = core
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect();
    (numbers, pre)
}

/// Accepts `<hex>` or `sha256:<hex>`; an empty checksum means unverified.
fn parse_checksum(checksum: &str) -> Result<Option<String>, UpdateError> {
    let trimmed = checksum.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let hex = match trimmed.get(..SHA256_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(SHA256_PREFIX) => &trimmed[SHA256_PREFIX.len()..],
        _ => trimmed,
    };
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UpdateError::UnsupportedChecksum);
    }
    Ok(Some(hex.to_ascii_lowercase()))
}

fn hex_digest(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
