//! File-backed stand-ins for the panel's non-volatile storage, firmware partitions and module bus.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use homecontrol_common::{
    error::{ModuleError, StorageError, UpdateError},
    ota::{FirmwareSlots, FirmwareSource, FirmwareStream, SlotState},
    storage::{ByteRegion, FileStore},
    Module,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const REGION_FILE: &str = "eeprom.bin";
pub const REGION_CAPACITY: usize = 4_096;
const BOOT_RECORD: &str = "boot.json";

pub struct FileRegion {
    path: PathBuf,
    bytes: Vec<u8>,
    capacity: usize,
}

impl FileRegion {
    pub fn new(data_dir: &Path, capacity: usize) -> Self {
        Self {
            path: data_dir.join(REGION_FILE),
            bytes: Vec::new(),
            capacity,
        }
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

impl ByteRegion for FileRegion {
    fn open(&mut self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        self.bytes.resize(self.capacity, 0xFF);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
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
        write_atomic(&self.path, &self.bytes)?;
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.bytes.fill(0xFF);
        self.commit()
    }
}

pub struct DirFiles {
    dir: PathBuf,
}

impl DirFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FileStore for DirFiles {
    fn open(&mut self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        write_atomic(&self.dir.join(name), data)?;
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Serves `file://` URLs and plain paths. Relative paths resolve against the data directory.
pub struct LocalFirmwareSource {
    base_dir: PathBuf,
}

impl LocalFirmwareSource {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, UpdateError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            warn!("host builds cannot download {url}");
            return Err(UpdateError::Unsupported);
        }
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        })
    }
}

fn io_to_update(err: std::io::Error) -> UpdateError {
    match err.kind() {
        ErrorKind::NotFound => UpdateError::HttpStatus(404),
        ErrorKind::PermissionDenied => UpdateError::HttpStatus(403),
        ErrorKind::TimedOut => UpdateError::Timeout,
        _ => UpdateError::Download(err.to_string()),
    }
}

impl FirmwareSource for LocalFirmwareSource {
    type Stream = LocalFirmwareStream;

    fn is_reachable(&self) -> bool {
        true
    }

    fn fetch(&mut self, url: &str, _timeout_ms: u64) -> Result<Vec<u8>, UpdateError> {
        let path = self.resolve(url)?;
        fs::read(path).map_err(io_to_update)
    }

    fn open(&mut self, url: &str, _timeout_ms: u64) -> Result<LocalFirmwareStream, UpdateError> {
        let path = self.resolve(url)?;
        let file = File::open(&path).map_err(io_to_update)?;
        let len = file.metadata().map_err(io_to_update)?.len();
        Ok(LocalFirmwareStream { file, len })
    }
}

pub struct LocalFirmwareStream {
    file: File,
    len: u64,
}

impl FirmwareStream for LocalFirmwareStream {
    fn content_length(&self) -> Option<u64> {
        Some(self.len)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError> {
        self.file.read(buf).map_err(io_to_update)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SlotId {
    A,
    B,
}

impl SlotId {
    fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::A => "slot_a.bin",
            Self::B => "slot_b.bin",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootRecord {
    active: SlotId,
    #[serde(rename = "nextBoot")]
    next_boot: Option<SlotId>,
    #[serde(rename = "pendingVerify")]
    pending_verify: bool,
    valid: [bool; 2],
}

impl Default for BootRecord {
    fn default() -> Self {
        Self {
            active: SlotId::A,
            next_boot: None,
            pending_verify: false,
            valid: [true, false],
        }
    }
}

/// Two image files plus a boot record, behaving like an A/B partition table with a
/// rollback-on-unconfirmed-boot bootloader.
pub struct FileSlots {
    dir: PathBuf,
    record: BootRecord,
    staging: Option<File>,
    finalized: bool,
}

impl FileSlots {
    /// Loads the boot record and performs the "bootloader" step for this start.
    pub fn boot(data_dir: &Path) -> anyhow::Result<Self> {
        let dir = data_dir.join("slots");
        fs::create_dir_all(&dir)?;
        let mut record = match fs::read(dir.join(BOOT_RECORD)) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("corrupt boot record, starting from slot A: {err}");
                BootRecord::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => BootRecord::default(),
            Err(err) => return Err(err.into()),
        };

        if record.pending_verify {
            let failed = record.active;
            warn!("slot {failed:?} was never confirmed, rolling back");
            record.valid[failed.index()] = false;
            record.active = failed.other();
            record.pending_verify = false;
        } else if let Some(next) = record.next_boot.take() {
            info!("booting slot {next:?}");
            record.pending_verify = record.active != next && !record.valid[next.index()];
            record.active = next;
        }

        let mut slots = Self {
            dir,
            record,
            staging: None,
            finalized: false,
        };
        slots.persist()?;
        Ok(slots)
    }

    fn inactive(&self) -> SlotId {
        self.record.active.other()
    }

    fn image_path(&self, slot: SlotId) -> PathBuf {
        self.dir.join(slot.file_name())
    }

    fn persist(&self) -> std::io::Result<()> {
        let payload = serde_json::to_vec_pretty(&self.record).map_err(std::io::Error::other)?;
        write_atomic(&self.dir.join(BOOT_RECORD), &payload)
    }

    fn partition_error(err: impl std::fmt::Display) -> UpdateError {
        UpdateError::Partition(err.to_string())
    }
}

impl FirmwareSlots for FileSlots {
    fn begin(&mut self, size: u64) -> Result<(), UpdateError> {
        let target = self.inactive();
        self.record.valid[target.index()] = false;
        self.persist().map_err(Self::partition_error)?;
        let file = File::create(self.image_path(target)).map_err(Self::partition_error)?;
        file.set_len(0).map_err(Self::partition_error)?;
        info!("staging {size} bytes into slot {target:?}");
        self.staging = Some(file);
        self.finalized = false;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        let file = self
            .staging
            .as_mut()
            .ok_or_else(|| UpdateError::Partition("no update in progress".into()))?;
        file.write_all(chunk).map_err(Self::partition_error)
    }

    fn finalize(&mut self) -> Result<(), UpdateError> {
        let mut file = self
            .staging
            .take()
            .ok_or_else(|| UpdateError::Partition("no update in progress".into()))?;
        file.flush().map_err(Self::partition_error)?;
        file.sync_all().map_err(Self::partition_error)?;
        self.finalized = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.staging = None;
        self.finalized = false;
        if let Err(err) = fs::remove_file(self.image_path(self.inactive())) {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to discard staged image: {err}");
            }
        }
    }

    fn activate(&mut self) -> Result<(), UpdateError> {
        if !self.finalized {
            return Err(UpdateError::Partition("image not finalized".into()));
        }
        self.finalized = false;
        self.record.next_boot = Some(self.inactive());
        self.persist().map_err(Self::partition_error)
    }

    fn running_state(&self) -> SlotState {
        if self.record.pending_verify {
            SlotState::PendingVerify
        } else {
            SlotState::Valid
        }
    }

    fn mark_running_valid(&mut self) -> Result<(), UpdateError> {
        self.record.pending_verify = false;
        self.record.valid[self.record.active.index()] = true;
        self.persist().map_err(Self::partition_error)
    }

    fn rollback_target(&self) -> Option<String> {
        let other = self.inactive();
        self.record.valid[other.index()].then(|| format!("slot {other:?}"))
    }

    fn activate_rollback(&mut self) -> Result<(), UpdateError> {
        if self.rollback_target().is_none() {
            return Err(UpdateError::NoRollbackTarget);
        }
        self.record.next_boot = Some(self.inactive());
        self.persist().map_err(Self::partition_error)
    }
}

/// A module whose presence is a marker file: `modules/<id>.present`.
pub struct SimulatedModule {
    marker: PathBuf,
    values: BTreeMap<String, i32>,
    config: Option<String>,
}

impl SimulatedModule {
    pub fn new(data_dir: &Path, id: u8) -> Self {
        Self {
            marker: data_dir.join("modules").join(format!("{id}.present")),
            values: BTreeMap::new(),
            config: None,
        }
    }
}

impl Module for SimulatedModule {
    fn detect(&mut self) -> bool {
        self.marker.exists()
    }

    fn initialize(&mut self) -> Result<(), ModuleError> {
        self.values.clear();
        Ok(())
    }

    fn update(&mut self) -> Result<(), ModuleError> {
        if self.marker.exists() {
            Ok(())
        } else {
            Err(ModuleError::new("device not responding"))
        }
    }

    fn read_value(&mut self, name: &str) -> Result<i32, ModuleError> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| ModuleError::new(format!("unknown value {name}")))
    }

    fn write_value(&mut self, name: &str, value: i32) -> Result<(), ModuleError> {
        info!("module {}: {name} = {value}", self.marker.display());
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    fn configure(&mut self, config: &str) -> Result<(), ModuleError> {
        self.config = Some(config.to_string());
        Ok(())
    }

    fn status(&self) -> Option<String> {
        Some(match &self.config {
            Some(config) => format!("{} values, config {config}", self.values.len()),
            None => format!("{} values", self.values.len()),
        })
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    fn scratch_dir() -> PathBuf {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let mut path = std::env::temp_dir();
        path.push("homecontrol-sim");
        path.push(format!(
            "{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn stage(slots: &mut FileSlots, image: &[u8]) {
        slots.begin(image.len() as u64).unwrap();
        slots.write(image).unwrap();
        slots.finalize().unwrap();
        slots.activate().unwrap();
    }

    #[test]
    fn region_survives_reopen_and_pads_with_erased_bytes() {
        let dir = scratch_dir();
        let mut region = FileRegion::new(&dir, 64);
        region.open().unwrap();
        region.write(4, b"cfg").unwrap();
        region.commit().unwrap();

        let mut reopened = FileRegion::new(&dir, 64);
        reopened.open().unwrap();
        let mut buf = [0_u8; 5];
        reopened.read(2, &mut buf).unwrap();
        assert_eq!(&buf, &[0xFF, 0xFF, b'c', b'f', b'g']);
        assert!(matches!(
            reopened.write(62, b"abc"),
            Err(StorageError::RegionTooSmall { needed: 65, capacity: 64 })
        ));
    }

    #[test]
    fn missing_files_read_as_none() {
        let dir = scratch_dir();
        let mut files = DirFiles::new(&dir);
        files.open().unwrap();
        assert_eq!(files.read("config.json").unwrap(), None);

        files.write("config.json", b"{}").unwrap();
        assert_eq!(files.read("config.json").unwrap(), Some(b"{}".to_vec()));
        files.remove("config.json").unwrap();
        files.remove("config.json").unwrap();
        assert_eq!(files.read("config.json").unwrap(), None);
    }

    #[test]
    fn local_source_resolves_relative_urls_and_rejects_http() {
        let dir = scratch_dir();
        fs::write(dir.join("version.json"), br#"{"version":"1.2.0"}"#).unwrap();
        let mut source = LocalFirmwareSource::new(&dir);

        assert_eq!(
            source.fetch("file://version.json", 1_000).unwrap(),
            br#"{"version":"1.2.0"}"#.to_vec()
        );
        assert_eq!(
            source.fetch("missing.json", 1_000),
            Err(UpdateError::HttpStatus(404))
        );
        assert_eq!(
            source.fetch("https://updates.example/version.json", 1_000),
            Err(UpdateError::Unsupported)
        );
    }

    #[test]
    fn local_stream_reports_length_and_reads_to_end() {
        let dir = scratch_dir();
        fs::write(dir.join("firmware.bin"), vec![7_u8; 10]).unwrap();
        let mut stream = LocalFirmwareSource::new(&dir)
            .open("firmware.bin", 1_000)
            .unwrap();
        assert_eq!(stream.content_length(), Some(10));

        let mut buf = [0_u8; 4];
        let mut total = 0;
        loop {
            let read = stream.read_chunk(&mut buf).unwrap();
            if read == 0 {
                break;
            }
            total += read;
        }
        assert_eq!(total, 10);
    }

    #[test]
    fn confirmed_update_becomes_the_running_slot() {
        let dir = scratch_dir();
        let mut slots = FileSlots::boot(&dir).unwrap();
        assert_eq!(slots.running_state(), SlotState::Valid);
        stage(&mut slots, b"image-b");

        let mut rebooted = FileSlots::boot(&dir).unwrap();
        assert_eq!(rebooted.running_state(), SlotState::PendingVerify);
        assert_eq!(rebooted.rollback_target(), Some("slot A".to_string()));
        rebooted.mark_running_valid().unwrap();

        let settled = FileSlots::boot(&dir).unwrap();
        assert_eq!(settled.running_state(), SlotState::Valid);
        assert_eq!(settled.record.active, SlotId::B);
        assert_eq!(fs::read(settled.image_path(SlotId::B)).unwrap(), b"image-b");
    }

    #[test]
    fn unconfirmed_boot_rolls_back() {
        let dir = scratch_dir();
        let mut slots = FileSlots::boot(&dir).unwrap();
        stage(&mut slots, b"broken");
        let pending = FileSlots::boot(&dir).unwrap();
        assert_eq!(pending.record.active, SlotId::B);
        drop(pending);

        let recovered = FileSlots::boot(&dir).unwrap();
        assert_eq!(recovered.record.active, SlotId::A);
        assert_eq!(recovered.running_state(), SlotState::Valid);
        assert_eq!(recovered.rollback_target(), None);
    }

    #[test]
    fn activate_requires_a_finalized_image() {
        let dir = scratch_dir();
        let mut slots = FileSlots::boot(&dir).unwrap();
        slots.begin(4).unwrap();
        slots.write(b"half").unwrap();
        assert!(matches!(slots.activate(), Err(UpdateError::Partition(_))));

        slots.abort();
        assert!(!slots.image_path(SlotId::B).exists());
        assert_eq!(slots.activate_rollback(), Err(UpdateError::NoRollbackTarget));
    }

    #[test]
    fn simulated_module_follows_its_marker_file() {
        let dir = scratch_dir();
        let mut module = SimulatedModule::new(&dir, 3);
        assert!(!module.detect());

        fs::create_dir_all(dir.join("modules")).unwrap();
        fs::write(dir.join("modules").join("3.present"), b"").unwrap();
        assert!(module.detect());
        module.initialize().unwrap();
        module.write_value("speed", 40).unwrap();
        assert_eq!(module.read_value("speed"), Ok(40));
        assert_eq!(module.status(), Some("1 values".to_string()));

        fs::remove_file(dir.join("modules").join("3.present")).unwrap();
        assert!(module.update().is_err());
    }
}
