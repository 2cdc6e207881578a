//! In-memory fakes shared by the unit tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use serde_json::Value;

use crate::{
    error::{ModuleError, TransportError, UpdateError},
    modules::Module,
    ota::{CancelHandle, FirmwareSlots, FirmwareSource, FirmwareStream, SlotState},
    queue::{Delivery, StatusSink, Transport},
    topics::{TOPIC_OTA_PROGRESS, TOPIC_OTA_STATUS},
    types::OtaState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl SentMessage {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap()
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.payload.clone()).unwrap()
    }
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub connected: bool,
    pub fail_next: usize,
    fail_from: Option<usize>,
    pub sent: Vec<SentMessage>,
}

impl ScriptedTransport {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Lets `count` more publishes through, then fails every one after.
    pub fn fail_after(&mut self, count: usize) {
        self.fail_from = Some(self.sent.len() + count);
    }

    pub fn topics(&self) -> Vec<String> {
        self.sent.iter().map(|message| message.topic.clone()).collect()
    }

    pub fn last_on(&self, topic: &str) -> Option<&SentMessage> {
        self.sent.iter().rev().find(|message| message.topic == topic)
    }
}

impl Transport for ScriptedTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(TransportError::PublishFailed("scripted failure".into()));
        }
        if self.fail_from.is_some_and(|limit| self.sent.len() >= limit) {
            return Err(TransportError::PublishFailed("scripted failure".into()));
        }
        self.sent.push(SentMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub messages: Vec<SentMessage>,
}

impl RecordingSink {
    pub fn ota_states(&self) -> Vec<OtaState> {
        self.messages
            .iter()
            .filter(|message| message.topic == TOPIC_OTA_STATUS)
            .map(|message| serde_json::from_value(message.json()["state"].clone()).unwrap())
            .collect()
    }

    pub fn progress_values(&self) -> Vec<u64> {
        self.messages
            .iter()
            .filter(|message| message.topic == TOPIC_OTA_PROGRESS)
            .map(|message| message.json()["progress"].as_u64().unwrap())
            .collect()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Delivery {
        self.messages.push(SentMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Delivery::Published
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedSource {
    pub reachable: bool,
    pub descriptor: Vec<u8>,
    pub fetch_error: Option<UpdateError>,
    pub firmware: Vec<u8>,
    pub advertised_len: Option<u64>,
    pub truncate_at: Option<usize>,
    pub cancel_after_chunks: Option<(usize, CancelHandle)>,
    pub fetched: Vec<String>,
    pub opened: Vec<String>,
}

impl ScriptedSource {
    pub fn serving(descriptor: Vec<u8>, firmware: Vec<u8>) -> Self {
        Self {
            reachable: true,
            descriptor,
            fetch_error: None,
            firmware,
            advertised_len: None,
            truncate_at: None,
            cancel_after_chunks: None,
            fetched: Vec::new(),
            opened: Vec::new(),
        }
    }
}

impl FirmwareSource for ScriptedSource {
    type Stream = ScriptedStream;

    fn is_reachable(&self) -> bool {
        self.reachable
    }

    fn fetch(&mut self, url: &str, _timeout_ms: u64) -> Result<Vec<u8>, UpdateError> {
        self.fetched.push(url.to_string());
        match &self.fetch_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.descriptor.clone()),
        }
    }

    fn open(&mut self, url: &str, _timeout_ms: u64) -> Result<ScriptedStream, UpdateError> {
        self.opened.push(url.to_string());
        let served = self.truncate_at.unwrap_or(self.firmware.len()).min(self.firmware.len());
        Ok(ScriptedStream {
            data: self.firmware[..served].to_vec(),
            position: 0,
            content_length: Some(self.advertised_len.unwrap_or(self.firmware.len() as u64)),
            chunks_read: 0,
            cancel_after: self.cancel_after_chunks.clone(),
        })
    }
}

pub struct ScriptedStream {
    data: Vec<u8>,
    position: usize,
    content_length: Option<u64>,
    chunks_read: usize,
    cancel_after: Option<(usize, CancelHandle)>,
}

impl FirmwareStream for ScriptedStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError> {
        let remaining = &self.data[self.position..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.position += count;
        self.chunks_read += 1;
        if let Some((after, handle)) = &self.cancel_after {
            if self.chunks_read == *after {
                handle.request();
            }
        }
        Ok(count)
    }
}

#[derive(Debug)]
pub struct ScriptedSlots {
    pub begun: Option<u64>,
    pub written: Vec<u8>,
    pub finalized: bool,
    pub aborted: bool,
    pub activated: bool,
    pub running: SlotState,
    pub previous: Option<String>,
    pub rolled_back: bool,
    pub fail_writes: bool,
}

impl Default for ScriptedSlots {
    fn default() -> Self {
        Self {
            begun: None,
            written: Vec::new(),
            finalized: false,
            aborted: false,
            activated: false,
            running: SlotState::Valid,
            previous: None,
            rolled_back: false,
            fail_writes: false,
        }
    }
}

impl FirmwareSlots for ScriptedSlots {
    fn begin(&mut self, size: u64) -> Result<(), UpdateError> {
        self.begun = Some(size);
        self.written.clear();
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        if self.fail_writes {
            return Err(UpdateError::Partition("scripted write failure".into()));
        }
        self.written.extend_from_slice(chunk);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), UpdateError> {
        self.finalized = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }

    fn activate(&mut self) -> Result<(), UpdateError> {
        self.activated = true;
        Ok(())
    }

    fn running_state(&self) -> SlotState {
        self.running
    }

    fn mark_running_valid(&mut self) -> Result<(), UpdateError> {
        self.running = SlotState::Valid;
        Ok(())
    }

    fn rollback_target(&self) -> Option<String> {
        self.previous.clone()
    }

    fn activate_rollback(&mut self) -> Result<(), UpdateError> {
        self.rolled_back = true;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ModuleProbe {
    pub present: bool,
    pub init_ok: bool,
    pub fail_updates: bool,
    pub detect_calls: usize,
    pub init_calls: usize,
    pub update_calls: usize,
    pub shutdown_calls: usize,
    pub values: BTreeMap<String, i32>,
    pub configured: Vec<String>,
}

impl Default for ModuleProbe {
    fn default() -> Self {
        Self {
            present: true,
            init_ok: true,
            fail_updates: false,
            detect_calls: 0,
            init_calls: 0,
            update_calls: 0,
            shutdown_calls: 0,
            values: BTreeMap::new(),
            configured: Vec::new(),
        }
    }
}

/// A module whose behaviour is steered through a shared probe after it has been boxed.
pub struct ScriptedModule {
    probe: Arc<Mutex<ModuleProbe>>,
}

impl ScriptedModule {
    pub fn present() -> (Self, Arc<Mutex<ModuleProbe>>) {
        let probe = Arc::new(Mutex::new(ModuleProbe::default()));
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl Module for ScriptedModule {
    fn detect(&mut self) -> bool {
        let mut probe = self.probe.lock().unwrap();
        probe.detect_calls += 1;
        probe.present
    }

    fn initialize(&mut self) -> Result<(), ModuleError> {
        let mut probe = self.probe.lock().unwrap();
        probe.init_calls += 1;
        if probe.init_ok {
            Ok(())
        } else {
            Err(ModuleError::new("init failed"))
        }
    }

    fn update(&mut self) -> Result<(), ModuleError> {
        let mut probe = self.probe.lock().unwrap();
        probe.update_calls += 1;
        if probe.fail_updates {
            Err(ModuleError::new("bus timeout"))
        } else {
            Ok(())
        }
    }

    fn shutdown(&mut self) {
        self.probe.lock().unwrap().shutdown_calls += 1;
    }

    fn read_value(&mut self, name: &str) -> Result<i32, ModuleError> {
        self.probe
            .lock()
            .unwrap()
            .values
            .get(name)
            .copied()
            .ok_or_else(|| ModuleError::new(format!("no value `{name}`")))
    }

    fn write_value(&mut self, name: &str, value: i32) -> Result<(), ModuleError> {
        self.probe
            .lock()
            .unwrap()
            .values
            .insert(name.to_string(), value);
        Ok(())
    }

    fn configure(&mut self, config: &str) -> Result<(), ModuleError> {
        self.probe.lock().unwrap().configured.push(config.to_string());
        Ok(())
    }

    fn status(&self) -> Option<String> {
        Some("ok".to_string())
    }
}
