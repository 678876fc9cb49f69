use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Startup,
    Entry,
    Fee,
    Exit,
    Close,
    RepairStart,
    RepairFill,
    RepairComplete,
    RepairUnwind,
    Alignment,
    Halt,
    Skip,
    ShutdownSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts: i64,
    pub kind: EventKind,
    pub payload: Value,
}

/// Append-only audit log plus a small named-value store.
pub trait EventStore: Send {
    fn append(&mut self, kind: EventKind, payload: Value) -> Result<u64>;

    fn put(&mut self, key: &str, value: Value) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Value>>;
}

/// `events.jsonl` and `state.json` under one directory.
pub struct JsonlEventStore {
    events_path: PathBuf,
    state_path: PathBuf,
    next_seq: u64,
    state: Map<String, Value>,
}

impl JsonlEventStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create event dir {}", dir.display()))?;
        let events_path = dir.join("events.jsonl");
        let state_path = dir.join("state.json");

        let mut next_seq = 1;
        if events_path.exists() {
            let file = fs::File::open(&events_path)
                .with_context(|| format!("failed to open {}", events_path.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if let Ok(event) = serde_json::from_str::<Event>(&line) {
                    next_seq = next_seq.max(event.seq + 1);
                }
            }
        }

        let state = if state_path.exists() {
            let raw = fs::read_to_string(&state_path)
                .with_context(|| format!("failed to read {}", state_path.display()))?;
            match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    log::warn!(
                        "[EVENTS] ignoring malformed state file {}",
                        state_path.display()
                    );
                    Map::new()
                }
            }
        } else {
            Map::new()
        };

        Ok(Self {
            events_path,
            state_path,
            next_seq,
            state,
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    fn persist_state(&self) -> Result<()> {
        let payload = serde_json::to_string_pretty(&Value::Object(self.state.clone()))?;
        let tmp_path = self.state_path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.state_path)
            .with_context(|| format!("failed to finalize {}", self.state_path.display()))?;
        Ok(())
    }
}

impl EventStore for JsonlEventStore {
    fn append(&mut self, kind: EventKind, payload: Value) -> Result<u64> {
        let event = Event {
            seq: self.next_seq,
            ts: Utc::now().timestamp_millis(),
            kind,
            payload,
        };
        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("failed to open {}", self.events_path.display()))?;
        writeln!(file, "{line}")?;
        self.next_seq += 1;
        Ok(event.seq)
    }

    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.state.insert(key.to_string(), value);
        self.persist_state()
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.get(key).cloned())
    }
}

#[derive(Default)]
struct MemoryInner {
    events: Vec<Event>,
    state: HashMap<String, Value>,
}

/// Cloneable in-memory store; clones share the same log.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        match self.inner.lock() {
            Ok(inner) => inner.events.clone(),
            Err(poisoned) => poisoned.into_inner().events.clone(),
        }
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventStore for MemoryEventStore {
    fn append(&mut self, kind: EventKind, payload: Value) -> Result<u64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("event store lock poisoned"))?;
        let seq = inner.events.len() as u64 + 1;
        inner.events.push(Event {
            seq,
            ts: Utc::now().timestamp_millis(),
            kind,
            payload,
        });
        Ok(seq)
    }

    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("event store lock poisoned"))?;
        inner.state.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("event store lock poisoned"))?;
        Ok(inner.state.get(key).cloned())
    }
}
