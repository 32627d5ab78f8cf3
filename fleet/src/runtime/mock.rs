//! In-memory [`Runtime`] for tests
//!
//! Workers are just names in a set. Log output is scripted per worker: every
//! call to `stream_logs` hands out the next queued script, and fails with
//! `NotRunning` once the queue is empty. Console input is captured line by line.

use super::{Runtime, RuntimeError, WorkerInfo, WorkerOutput, WorkerSpec};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Mutex, MutexGuard};
use tokio::io::BufReader;
use tokio::sync::Notify;

#[derive(Default)]
struct MockState {
    created: Vec<WorkerSpec>,
    running: HashSet<String>,
    kills: Vec<(String, String)>,
    addresses: HashMap<String, String>,
    logs: HashMap<String, VecDeque<Vec<u8>>>,
    failing_starts: usize,
    console: HashMap<String, Vec<String>>,
    refused_input: HashSet<String>,
}

#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    removed: Notify,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_address(&self, name: &str, address: &str) {
        self.state()
            .addresses
            .insert(name.to_string(), address.to_string());
    }

    /// Queues one log session for `name`; each line gets a trailing newline
    pub fn push_logs(&self, name: &str, lines: &[&str]) {
        let mut body = Vec::new();
        for line in lines {
            body.extend_from_slice(line.as_bytes());
            body.push(b'\n');
        }
        self.state()
            .logs
            .entry(name.to_string())
            .or_default()
            .push_back(body);
    }

    /// Makes the next `count` calls to `start` fail
    pub fn fail_starts(&self, count: usize) {
        self.state().failing_starts = count;
    }

    pub fn mark_running(&self, name: &str) {
        self.state().running.insert(name.to_string());
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state().running.contains(name)
    }

    pub fn created(&self) -> Vec<WorkerSpec> {
        self.state().created.clone()
    }

    pub fn kills(&self) -> Vec<(String, String)> {
        self.state().kills.clone()
    }

    /// Makes every console write to `name` fail
    pub fn refuse_input(&self, name: &str) {
        self.state().refused_input.insert(name.to_string());
    }

    /// Every console line written to `name` so far
    pub fn commands(&self, name: &str) -> Vec<String> {
        self.state().console.get(name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn create(&self, spec: &WorkerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state();
        if state.running.contains(&spec.name) {
            return Err(RuntimeError::Other(format!("name {} already in use", spec.name)));
        }
        state.created.push(spec.clone());
        Ok(spec.name.clone())
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(RuntimeError::Other(format!("start of {} refused", handle)));
        }
        state.running.insert(handle.to_string());
        Ok(())
    }

    async fn kill(&self, name: &str, signal: &str) -> Result<(), RuntimeError> {
        let removed = {
            let mut state = self.state();
            state.kills.push((name.to_string(), signal.to_string()));
            state.running.remove(name)
        };
        if !removed {
            return Err(RuntimeError::NotRunning(name.to_string()));
        }
        self.removed.notify_waiters();
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<WorkerInfo, RuntimeError> {
        self.state()
            .addresses
            .get(name)
            .map(|address| WorkerInfo {
                address: address.clone(),
            })
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn send_input(&self, name: &str, line: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if state.refused_input.contains(name) {
            return Err(RuntimeError::Console {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "console closed"),
            });
        }
        state
            .console
            .entry(name.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn stream_logs(&self, name: &str) -> Result<WorkerOutput, RuntimeError> {
        let body = self
            .state()
            .logs
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| RuntimeError::NotRunning(name.to_string()))?;
        Ok(Box::new(BufReader::new(io::Cursor::new(body))))
    }

    async fn wait_removed(&self, name: &str) -> Result<(), RuntimeError> {
        loop {
            let notified = self.removed.notified();
            if !self.is_running(name) {
                return Ok(());
            }
            notified.await;
        }
    }
}
