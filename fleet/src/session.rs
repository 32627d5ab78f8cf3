//! Central orchestration of the replica fleet
//!
//! The session owns every replica, the attempt counter and the gameplay phase.
//! All of that is mutated only inside [`Session::run`], which drains a single
//! event queue fed by the replicas' log monitors. Replicas never touch session
//! state; the session talks back to them through explicit calls, and to the
//! proxy through a watch channel carrying the active backend address.

use crate::replica::Replica;
use crate::runtime::{Runtime, WorkerSpec};
use crate::solver::{CoordinateSolver, Triangulator};
use crate::state::{SessionData, StateError};
use crate::utils::{format_elapsed, split_between};
use chrono::{DateTime, Utc};
use events::{ChatMessage, Event, EventKind};
use log::{debug, error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Progress through one attempt. Moves strictly forward; only a reset goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Overworld,
    Nether,
    End,
    Credits,
}

impl Phase {
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::Overworld),
            Phase::Overworld => Some(Phase::Nether),
            Phase::Nether => Some(Phase::End),
            Phase::End => Some(Phase::Credits),
            Phase::Credits => None,
        }
    }

    /// The phase a milestone event moves to, if it is one
    fn reached_by(kind: EventKind) -> Option<Phase> {
        match kind {
            EventKind::Login => Some(Phase::Overworld),
            EventKind::Nether => Some(Phase::Nether),
            EventKind::End => Some(Phase::End),
            EventKind::Credits => Some(Phase::Credits),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "Idle",
            Phase::Overworld => "Overworld",
            Phase::Nether => "Nether",
            Phase::End => "End",
            Phase::Credits => "Credits",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub replicas: usize,
    pub image: String,
    pub name_prefix: String,
    /// `uid:gid` the worker processes run as
    pub user: String,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub state_file: PathBuf,
    pub retry: Duration,
}

impl SessionConfig {
    pub fn worker_spec(&self, id: usize) -> WorkerSpec {
        WorkerSpec {
            name: format!("{}_{}", self.name_prefix, id),
            image: self.image.clone(),
            user: self.user.clone(),
            memory: self.memory.clone(),
            cpus: self.cpus.clone(),
        }
    }
}

pub struct Session {
    replicas: Vec<Arc<Replica>>,
    solvers: Vec<Box<dyn CoordinateSolver>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    proxy_target: watch::Sender<String>,
    state_file: PathBuf,

    data: SessionData,
    phase: Phase,
    active: Option<usize>,
    attempt_start: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        config: &SessionConfig,
        data: SessionData,
        proxy_target: watch::Sender<String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let replicas = (0..config.replicas)
            .map(|id| {
                Arc::new(Replica::new(
                    id,
                    config.worker_spec(id),
                    Arc::clone(&runtime),
                    events_tx.clone(),
                    config.retry,
                ))
            })
            .collect();
        let solvers = (0..config.replicas)
            .map(|_| Box::new(Triangulator::new()) as Box<dyn CoordinateSolver>)
            .collect();

        Self {
            replicas,
            solvers,
            events_tx,
            events_rx,
            proxy_target,
            state_file: config.state_file.clone(),
            data,
            phase: Phase::Idle,
            active: None,
            attempt_start: None,
        }
    }

    /// Spawns the restart loop and log monitor of every replica
    pub fn spawn_replicas(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.replicas.len() * 2);
        for replica in &self.replicas {
            handles.push(tokio::spawn({
                let replica = Arc::clone(replica);
                let shutdown = shutdown.clone();
                async move { replica.launch(shutdown).await }
            }));
            handles.push(tokio::spawn({
                let replica = Arc::clone(replica);
                let shutdown = shutdown.clone();
                async move { replica.monitor(shutdown).await }
            }));
        }
        handles
    }

    /// A handle for injecting events, e.g. from outside the replicas
    pub fn event_sender(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.replicas
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn attempt(&self) -> u64 {
        self.data.attempt
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn attempt_start(&self) -> Option<DateTime<Utc>> {
        self.attempt_start
    }

    /// Runs the control loop until `shutdown` is cancelled, then persists the
    /// attempt counter.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), StateError> {
        info!(
            "Session started with {} replicas at attempt #{}",
            self.replicas.len(),
            self.data.attempt
        );

        loop {
            self.ensure_active().await;

            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events_rx.recv() => event,
            };
            match event {
                Some(event) => self.handle_event(event).await,
                None => break,
            }
        }

        info!("Session shutting down at attempt #{}", self.data.attempt);
        self.data.save(&self.state_file)
    }

    /// Promotes the lowest-id ready replica when none is active
    pub async fn ensure_active(&mut self) {
        if self.active.is_some() {
            return;
        }
        self.publish_target(String::new());

        let Some(replica) = self.replicas.iter().find(|r| r.is_ready()) else {
            return;
        };
        info!("Switching to {}", replica.name);
        self.active = Some(replica.id);
        let address = replica.address().await;
        self.publish_target(address);
    }

    fn publish_target(&self, address: String) {
        self.proxy_target.send_if_modified(|current| {
            if *current == address {
                return false;
            }
            *current = address;
            true
        });
    }

    fn active_replica(&self) -> Option<&Arc<Replica>> {
        self.active.and_then(|id| self.replicas.get(id))
    }

    /// Applies one event to the session state
    pub async fn handle_event(&mut self, event: Event) {
        debug!("Received {} from replica {}", event.kind, event.replica);

        if event.replica >= self.replicas.len() {
            warn!("Unknown replica id {}", event.replica);
            return;
        }
        if event.kind == EventKind::WorldGenerated {
            self.world_generated(event.replica).await;
            return;
        }

        let Some(replica) = self.active_replica().cloned() else {
            debug!("Ignoring {} from replica {}: no active replica", event.kind, event.replica);
            return;
        };
        if replica.id != event.replica {
            debug!("Ignoring {} from non-active replica {}", event.kind, event.replica);
            return;
        }

        match event.kind {
            EventKind::Reset => self.reset(&replica).await,
            EventKind::PlayerCommand => self.solve(&event),
            EventKind::PearlThrow => {
                self.solve(&event);
                match self.attempt_start {
                    Some(start) => {
                        let text = format!("Pearl: [{}]", format_elapsed(split_between(start, event.timestamp)));
                        Self::broadcast(&replica, ChatMessage::green(text)).await;
                    }
                    None => debug!("Pearl thrown before the attempt started"),
                }
            }
            EventKind::Login | EventKind::Nether | EventKind::End | EventKind::Credits => {
                self.advance(&replica, &event).await
            }
            EventKind::WorldGenerated => {}
        }
    }

    async fn world_generated(&mut self, id: usize) {
        let replica = Arc::clone(&self.replicas[id]);
        replica.mark_ready();
        if let Err(e) = replica.refresh_address().await {
            error!("{}: failed to refresh address: {}", replica.name, e);
        }
        info!("{} is online ({})", replica.name, replica.image());
    }

    async fn reset(&mut self, replica: &Replica) {
        self.phase = Phase::Idle;
        self.attempt_start = None;
        self.data.attempt += 1;
        self.solvers[replica.id].reset();
        if let Err(e) = replica.reset().await {
            error!("{}: failed to reset: {}", replica.name, e);
        }
        self.active = None;
        info!("Reset, starting attempt #{}", self.data.attempt);
    }

    fn solve(&mut self, event: &Event) {
        let solver = &mut self.solvers[event.replica];
        let result = match event.kind {
            EventKind::PearlThrow => solver.observe_throw(&event.payload),
            _ => solver.observe_position(&event.payload),
        };
        match result {
            Ok(Some(prediction)) => info!("Stronghold estimate: {}", prediction),
            Ok(None) => {}
            Err(e) => warn!("Ignoring {} '{}': {}", event.kind, event.payload, e),
        }
    }

    /// Moves to the phase a milestone reaches, but only from the phase right
    /// before it
    async fn advance(&mut self, replica: &Replica, event: &Event) {
        let Some(target) = Phase::reached_by(event.kind) else {
            return;
        };
        if self.phase.next() != Some(target) {
            debug!("Ignoring {} while in {}", event.kind, self.phase);
            return;
        }
        self.phase = target;

        if target == Phase::Overworld {
            self.attempt_start = Some(event.timestamp);
            let text = format!("attempt #{}", self.data.attempt);
            Self::broadcast(replica, ChatMessage::green(text)).await;
            for command in ["/time set 0", "/save-off"] {
                if let Err(e) = replica.send_command(command).await {
                    error!("{}: failed to send {}: {}", replica.name, command, e);
                }
            }
            return;
        }

        let elapsed = self
            .attempt_start
            .map(|start| split_between(start, event.timestamp))
            .unwrap_or_default();
        let text = format!("{}: [{}]", target, format_elapsed(elapsed));
        Self::broadcast(replica, ChatMessage::green(text)).await;
    }

    async fn broadcast(replica: &Replica, message: ChatMessage) {
        info!("{}: {}", replica.name, message.text);
        if let Err(e) = replica.say(&message).await {
            error!("{}: failed to broadcast: {}", replica.name, e);
        }
    }
}
