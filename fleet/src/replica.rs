//! Supervision of a single game-server worker
//!
//! A [`Replica`] is shared between three parties: its restart loop
//! ([`Replica::launch`]), its log monitor ([`Replica::monitor`]) and the
//! session, which flips readiness and sends console commands. Only the
//! `ready` flag and the address are mutable, and both sit behind their own
//! synchronization so the three never need a common lock.

use crate::runtime::{Runtime, RuntimeError, WorkerSpec};
use crate::utils::retry_delay;
use chrono::Utc;
use events::{parse_line, ChatMessage, Event};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Default `uid:gid` for worker processes, which run unprivileged
pub const WORKER_USER: &str = "1337:1337";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("could not encode chat message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct Replica {
    pub id: usize,
    pub name: String,
    spec: WorkerSpec,
    ready: AtomicBool,
    address: RwLock<String>,
    runtime: Arc<dyn Runtime>,
    events: mpsc::UnboundedSender<Event>,
    retry: Duration,
}

impl Replica {
    pub fn new(
        id: usize,
        spec: WorkerSpec,
        runtime: Arc<dyn Runtime>,
        events: mpsc::UnboundedSender<Event>,
        retry: Duration,
    ) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            spec,
            ready: AtomicBool::new(false),
            address: RwLock::new(String::new()),
            runtime,
            events,
            retry,
        }
    }

    pub fn image(&self) -> &str {
        &self.spec.image
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub async fn address(&self) -> String {
        self.address.read().await.clone()
    }

    /// Sleeps for a jittered retry delay; returns false if cancelled meanwhile
    async fn back_off(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(retry_delay(self.retry)) => true,
        }
    }

    /// Keeps a worker alive: each time the current one is removed, a fresh one
    /// is created and started. Runs until `shutdown` is cancelled.
    pub async fn launch(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.runtime.wait_removed(&self.name) => match result {
                    Ok(()) => info!("{}: worker removed", self.name),
                    Err(e) => debug!("{}: waiting for removal failed: {}", self.name, e),
                },
            }

            if let Err(e) = self.start().await {
                error!("{}: failed to start worker: {}", self.name, e);
                if !self.back_off(&shutdown).await {
                    return;
                }
            }
        }
    }

    /// Creates and starts one worker instance
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let handle = self.runtime.create(&self.spec).await?;
        self.runtime.start(&handle).await?;
        info!("{}: started worker from {}", self.name, self.spec.image);
        Ok(())
    }

    /// Follows the worker's log output and turns recognised lines into
    /// events. Reattaches after every stream failure until cancelled.
    pub async fn monitor(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.runtime.stream_logs(&self.name).await {
                Ok(output) => {
                    let mut lines = output.lines();
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            line = lines.next_line() => match line {
                                Ok(Some(line)) => self.handle_line(&line),
                                Ok(None) => {
                                    debug!("{}: log stream ended", self.name);
                                    break;
                                }
                                Err(e) => {
                                    warn!("{}: error reading logs: {}", self.name, e);
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => debug!("{}: cannot follow logs: {}", self.name, e),
            }

            if !self.back_off(&shutdown).await {
                return;
            }
        }
    }

    /// Parses one output line and forwards any resulting event
    pub fn handle_line(&self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        debug!("[{}] {}", self.name, line);

        match parse_line(line, Utc::now().date_naive()) {
            Ok(Some(entry)) => {
                if self.events.send(entry.into_event(self.id)).is_err() {
                    warn!("{}: session is gone, dropping event", self.name);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("{}: dropping line: {}", self.name, e),
        }
    }

    /// Looks up the worker's current network address
    pub async fn refresh_address(&self) -> Result<(), RuntimeError> {
        let info = self.runtime.inspect(&self.name).await?;
        info!("{}: address is {}", self.name, info.address);
        *self.address.write().await = info.address;
        Ok(())
    }

    /// Writes one line to the worker's console
    pub async fn send_command(&self, command: &str) -> Result<(), CommandError> {
        self.runtime.send_input(&self.name, command).await?;
        Ok(())
    }

    /// Broadcasts a chat message to every player on the worker
    pub async fn say(&self, message: &ChatMessage) -> Result<(), CommandError> {
        self.send_command(&message.to_command()?).await
    }

    /// Marks the replica unusable and kills its worker; the restart loop
    /// brings up a replacement
    pub async fn reset(&self) -> Result<(), RuntimeError> {
        self.ready.store(false, Ordering::SeqCst);
        self.runtime.kill(&self.name, "KILL").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use events::EventKind;
    use tokio_test::{assert_err, assert_ok};

    const GENERATED: &str = "[12:00:00] [Server thread/INFO]: Done (3.1s)! For help, type \"help\"";

    fn spec(name: &str) -> WorkerSpec {
        WorkerSpec {
            name: name.to_string(),
            image: "tigres/minecraft-fabric:latest".to_string(),
            user: WORKER_USER.to_string(),
            memory: None,
            cpus: None,
        }
    }

    fn replica(runtime: &Arc<MockRuntime>) -> (Arc<Replica>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime: Arc<dyn Runtime> = runtime.clone();
        let replica = Replica::new(1, spec("run_1"), runtime, tx, Duration::from_millis(100));
        (Arc::new(replica), rx)
    }

    #[test]
    fn test_handle_line_emits_stamped_event() {
        let runtime = Arc::new(MockRuntime::new());
        let (replica, mut rx) = replica(&runtime);

        replica.handle_line(&format!("{}\r", GENERATED));
        replica.handle_line("[12:00:01] [Server thread/INFO]: Preparing level \"world\"");
        replica.handle_line("[77:00:00] [Server thread/INFO]: Steve joined the game");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.replica, 1);
        assert_eq!(event.kind, EventKind::WorldGenerated);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_command_and_say() {
        let runtime = Arc::new(MockRuntime::new());
        let (replica, _rx) = replica(&runtime);

        assert_ok!(replica.send_command("/save-off").await);
        assert_ok!(replica.say(&ChatMessage::green("attempt #3")).await);

        assert_eq!(
            runtime.commands("run_1"),
            vec![
                "/save-off".to_string(),
                r#"/tellraw @a [{"text":"attempt #3","color":"green"}]"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_command_surfaces_refused_input() {
        let runtime = Arc::new(MockRuntime::new());
        let (replica, _rx) = replica(&runtime);
        runtime.refuse_input("run_1");

        match replica.send_command("/time set 0").await {
            Err(CommandError::Runtime(RuntimeError::Console { name, .. })) => assert_eq!(name, "run_1"),
            other => panic!("expected a console error, got {:?}", other),
        }
        assert!(runtime.commands("run_1").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_address() {
        let runtime = Arc::new(MockRuntime::new());
        let (replica, _rx) = replica(&runtime);

        assert_err!(replica.refresh_address().await);
        assert_eq!(replica.address().await, "");

        runtime.set_address("run_1", "172.17.0.5");
        assert_ok!(replica.refresh_address().await);
        assert_eq!(replica.address().await, "172.17.0.5");
    }

    #[tokio::test]
    async fn test_reset_clears_ready_and_kills() {
        let runtime = Arc::new(MockRuntime::new());
        let (replica, _rx) = replica(&runtime);
        runtime.mark_running("run_1");
        replica.mark_ready();

        assert_ok!(replica.reset().await);
        assert!(!replica.is_ready());
        assert!(!runtime.is_running("run_1"));
        assert_eq!(runtime.kills(), vec![("run_1".to_string(), "KILL".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_restarts_after_kill() {
        let runtime = Arc::new(MockRuntime::new());
        let (replica, _rx) = replica(&runtime);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let replica = Arc::clone(&replica);
            let shutdown = shutdown.clone();
            async move { replica.launch(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(runtime.is_running("run_1"));
        assert_eq!(runtime.created().len(), 1);
        assert_eq!(runtime.created()[0].user, WORKER_USER);

        assert_ok!(replica.reset().await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(runtime.is_running("run_1"));
        assert_eq!(runtime.created().len(), 2);

        shutdown.cancel();
        assert_ok!(handle.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_backs_off_on_start_failure() {
        let runtime = Arc::new(MockRuntime::new());
        let (replica, _rx) = replica(&runtime);
        let shutdown = CancellationToken::new();
        runtime.fail_starts(2);

        let handle = tokio::spawn({
            let replica = Arc::clone(&replica);
            let shutdown = shutdown.clone();
            async move { replica.launch(shutdown).await }
        });

        // First attempt fails immediately and the loop sleeps at least 75ms
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!runtime.is_running("run_1"));
        assert_eq!(runtime.created().len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(runtime.is_running("run_1"));
        assert_eq!(runtime.created().len(), 3);

        shutdown.cancel();
        assert_ok!(handle.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reattaches_and_forwards_events() {
        let runtime = Arc::new(MockRuntime::new());
        let (replica, mut rx) = replica(&runtime);
        let shutdown = CancellationToken::new();

        runtime.push_logs("run_1", &["[12:00:00] [Server thread/INFO]: Starting minecraft server"]);
        runtime.push_logs("run_1", &[GENERATED, "[12:00:05] [Server thread/INFO]: Steve joined the game"]);

        let handle = tokio::spawn({
            let replica = Arc::clone(&replica);
            let shutdown = shutdown.clone();
            async move { replica.monitor(shutdown).await }
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::WorldGenerated);
        assert_eq!(second.kind, EventKind::Login);
        assert_eq!(second.payload, "Steve joined the game");

        shutdown.cancel();
        assert_ok!(handle.await);
    }
}
