//! # Speedrun Fleet
//!
//! Keeps several game servers warm so a runner never waits for world
//! generation. One replica is active at a time and receives all player
//! traffic through a TCP proxy; when the runner resets, the active replica is
//! thrown away and the next ready one takes over without the player-facing
//! address changing.
//!
//! ## Architecture Design
//!
//! ### Single-Writer Session
//! Every replica runs two background tasks: a restart loop that recreates its
//! worker whenever it disappears, and a log monitor that turns server output
//! into [`events::Event`]s. Those events flow through one unbounded queue into
//! the [`session::Session`] control loop, the only place attempt, phase and
//! active-replica state is ever written. No lock guards session state because
//! nothing else can reach it.
//!
//! ### Live Backend Switching
//! The session publishes the active replica's address on a watch channel.
//! The [`proxy::Proxy`] re-creates its listener whenever that address changes
//! and relays each accepted connection to the backend it saw at accept time.
//!
//! ## Module Organization
//!
//! - `config`: command-line arguments
//! - `runtime`: the process runtime seam and its Docker implementation
//! - `replica`: per-replica restart loop, log monitor and console commands
//! - `session`: the event-driven state machine
//! - `proxy`: the re-targetable TCP relay
//! - `solver`: stronghold triangulation from eye-of-ender throws
//! - `state`: the persisted attempt counter
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use fleet::proxy::{Proxy, ProxyConfig};
//! use fleet::runtime::{DockerCli, Runtime};
//! use fleet::session::{Session, SessionConfig};
//! use fleet::state::SessionData;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::watch;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig {
//!         replicas: 2,
//!         image: "tigres/minecraft-fabric:latest".to_string(),
//!         name_prefix: "mcspeedrun".to_string(),
//!         user: "1337:1337".to_string(),
//!         memory: None,
//!         cpus: None,
//!         state_file: "state.json".into(),
//!         retry: Duration::from_secs(1),
//!     };
//!     let runtime: Arc<dyn Runtime> = Arc::new(DockerCli::connect("docker").await?);
//!     let data = SessionData::load(&config.state_file)?;
//!
//!     let (target_tx, target_rx) = watch::channel(String::new());
//!     let proxy = Proxy::bind(&ProxyConfig::default(), target_rx).await?;
//!     let session = Session::new(runtime, &config, data, target_tx);
//!
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(proxy.run(shutdown.clone()));
//!     session.spawn_replicas(&shutdown);
//!     session.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod proxy;
pub mod replica;
pub mod runtime;
pub mod session;
pub mod solver;
pub mod state;
pub mod utils;
