//! Command-line configuration

use crate::proxy::{ProxyConfig, GAME_PORT};
use crate::replica::WORKER_USER;
use crate::session::SessionConfig;
use crate::state::DEFAULT_STATE_FILE;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

// Upper bound for --retry-ms: one hour
const MAX_RETRY_MS: u64 = 3_600_000;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Runs a fleet of speedrun servers behind one address", long_about = None)]
pub struct Args {
    /// Number of server replicas to keep warm
    #[arg(short, long, default_value = "2", value_parser = clap::value_parser!(u16).range(1..))]
    pub replicas: u16,

    /// Container image for the servers
    #[arg(short, long, default_value = "tigres/minecraft-fabric:latest")]
    pub image: String,

    /// Replica names are <prefix>_<id>
    #[arg(long, default_value = "mcspeedrun")]
    pub name_prefix: String,

    /// uid:gid the servers run as
    #[arg(short, long, default_value = WORKER_USER)]
    pub user: String,

    /// Memory limit per replica, e.g. 4g
    #[arg(long)]
    pub memory: Option<String>,

    /// CPU limit per replica, e.g. 2.5
    #[arg(long)]
    pub cpus: Option<String>,

    /// Where the attempt counter is kept
    #[arg(short, long, default_value = DEFAULT_STATE_FILE)]
    pub state_file: PathBuf,

    /// Address players connect to
    #[arg(short, long, default_value_t = format!("0.0.0.0:{}", GAME_PORT))]
    pub listen: String,

    /// Port the servers listen on inside their containers
    #[arg(long, default_value_t = GAME_PORT)]
    pub backend_port: u16,

    /// Base delay between retries of failed runtime calls, in milliseconds
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..=MAX_RETRY_MS))]
    pub retry_ms: u64,

    /// Docker client binary
    #[arg(long, default_value = "docker")]
    pub docker: String,
}

impl Args {
    fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            replicas: usize::from(self.replicas),
            image: self.image.clone(),
            name_prefix: self.name_prefix.clone(),
            user: self.user.clone(),
            memory: self.memory.clone(),
            cpus: self.cpus.clone(),
            state_file: self.state_file.clone(),
            retry: self.retry(),
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            listen: self.listen.clone(),
            backend_port: self.backend_port,
            retry: self.retry(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["fleet"]).unwrap();
        assert_eq!(args.replicas, 2);
        assert_eq!(args.image, "tigres/minecraft-fabric:latest");
        assert_eq!(args.listen, "0.0.0.0:25565");
        assert_eq!(args.state_file, PathBuf::from("state.json"));

        let session = args.session_config();
        assert_eq!(session.replicas, 2);
        assert_eq!(session.retry, Duration::from_secs(1));
        assert_eq!(session.worker_spec(0).name, "mcspeedrun_0");
        assert_eq!(session.worker_spec(0).user, "1337:1337");
        assert_eq!(args.proxy_config().backend_port, 25565);
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "fleet",
            "--replicas",
            "4",
            "--memory",
            "6g",
            "--listen",
            "127.0.0.1:30000",
            "--retry-ms",
            "250",
            "--user",
            "1000:1000",
        ])
        .unwrap();

        let session = args.session_config();
        assert_eq!(session.replicas, 4);
        assert_eq!(session.memory.as_deref(), Some("6g"));
        assert_eq!(session.retry, Duration::from_millis(250));
        assert_eq!(session.worker_spec(3).user, "1000:1000");
        assert_eq!(args.proxy_config().listen, "127.0.0.1:30000");
    }

    #[test]
    fn test_retry_ms_bounds() {
        assert!(Args::try_parse_from(["fleet", "--retry-ms", "0"]).is_err());
        assert!(Args::try_parse_from(["fleet", "--retry-ms", "18446744073709551615"]).is_err());
        let args = Args::try_parse_from(["fleet", "--retry-ms", "3600000"]).unwrap();
        assert_eq!(args.session_config().retry, Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_replicas_rejected() {
        assert!(Args::try_parse_from(["fleet", "--replicas", "0"]).is_err());
    }
}
