//! [`Runtime`] backed by the `docker` command-line client

use super::{Runtime, RuntimeError, WorkerInfo, WorkerOutput, WorkerSpec};
use async_trait::async_trait;
use log::{debug, info};
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWriteExt, BufReader, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// How long `docker attach` gets to refuse a console line. A working attach
/// never exits by itself, so one still running after this is killed.
const ATTACH_GRACE: Duration = Duration::from_millis(250);

pub struct DockerCli {
    program: String,
}

impl DockerCli {
    /// Checks that the daemon answers before handing out a client
    pub async fn connect(program: &str) -> Result<Self, RuntimeError> {
        let cli = Self {
            program: program.to_string(),
        };
        let version = cli
            .output(&["version", "--format", "{{.Server.Version}}"])
            .await?;
        info!("Connected to docker daemon {}", version);
        Ok(cli)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        cmd
    }

    fn spawn_err(&self, source: io::Error) -> RuntimeError {
        RuntimeError::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    /// Runs a short-lived docker command and returns its trimmed stdout
    async fn output(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!("{} {}", self.program, args.join(" "));
        let out = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_err(e))?;

        if !out.status.success() {
            return Err(RuntimeError::Command {
                command: format!("{} {}", self.program, args.first().copied().unwrap_or_default()),
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn create_args(spec: &WorkerSpec) -> Vec<&str> {
    let mut args = vec![
        "create",
        "--name",
        spec.name.as_str(),
        "--user",
        spec.user.as_str(),
        "--interactive",
        "--rm",
    ];
    if let Some(memory) = &spec.memory {
        args.extend(["--memory", memory.as_str()]);
    }
    if let Some(cpus) = &spec.cpus {
        args.extend(["--cpus", cpus.as_str()]);
    }
    args.push(spec.image.as_str());
    args
}

#[async_trait]
impl Runtime for DockerCli {
    async fn create(&self, spec: &WorkerSpec) -> Result<String, RuntimeError> {
        self.output(&create_args(spec)).await
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        self.output(&["start", handle]).await.map(|_| ())
    }

    async fn kill(&self, name: &str, signal: &str) -> Result<(), RuntimeError> {
        self.output(&["kill", "--signal", signal, name]).await.map(|_| ())
    }

    async fn inspect(&self, name: &str) -> Result<WorkerInfo, RuntimeError> {
        let address = self
            .output(&[
                "inspect",
                "--format",
                "{{.NetworkSettings.IPAddress}}",
                name,
            ])
            .await?;
        Ok(WorkerInfo { address })
    }

    async fn send_input(&self, name: &str, line: &str) -> Result<(), RuntimeError> {
        debug!("{} attach {} <- {}", self.program, name, line);
        let mut child = self
            .command(&["attach", "--sig-proxy=false", name])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_err(e))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Other(format!("no stdin pipe for {}", name)))?;

        let written = write_line(&mut stdin, line).await;
        drop(stdin);

        match tokio::time::timeout(ATTACH_GRACE, child.wait_with_output()).await {
            Ok(Ok(out)) if !out.status.success() => {
                return Err(RuntimeError::Command {
                    command: format!("{} attach", self.program),
                    status: out.status,
                    stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
                });
            }
            Ok(Err(e)) => return Err(self.spawn_err(e)),
            Ok(Ok(_)) | Err(_) => {}
        }

        written.map_err(|source| RuntimeError::Console {
            name: name.to_string(),
            source,
        })
    }

    async fn stream_logs(&self, name: &str) -> Result<WorkerOutput, RuntimeError> {
        let mut child = self
            .command(&["logs", "--follow", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_err(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Other(format!("no stdout pipe for {}", name)))?;
        Ok(Box::new(ChildOutput {
            _child: child,
            stdout: BufReader::new(stdout),
        }))
    }

    async fn wait_removed(&self, name: &str) -> Result<(), RuntimeError> {
        self.output(&["wait", name]).await.map(|_| ())
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Keeps the `docker logs` process alive while the stream is read, and kills
/// it once the reader is dropped
struct ChildOutput {
    _child: Child,
    stdout: BufReader<ChildStdout>,
}

impl AsyncRead for ChildOutput {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncBufRead for ChildOutput {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().stdout).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().stdout).consume(amt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn spec() -> WorkerSpec {
        WorkerSpec {
            name: "mcspeedrun_0".to_string(),
            image: "tigres/minecraft-fabric:latest".to_string(),
            user: "1337:1337".to_string(),
            memory: None,
            cpus: None,
        }
    }

    #[test]
    fn test_create_args_minimal() {
        let spec = spec();
        assert_eq!(
            create_args(&spec),
            vec![
                "create",
                "--name",
                "mcspeedrun_0",
                "--user",
                "1337:1337",
                "--interactive",
                "--rm",
                "tigres/minecraft-fabric:latest",
            ]
        );
    }

    #[test]
    fn test_create_args_allow_piped_console() {
        // `docker attach` refuses piped input for workers created with a tty
        let spec = spec();
        let args = create_args(&spec);
        assert!(args.contains(&"--interactive"));
        assert!(!args.iter().any(|arg| *arg == "--tty" || *arg == "-t"));
    }

    #[test]
    fn test_create_args_with_limits() {
        let spec = WorkerSpec {
            memory: Some("4g".to_string()),
            cpus: Some("2".to_string()),
            ..spec()
        };
        let args = create_args(&spec);
        assert_eq!(args.last(), Some(&"tigres/minecraft-fabric:latest"));
        assert!(args.windows(2).any(|w| w == ["--memory", "4g"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "2"]));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let result = DockerCli::connect("/nonexistent/docker-binary").await;
        match result {
            Err(RuntimeError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/docker-binary")
            }
            Err(other) => panic!("expected spawn error, got {}", other),
            Ok(_) => panic!("connect should fail without a docker binary"),
        }
    }

    /// Stands in a shell script for the docker binary
    #[cfg(unix)]
    fn fake_docker(dir: &std::path::Path, body: &str) -> DockerCli {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        DockerCli {
            program: path.to_string_lossy().into_owned(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_input_writes_console_line() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console");
        let cli = fake_docker(
            dir.path(),
            &format!(
                "[ \"$1\" = attach ] && [ \"$3\" = mcspeedrun_0 ] || exit 2\ncat >> '{}'",
                console.display()
            ),
        );

        assert_ok!(cli.send_input("mcspeedrun_0", "/time set 0").await);
        assert_ok!(cli.send_input("mcspeedrun_0", "/save-off").await);
        assert_eq!(
            std::fs::read_to_string(&console).unwrap(),
            "/time set 0\n/save-off\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_input_stops_lingering_attach() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console");
        let cli = fake_docker(
            dir.path(),
            &format!("cat >> '{}'\nexec sleep 30", console.display()),
        );

        let started = std::time::Instant::now();
        assert_ok!(cli.send_input("mcspeedrun_0", "/time set 0").await);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(std::fs::read_to_string(&console).unwrap(), "/time set 0\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_input_reports_refused_attach() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_docker(dir.path(), "echo 'the input device is not a TTY' >&2\nexit 1");

        match cli.send_input("mcspeedrun_0", "/save-off").await {
            Err(RuntimeError::Command { command, stderr, .. }) => {
                assert!(command.ends_with(" attach"));
                assert_eq!(stderr, "the input device is not a TTY");
            }
            other => panic!("expected attach to be refused, got {:?}", other),
        }
    }
}
