use std::{
    io::{Read, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::arch::{shell, tsh};
use crate::command::{Command, SshLoginCommand};
use crate::config::SessionConfig;
use crate::terminal::session_manager::{
    CreatedProcess, CreationStatus, ProcessEvent, ProcessFactory, PtyProcess,
};
use crate::terminal::TerminalError;

/// How long exit reporting waits for the PTY reader to reach end of output.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub initial_cols: u16,
    pub initial_rows: u16,
    /// Typed into the terminal right after spawn.
    pub init_input: Option<String>,
}

/// Launches commands as local PTY processes: `tsh ssh` for servers, the user's shell otherwise.
pub struct PortablePtyProcessFactory {
    config: SessionConfig,
}

impl PortablePtyProcessFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub async fn spawn_spec(&self, command: &Command) -> Result<(SpawnSpec, CreationStatus), TerminalError> {
        match command {
            Command::SshLogin(cmd) => {
                let program = tsh::tsh_program_checked(self.config.tsh_program.as_deref())?;
                Ok((self.base_spec(program, ssh_args(cmd)), CreationStatus::Ok))
            }
            Command::Shell(cmd) => {
                let sh = shell::default_shell_command(self.config.shell_program.as_deref());
                let (mut env, status) = self.login_shell_env(&sh).await;
                env.extend(cluster_env(&cmd.proxy_host, &cmd.cluster_name));

                let mut spec = self.base_spec(sh.program, sh.args);
                spec.cwd = cmd.cwd.as_ref().map(PathBuf::from);
                spec.env = env;
                spec.init_input = cmd.init_command.clone();
                Ok((spec, status))
            }
            Command::KubeLogin(cmd) => {
                let sh = shell::default_shell_command(self.config.shell_program.as_deref());
                let (mut env, status) = self.login_shell_env(&sh).await;
                env.extend(cluster_env(&cmd.proxy_host, &cmd.cluster_name));
                let kubeconfig = self
                    .config
                    .kubeconfigs_dir()
                    .join(&cmd.kube_config_relative_path);
                env.push(("KUBECONFIG".to_string(), kubeconfig.to_string_lossy().to_string()));

                let mut spec = self.base_spec(sh.program, sh.args);
                spec.env = env;
                Ok((spec, status))
            }
        }
    }

    fn base_spec(&self, program: String, args: Vec<String>) -> SpawnSpec {
        SpawnSpec {
            program,
            args,
            cwd: None,
            env: Vec::new(),
            initial_cols: self.config.initial_cols,
            initial_rows: self.config.initial_rows,
            init_input: None,
        }
    }

    async fn login_shell_env(&self, sh: &shell::ShellProgram) -> (Vec<(String, String)>, CreationStatus) {
        if !sh.is_posix() {
            return (Vec::new(), CreationStatus::Ok);
        }
        match probe_login_shell_env(&sh.program, self.config.shell_env_timeout()).await {
            EnvProbe::Captured(env) => (env, CreationStatus::Ok),
            EnvProbe::TimedOut => (Vec::new(), CreationStatus::ShellEnvResolutionTimedOut),
            EnvProbe::Unavailable => (Vec::new(), CreationStatus::Ok),
        }
    }
}

#[async_trait]
impl ProcessFactory for PortablePtyProcessFactory {
    async fn create_process(&self, command: &Command) -> Result<CreatedProcess, TerminalError> {
        let (spec, creation_status) = self.spawn_spec(command).await?;
        debug!(program = %spec.program, args = ?spec.args, "spawning terminal process");

        let (process, events) = tokio::task::spawn_blocking(move || spawn(spec))
            .await
            .map_err(|e| TerminalError::Backend(e.to_string()))??;

        Ok(CreatedProcess {
            process: Arc::new(process),
            events,
            creation_status,
        })
    }
}

fn ssh_args(cmd: &SshLoginCommand) -> Vec<String> {
    let cluster = cmd.leaf_cluster_id.as_deref().unwrap_or(&cmd.cluster_name);
    let target = match &cmd.login {
        Some(login) => format!("{login}@{}", cmd.server_id),
        None => cmd.server_id.clone(),
    };
    vec![
        "ssh".to_string(),
        format!("--proxy={}", cmd.proxy_host),
        format!("--cluster={cluster}"),
        target,
    ]
}

fn cluster_env(proxy_host: &str, cluster_name: &str) -> Vec<(String, String)> {
    vec![
        ("TELEPORT_PROXY".to_string(), proxy_host.to_string()),
        ("TELEPORT_CLUSTER".to_string(), cluster_name.to_string()),
    ]
}

enum EnvProbe {
    Captured(Vec<(String, String)>),
    TimedOut,
    Unavailable,
}

/// Runs `shell -l -c env` so GUI-launched sessions see the same environment as a login shell.
async fn probe_login_shell_env(program: &str, deadline: Duration) -> EnvProbe {
    let output = tokio::process::Command::new(program)
        .args(["-l", "-c", "env"])
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(deadline, output).await {
        Err(_) => EnvProbe::TimedOut,
        Ok(Ok(output)) if output.status.success() => {
            EnvProbe::Captured(parse_env(&String::from_utf8_lossy(&output.stdout)))
        }
        Ok(Ok(output)) => {
            debug!(program, status = %output.status, "login shell environment probe failed");
            EnvProbe::Unavailable
        }
        Ok(Err(err)) => {
            debug!(program, %err, "could not run login shell environment probe");
            EnvProbe::Unavailable
        }
    }
}

fn parse_env(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| {
            !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub struct PortablePtyProcess {
    id: String,
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    disposed: AtomicBool,
}

fn lock<T: ?Sized>(mutex: &Mutex<Box<T>>) -> MutexGuard<'_, Box<T>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl PtyProcess for PortablePtyProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn cwd(&self) -> Result<Option<String>, TerminalError> {
        #[cfg(target_os = "linux")]
        {
            if let Some(pid) = self.pid {
                let link = tokio::fs::read_link(format!("/proc/{pid}/cwd"))
                    .await
                    .map_err(|e| TerminalError::Backend(e.to_string()))?;
                return Ok(Some(link.to_string_lossy().to_string()));
            }
        }

        Ok(None)
    }

    fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        let mut w = lock(&self.writer);
        w.write_all(data)
            .map_err(|e| TerminalError::Backend(e.to_string()))?;
        w.flush().ok();
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Backend(e.to_string()))
    }

    fn dispose(&self) -> Result<(), TerminalError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The process may already be gone; killing it again is harmless.
        if let Err(err) = lock(&self.killer).kill() {
            debug!(process = %self.id, %err, "terminal process was not running at dispose");
        }
        Ok(())
    }
}

/// Spawns `spec` on a fresh PTY. `Open` is queued before this returns.
pub fn spawn(spec: SpawnSpec) -> Result<(PortablePtyProcess, mpsc::UnboundedReceiver<ProcessEvent>), TerminalError> {
    let pty_system = native_pty_system();
    let PtyPair { slave, master } = pty_system
        .openpty(PtySize {
            rows: spec.initial_rows,
            cols: spec.initial_cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| TerminalError::Backend(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        cmd.cwd(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = slave
        .spawn_command(cmd)
        .map_err(|e| TerminalError::Backend(e.to_string()))?;
    // Our copy of the slave must go, or the reader never sees EOF.
    drop(slave);

    let killer = child.clone_killer();
    let pid = child.process_id();

    let mut reader = master
        .try_clone_reader()
        .map_err(|e| TerminalError::Backend(e.to_string()))?;
    let mut writer = master
        .take_writer()
        .map_err(|e| TerminalError::Backend(e.to_string()))?;

    if let Some(init) = &spec.init_input {
        writer
            .write_all(format!("{init}\r").as_bytes())
            .map_err(|e| TerminalError::Backend(e.to_string()))?;
        writer.flush().ok();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(ProcessEvent::Open);

    // Read loop: PTY -> data events.
    let data_tx = tx.clone();
    let (drained_tx, drained_rx) = std::sync::mpsc::channel::<()>();
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if data_tx.send(ProcessEvent::Data(buf[..n].to_vec())).is_err() {
                break;
            }
        }
        let _ = drained_tx.send(());
    });

    // Finalize on child exit (more reliable than PTY EOF on Windows).
    let id = Uuid::new_v4().to_string();
    let exit_id = id.clone();
    thread::spawn(move || {
        let exit_code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
            Err(err) => {
                warn!(process = %exit_id, %err, "failed to wait for terminal process");
                -1
            }
        };
        // Give the reader a moment to flush the child's last output. Background children
        // that inherited the PTY can keep it open indefinitely, so the wait is bounded.
        if drained_rx.recv_timeout(OUTPUT_DRAIN_TIMEOUT).is_err() {
            debug!(process = %exit_id, "terminal output still open after exit, reporting exit anyway");
        }
        let _ = tx.send(ProcessEvent::Exit { exit_code });
    });

    let process = PortablePtyProcess {
        id,
        pid,
        writer: Mutex::new(writer),
        master: Mutex::new(master),
        killer: Mutex::new(killer),
        disposed: AtomicBool::new(false),
    };
    Ok((process, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{KubeLoginCommand, ShellCommand};

    fn ssh_command(leaf: Option<&str>, login: Option<&str>) -> SshLoginCommand {
        SshLoginCommand {
            proxy_host: "teleport.example.com:443".to_string(),
            cluster_name: "prod".to_string(),
            login: login.map(str::to_string),
            server_id: "4f1c".to_string(),
            root_cluster_id: "prod".to_string(),
            leaf_cluster_id: leaf.map(str::to_string),
        }
    }

    #[test]
    fn ssh_args_target_login_and_cluster() {
        assert_eq!(
            ssh_args(&ssh_command(None, Some("root"))),
            ["ssh", "--proxy=teleport.example.com:443", "--cluster=prod", "root@4f1c"]
        );
        assert_eq!(
            ssh_args(&ssh_command(Some("edge"), None)),
            ["ssh", "--proxy=teleport.example.com:443", "--cluster=edge", "4f1c"]
        );
    }

    #[test]
    fn env_output_is_parsed_line_by_line() {
        let env = parse_env("HOME=/home/ops\nPATH=/usr/bin:/bin\n continued line\nBAD KEY=x\nEMPTY=\n");
        assert_eq!(
            env,
            vec![
                ("HOME".to_string(), "/home/ops".to_string()),
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn ssh_spec_uses_configured_tsh() {
        let tsh = tempfile::NamedTempFile::new().unwrap();
        let factory = PortablePtyProcessFactory::new(SessionConfig {
            tsh_program: Some(tsh.path().to_string_lossy().to_string()),
            ..SessionConfig::default()
        });

        let (spec, status) = factory
            .spawn_spec(&Command::SshLogin(ssh_command(None, Some("root"))))
            .await
            .unwrap();

        assert_eq!(spec.program, tsh.path().to_string_lossy());
        assert_eq!(spec.args.last().map(String::as_str), Some("root@4f1c"));
        assert_eq!((spec.initial_cols, spec.initial_rows), (120, 30));
        assert_eq!(status, CreationStatus::Ok);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_spec_carries_cwd_init_and_cluster_env() {
        let factory = PortablePtyProcessFactory::new(SessionConfig {
            shell_program: Some("/bin/sh".to_string()),
            ..SessionConfig::default()
        });
        let command = Command::Shell(ShellCommand {
            proxy_host: "proxy:443".to_string(),
            cluster_name: "prod".to_string(),
            cwd: Some("/tmp".to_string()),
            init_command: Some("echo hello".to_string()),
        });

        let (spec, _) = factory.spawn_spec(&command).await.unwrap();

        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.init_input.as_deref(), Some("echo hello"));
        assert!(spec.env.contains(&("TELEPORT_CLUSTER".to_string(), "prod".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kube_spec_points_kubeconfig_into_configured_dir() {
        let factory = PortablePtyProcessFactory::new(SessionConfig {
            shell_program: Some("/bin/sh".to_string()),
            kubeconfigs_dir: Some(PathBuf::from("/var/opspad/kube")),
            ..SessionConfig::default()
        });
        let command = Command::KubeLogin(KubeLoginCommand {
            kube_id: "main".to_string(),
            kube_config_relative_path: "prod/main".to_string(),
            root_cluster_id: "prod".to_string(),
            leaf_cluster_id: None,
            proxy_host: "proxy:443".to_string(),
            cluster_name: "prod".to_string(),
        });

        let (spec, _) = factory.spawn_spec(&command).await.unwrap();

        assert!(spec
            .env
            .contains(&("KUBECONFIG".to_string(), "/var/opspad/kube/prod/main".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_process_reports_open_data_and_exit() {
        let (process, mut events) = spawn(SpawnSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "printf ready".to_string()],
            cwd: None,
            env: Vec::new(),
            initial_cols: 80,
            initial_rows: 24,
            init_input: None,
        })
        .unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            let done = matches!(event, ProcessEvent::Exit { .. });
            seen.push(event);
            if done {
                break;
            }
        }

        assert_eq!(seen.first(), Some(&ProcessEvent::Open));
        assert_eq!(seen.last(), Some(&ProcessEvent::Exit { exit_code: 0 }));
        let output: Vec<u8> = seen
            .iter()
            .filter_map(|event| match event {
                ProcessEvent::Data(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert!(String::from_utf8_lossy(&output).contains("ready"));
        process.dispose().unwrap();
        process.dispose().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_is_reported_while_a_background_child_holds_the_pty() {
        let (process, mut events) = spawn(SpawnSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "trap '' HUP; sleep 6 & exit 0".to_string()],
            cwd: None,
            env: Vec::new(),
            initial_cols: 80,
            initial_rows: 24,
            init_input: None,
        })
        .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match events.recv().await {
                    Some(ProcessEvent::Exit { exit_code }) => return Some(exit_code),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .expect("exit should not wait for the background child");

        assert_eq!(exit, Some(0));
        process.dispose().unwrap();
    }
}
