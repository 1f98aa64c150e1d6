//! Engine process supervision.
//!
//! The supervisor launches the analysis engine, watches the first line of its
//! stdout for the readiness announcement and reports exits. Background tasks
//! only post [`EngineEvent`]s; state changes happen when the relay feeds those
//! events back through [`Supervisor::observe_first_line`] and
//! [`Supervisor::mark_exited`].

use std::io;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::RelayError;
use crate::relay::RelayEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Ready { port: u16 },
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    Failed(String),
}

impl EngineState {
    pub fn label(&self) -> &'static str {
        match self {
            EngineState::Starting => "starting",
            EngineState::Ready { .. } => "ready",
            EngineState::Exited { .. } => "exited",
            EngineState::Failed(_) => "failed",
        }
    }

    fn is_running(&self) -> bool {
        matches!(self, EngineState::Starting | EngineState::Ready { .. })
    }
}

#[derive(Debug)]
pub enum EngineEvent {
    /// The first line the engine wrote to stdout.
    FirstLine { generation: u64, line: String },
    Exited {
        generation: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// One launched engine instance.
#[derive(Debug)]
pub struct EngineProcess {
    /// Increments for every spawn attempt.
    pub generation: u64,
    pub pid: Option<u32>,
    pub state: EngineState,
    stop: Option<oneshot::Sender<()>>,
    stop_requested: bool,
}

impl EngineProcess {
    pub fn ready_port(&self) -> Option<u16> {
        match self.state {
            EngineState::Ready { port } => Some(port),
            _ => None,
        }
    }
}

pub struct Supervisor {
    config: EngineConfig,
    readiness_line: String,
    process: Option<EngineProcess>,
    next_generation: u64,
}

impl Supervisor {
    pub fn new(config: EngineConfig) -> Self {
        let readiness_line = config.readiness_line();
        Self {
            config,
            readiness_line,
            process: None,
            next_generation: 1,
        }
    }

    pub fn process(&self) -> Option<&EngineProcess> {
        self.process.as_ref()
    }

    /// Generation of the engine if it is currently ready.
    pub fn ready_generation(&self) -> Option<u64> {
        self.process
            .as_ref()
            .filter(|process| process.ready_port().is_some())
            .map(|process| process.generation)
    }

    /// Ensures an engine is starting or running.
    ///
    /// Does nothing while an engine is Starting or Ready, and never retries
    /// after a spawn failure. A previously exited engine is replaced. The
    /// error is returned only from the attempt that failed.
    pub fn start(
        &mut self,
        events: &mpsc::Sender<RelayEvent>,
    ) -> Result<&EngineProcess, RelayError> {
        let respawn = match &self.process {
            None | Some(EngineProcess { state: EngineState::Exited { .. }, .. }) => true,
            Some(_) => false,
        };
        if respawn {
            self.spawn(events)?;
        }
        self.process
            .as_ref()
            .ok_or_else(|| RelayError::SpawnFailure {
                command: self.config.command.clone(),
                source: std::io::Error::other("engine process missing after spawn"),
            })
    }

    fn spawn(&mut self, events: &mpsc::Sender<RelayEvent>) -> Result<(), RelayError> {
        let generation = self.next_generation;
        self.next_generation += 1;

        info!(
            "Starting engine: {} {}",
            self.config.command,
            self.config.args.join(" ")
        );
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.process = Some(EngineProcess {
                    generation,
                    pid: None,
                    state: EngineState::Failed(source.to_string()),
                    stop: None,
                    stop_requested: false,
                });
                return Err(RelayError::SpawnFailure {
                    command: self.config.command.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(watch_stdout(generation, stdout, events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(generation, stderr));
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(watch_exit(generation, child, stop_rx, events.clone()));

        self.process = Some(EngineProcess {
            generation,
            pid,
            state: EngineState::Starting,
            stop: Some(stop_tx),
            stop_requested: false,
        });
        Ok(())
    }

    /// Checks the engine's first stdout line against the readiness literal.
    ///
    /// Returns the announced port when the line matches exactly and the
    /// engine moved to Ready.
    pub fn observe_first_line(&mut self, generation: u64, line: &str) -> Option<u16> {
        let process = self
            .process
            .as_mut()
            .filter(|process| process.generation == generation)?;
        if process.state != EngineState::Starting {
            return None;
        }
        debug!("Engine output: {}", line);
        if line == self.readiness_line {
            let port = self.config.port;
            process.state = EngineState::Ready { port };
            Some(port)
        } else {
            warn!("Unexpected output from engine: {:?}", line);
            None
        }
    }

    /// Records an exit. Returns whether the exit was requested by the relay,
    /// or `None` if the event belongs to an older engine.
    pub fn mark_exited(
        &mut self,
        generation: u64,
        code: Option<i32>,
        signal: Option<i32>,
    ) -> Option<bool> {
        let process = self
            .process
            .as_mut()
            .filter(|process| process.generation == generation)?;
        if !process.state.is_running() {
            return None;
        }
        process.state = EngineState::Exited { code, signal };
        process.stop = None;
        Some(process.stop_requested)
    }

    /// Asks a running engine to terminate. The exit is reported later as an
    /// expected [`EngineEvent::Exited`].
    pub fn stop(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        if !process.state.is_running() {
            return;
        }
        process.stop_requested = true;
        if let Some(stop) = process.stop.take() {
            info!("Stopping engine (pid {:?})", process.pid);
            let _ = stop.send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn force_ready_for_tests(&mut self, port: u16) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.process = Some(EngineProcess {
            generation,
            pid: None,
            state: EngineState::Ready { port },
            stop: None,
            stop_requested: false,
        });
        generation
    }

    #[cfg(test)]
    pub(crate) fn force_starting_for_tests(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.process = Some(EngineProcess {
            generation,
            pid: None,
            state: EngineState::Starting,
            stop: None,
            stop_requested: false,
        });
        generation
    }
}

/// Reads one line as raw bytes and strips the `\n` or `\r\n` terminator.
/// Invalid UTF-8 is replaced instead of ending the read, so the pipe is never
/// closed while the engine still writes to it.
async fn read_line_lossy(
    reader: &mut (impl AsyncBufRead + Unpin),
    buf: &mut Vec<u8>,
) -> io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn watch_stdout(
    generation: u64,
    stdout: impl AsyncRead + Unpin,
    events: mpsc::Sender<RelayEvent>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    match read_line_lossy(&mut reader, &mut buf).await {
        Ok(Some(line)) => {
            let event = EngineEvent::FirstLine { generation, line };
            if events.send(RelayEvent::Engine(event)).await.is_err() {
                return;
            }
        }
        Ok(None) => return,
        Err(err) => {
            warn!("Failed to read engine stdout: {err}");
            return;
        }
    }
    // Later output is not inspected, only drained so the engine never blocks
    // on a full pipe.
    drain_lines(&mut reader, &mut buf, |line| debug!("engine stdout: {}", line)).await;
}

async fn drain_stderr(generation: u64, stderr: impl AsyncRead + Unpin) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    drain_lines(&mut reader, &mut buf, |line| {
        debug!("engine #{generation} stderr: {}", line);
    })
    .await;
}

async fn drain_lines(
    reader: &mut (impl AsyncBufRead + Unpin),
    buf: &mut Vec<u8>,
    mut log: impl FnMut(&str),
) {
    loop {
        match read_line_lossy(reader, buf).await {
            Ok(Some(line)) => log(&line),
            Ok(None) => return,
            Err(err) => {
                warn!("Failed to read engine output: {err}");
                return;
            }
        }
    }
}

async fn watch_exit(
    generation: u64,
    mut child: Child,
    stop: oneshot::Receiver<()>,
    events: mpsc::Sender<RelayEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop => {
            if let Err(err) = child.start_kill() {
                warn!("Failed to kill engine: {err}");
            }
            child.wait().await
        }
    };
    let (code, signal) = match status {
        Ok(status) => exit_details(status),
        Err(err) => {
            warn!("Failed to wait for engine exit: {err}");
            (None, None)
        }
    };
    let event = EngineEvent::Exited {
        generation,
        code,
        signal,
    };
    let _ = events.send(RelayEvent::Engine(event)).await;
}

#[cfg(unix)]
fn exit_details(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn exit_details(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}
