//! The relay actor.
//!
//! A single task owns the supervisor, the bridge and the open documents and
//! processes [`RelayEvent`]s from one ordered queue. Editor notifications,
//! engine output, socket traffic and timers all arrive through that queue and
//! every handler runs to completion, so state transitions never race.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tower_lsp::lsp_types::{MessageType, TextDocumentContentChangeEvent, Url};
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeEvent, BridgeState, PendingAnalysis};
use crate::config::RelayConfig;
use crate::countdown::{count_down_blocking, spawn_count_down_non_blocking};
use crate::error::RelayError;
use crate::outbound::Outbox;
use crate::sessions::SessionStore;
use crate::supervisor::{EngineEvent, EngineProcess, Supervisor};
use crate::translate::{document_range, translate, DiagnosticSet};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum RelayEvent {
    /// Replaces the configuration if no engine has been started yet.
    Configure(RelayConfig),
    DocumentOpened {
        uri: Url,
        version: i32,
        text: String,
    },
    DocumentChanged {
        uri: Url,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    },
    DocumentClosed {
        uri: Url,
    },
    CountDownBlocking {
        done: oneshot::Sender<()>,
    },
    CountDownNonBlocking,
    Status(oneshot::Sender<RelayStatus>),
    Engine(EngineEvent),
    Bridge(BridgeEvent),
    /// The settle delay after readiness has elapsed.
    ConnectDue {
        generation: u64,
        port: u16,
    },
    /// The reply timeout for a request sent on connection `epoch` elapsed.
    ReplyTimeout {
        epoch: u64,
        generation: u64,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Snapshot of the relay state, reported by the status command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub engine: String,
    pub engine_generation: Option<u64>,
    pub engine_pid: Option<u32>,
    pub engine_port: Option<u16>,
    pub bridge: String,
    pub bridge_url: Option<String>,
    pub in_flight: usize,
    pub queued: usize,
    pub documents: usize,
}

/// Cloneable entry point used by the editor-protocol handlers.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayEvent>,
}

impl RelayHandle {
    pub async fn send(&self, event: RelayEvent) {
        if self.tx.send(event).await.is_err() {
            warn!("Relay has stopped; dropping event");
        }
    }

    /// Runs the blocking countdown and waits for it to finish.
    pub async fn count_down_blocking(&self) {
        let (done, finished) = oneshot::channel();
        self.send(RelayEvent::CountDownBlocking { done }).await;
        let _ = finished.await;
    }

    pub async fn status(&self) -> Option<RelayStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayEvent::Status(tx)).await;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        self.send(RelayEvent::Shutdown { done }).await;
        let _ = finished.await;
    }
}

pub struct Relay {
    config: RelayConfig,
    supervisor: Supervisor,
    bridge: Bridge,
    sessions: SessionStore,
    outbox: Outbox,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: mpsc::Receiver<RelayEvent>,
    /// Engine generation whose settle delay is still running.
    pending_connect: Option<u64>,
}

impl Relay {
    pub fn new(config: RelayConfig, outbox: Outbox) -> (Self, RelayHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = RelayHandle {
            tx: events_tx.clone(),
        };
        let relay = Self {
            supervisor: Supervisor::new(config.engine.clone()),
            bridge: Bridge::new(),
            sessions: SessionStore::new(),
            config,
            outbox,
            events_tx,
            events_rx,
            pending_connect: None,
        };
        (relay, handle)
    }

    /// Starts the relay on the current runtime.
    pub fn spawn(config: RelayConfig, outbox: Outbox) -> RelayHandle {
        let (relay, handle) = Relay::new(config, outbox);
        tokio::spawn(relay.run());
        handle
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        debug!("Relay stopped");
    }

    /// Processes one event. Returns false once the relay should stop.
    pub(crate) fn handle(&mut self, event: RelayEvent) -> bool {
        match event {
            RelayEvent::Configure(config) => self.configure(config),
            RelayEvent::DocumentOpened { uri, version, text } => {
                self.did_open(uri, version, text);
            }
            RelayEvent::DocumentChanged {
                uri,
                version,
                changes,
            } => self.did_change(&uri, version, &changes),
            RelayEvent::DocumentClosed { uri } => self.did_close(uri),
            RelayEvent::CountDownBlocking { done } => {
                count_down_blocking(&self.outbox, &self.config.countdown);
                let _ = done.send(());
            }
            RelayEvent::CountDownNonBlocking => {
                spawn_count_down_non_blocking(self.outbox.clone(), self.config.countdown.clone());
            }
            RelayEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
            RelayEvent::Engine(event) => self.on_engine_event(event),
            RelayEvent::Bridge(event) => self.on_bridge_event(event),
            RelayEvent::ConnectDue { generation, port } => self.on_connect_due(generation, port),
            RelayEvent::ReplyTimeout { epoch, generation } => {
                self.on_reply_timeout(epoch, generation);
            }
            RelayEvent::Shutdown { done } => {
                info!("Relay shutting down");
                self.bridge.close();
                self.supervisor.stop();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn configure(&mut self, config: RelayConfig) {
        if self.supervisor.process().is_some() {
            warn!("Engine already started; ignoring configuration change");
            return;
        }
        if let Some(path) = &config.config_path {
            info!("Using relay configuration from {}", path.display());
        }
        self.supervisor = Supervisor::new(config.engine.clone());
        self.bridge = Bridge::new();
        self.config = config;
    }

    fn did_open(&mut self, uri: Url, version: i32, text: String) {
        info!("Document opened: {}", uri);
        self.bootstrap();
        self.sessions.open(uri.clone(), version, text);
        self.outbox.show_message(
            MessageType::INFO,
            format!("Text Document Did Open: {uri}"),
        );
        self.analyze(&uri);
    }

    fn did_change(&mut self, uri: &Url, version: i32, changes: &[TextDocumentContentChangeEvent]) {
        debug!("Document changed: {}", uri);
        if changes.is_empty() {
            return;
        }
        if !self.sessions.apply_changes(uri, version, changes) {
            warn!("Received change for unknown or out-of-sync document: {}", uri);
            return;
        }
        self.bootstrap();
        self.analyze(uri);
    }

    fn did_close(&mut self, uri: Url) {
        info!("Document closed: {}", uri);
        self.sessions.close(&uri);
        self.outbox.publish(DiagnosticSet::clear(uri), None);
        self.outbox
            .show_message(MessageType::INFO, "Text Document Did Close");
    }

    /// Makes sure an engine is running and the bridge is (being) connected.
    fn bootstrap(&mut self) {
        let ready = match self.supervisor.start(&self.events_tx) {
            Ok(process) => process
                .ready_port()
                .map(|port| (process.generation, port)),
            Err(err) => {
                warn!("{err}");
                self.outbox.show_message(
                    MessageType::ERROR,
                    format!("Analysis engine unavailable: {err}"),
                );
                None
            }
        };
        if let Some((generation, port)) = ready {
            self.ensure_connected(generation, port);
        }
    }

    fn ensure_connected(&mut self, generation: u64, port: u16) {
        if self.pending_connect == Some(generation) {
            return;
        }
        if matches!(
            self.bridge.state(),
            BridgeState::Connecting | BridgeState::Open
        ) {
            return;
        }
        let url = self.config.engine.socket_url(port);
        self.bridge.connect(url, generation, &self.events_tx);
    }

    /// Queues the current text of `uri` for analysis.
    ///
    /// A new request generation is taken right away, so a reply to an older
    /// snapshot can never overwrite the current state.
    fn analyze(&mut self, uri: &Url) {
        if self.sessions.request_analysis(uri).is_none() {
            return;
        }
        if self.bridge.state() != BridgeState::Open {
            debug!("Bridge not open; {} waits for the connection", uri);
        }
        self.pump();
    }

    /// Sends the next queued document once the engine has answered the
    /// previous one.
    fn pump(&mut self) {
        while self.bridge.is_idle() {
            let Some(uri) = self.sessions.next_queued() else {
                return;
            };
            let Some(session) = self.sessions.get(&uri) else {
                continue;
            };
            let generation = session.latest_request;
            let text = session.text.clone();
            let pending = PendingAnalysis {
                uri: uri.clone(),
                generation,
                range: document_range(&text),
            };
            if let Err(err) = self.bridge.send(text, pending) {
                warn!("Analysis request for {} not sent: {err}", uri);
                self.sessions.requeue(&uri);
                return;
            }
            self.arm_reply_timeout(generation);
        }
    }

    fn arm_reply_timeout(&self, generation: u64) {
        let epoch = self.bridge.epoch();
        let timeout = self.config.bridge.reply_timeout;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events
                .send(RelayEvent::ReplyTimeout { epoch, generation })
                .await;
        });
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::FirstLine { generation, line } => {
                let Some(port) = self.supervisor.observe_first_line(generation, &line) else {
                    return;
                };
                info!("Engine ready on port {port}");
                self.pending_connect = Some(generation);
                let delay = self.config.engine.settle_delay;
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events
                        .send(RelayEvent::ConnectDue { generation, port })
                        .await;
                });
            }
            EngineEvent::Exited {
                generation,
                code,
                signal,
            } => {
                let Some(expected) = self.supervisor.mark_exited(generation, code, signal) else {
                    return;
                };
                info!("Engine exited with code {code:?} and signal {signal:?}");
                if self.pending_connect == Some(generation) {
                    self.pending_connect = None;
                }
                if self.bridge.engine_generation() == generation && self.bridge.close() {
                    info!("Bridge closed because the engine exited");
                }
                if !expected {
                    let err = RelayError::UnexpectedExit { code, signal };
                    warn!("{err}");
                    self.outbox.show_message(
                        MessageType::WARNING,
                        format!("Analysis engine stopped: {err}"),
                    );
                }
            }
        }
    }

    fn on_connect_due(&mut self, generation: u64, port: u16) {
        if self.pending_connect != Some(generation) {
            return;
        }
        self.pending_connect = None;
        if self.supervisor.ready_generation() == Some(generation) {
            self.ensure_connected(generation, port);
        }
    }

    fn on_bridge_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Opened { epoch, writer } => {
                let engine_ready =
                    self.supervisor.ready_generation() == Some(self.bridge.engine_generation());
                if !engine_ready {
                    warn!("Bridge opened without a ready engine; closing it");
                    self.bridge.mark_open(epoch, writer);
                    self.bridge.close();
                    return;
                }
                if !self.bridge.mark_open(epoch, writer) {
                    debug!("Discarding stale bridge connection");
                    return;
                }
                info!(
                    "Bridge connected to {}",
                    self.bridge.url().unwrap_or_default()
                );
                for uri in self.sessions.uris() {
                    self.sessions.requeue(&uri);
                }
                self.pump();
            }
            BridgeEvent::ConnectFailed { epoch, error } => {
                if self.bridge.mark_connect_failed(epoch) {
                    warn!("{error}");
                }
            }
            BridgeEvent::Message { epoch, text } => self.on_reply(epoch, &text),
            BridgeEvent::Closed { epoch, reason } => {
                if !self.bridge.is_current(epoch) || !self.bridge.close() {
                    return;
                }
                info!("Bridge closed: {reason}");
                // The engine is useless without its connection.
                self.supervisor.stop();
            }
        }
    }

    fn on_reply(&mut self, epoch: u64, text: &str) {
        if !self.bridge.is_current(epoch) || self.bridge.state() != BridgeState::Open {
            debug!("Ignoring reply from a closed connection");
            return;
        }
        let Some(pending) = self.bridge.take_reply_context() else {
            warn!("Engine reply without a pending request: {}", text);
            return;
        };
        if self.sessions.is_current(&pending.uri, pending.generation) {
            if let Some(set) = translate(text, &pending.uri, pending.range) {
                let version = self
                    .sessions
                    .set_diagnostics(&set.uri, set.diagnostics.clone());
                self.outbox.publish(set, version);
            }
        } else {
            debug!("Discarding stale reply for {}", pending.uri);
        }
        self.pump();
    }

    /// The engine never answered the outstanding request. Later replies on
    /// this connection cannot be matched any more, so it is replaced by a
    /// fresh one and the document is sent again.
    fn on_reply_timeout(&mut self, epoch: u64, generation: u64) {
        if !self.bridge.is_current(epoch) {
            return;
        }
        let Some(uri) = self
            .bridge
            .outstanding()
            .filter(|pending| pending.generation == generation)
            .map(|pending| pending.uri.clone())
        else {
            return;
        };
        warn!(
            "Engine did not answer the analysis of {} within {:?}; reconnecting",
            uri, self.config.bridge.reply_timeout
        );
        let engine_generation = self.bridge.engine_generation();
        self.bridge.close();
        self.sessions.requeue(&uri);
        let ready_port = self
            .supervisor
            .process()
            .filter(|process| process.generation == engine_generation)
            .and_then(EngineProcess::ready_port);
        if let Some(port) = ready_port {
            self.ensure_connected(engine_generation, port);
        }
    }

    fn status(&self) -> RelayStatus {
        let process = self.supervisor.process();
        RelayStatus {
            engine: process.map_or("idle", |process| process.state.label()).to_string(),
            engine_generation: process.map(|process| process.generation),
            engine_pid: process.and_then(|process| process.pid),
            engine_port: process.and_then(EngineProcess::ready_port),
            bridge: self.bridge.state().label().to_string(),
            bridge_url: self.bridge.url().map(str::to_string),
            in_flight: self.bridge.in_flight(),
            queued: self.sessions.queued_len(),
            documents: self.sessions.len(),
        }
    }
}
