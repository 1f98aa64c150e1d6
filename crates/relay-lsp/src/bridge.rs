//! Socket bridge to the analysis engine.
//!
//! One WebSocket connection per ready engine. A connection task performs the
//! handshake, then splits the stream into a writer fed by a bounded channel
//! and a reader that posts every inbound text message to the relay. The
//! [`Bridge`] itself is plain state owned by the relay.
//!
//! Engine replies carry no request id, so at most one request is outstanding
//! per connection and every reply answers that request.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower_lsp::lsp_types::{Range, Url};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::relay::RelayEvent;

const WRITER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl BridgeState {
    pub fn label(self) -> &'static str {
        match self {
            BridgeState::Disconnected => "disconnected",
            BridgeState::Connecting => "connecting",
            BridgeState::Open => "open",
            BridgeState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub enum WriterCommand {
    Send(String),
    Close,
}

#[derive(Debug)]
pub enum BridgeEvent {
    Opened {
        epoch: u64,
        writer: mpsc::Sender<WriterCommand>,
    },
    ConnectFailed {
        epoch: u64,
        error: RelayError,
    },
    Message {
        epoch: u64,
        text: String,
    },
    Closed {
        epoch: u64,
        reason: String,
    },
}

/// An analysis request waiting for its reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAnalysis {
    pub uri: Url,
    pub generation: u64,
    /// Range covered by the submitted text.
    pub range: Range,
}

pub struct Bridge {
    state: BridgeState,
    url: Option<String>,
    /// Increments for every connection attempt.
    epoch: u64,
    /// Generation of the engine this connection belongs to.
    engine_generation: u64,
    writer: Option<mpsc::Sender<WriterCommand>>,
    outstanding: Option<PendingAnalysis>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            state: BridgeState::Disconnected,
            url: None,
            epoch: 0,
            engine_generation: 0,
            writer: None,
            outstanding: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn engine_generation(&self) -> u64 {
        self.engine_generation
    }

    pub fn in_flight(&self) -> usize {
        usize::from(self.outstanding.is_some())
    }

    pub fn outstanding(&self) -> Option<&PendingAnalysis> {
        self.outstanding.as_ref()
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    /// True when a request could be written right now.
    pub fn is_idle(&self) -> bool {
        self.state == BridgeState::Open && self.writer.is_some() && self.outstanding.is_none()
    }

    /// Opens a connection to `url` unless one is already connecting or open.
    pub fn connect(
        &mut self,
        url: String,
        engine_generation: u64,
        events: &mpsc::Sender<RelayEvent>,
    ) {
        let Some(epoch) = self.begin_connect(url.clone(), engine_generation) else {
            return;
        };
        tokio::spawn(run_connection(epoch, url, events.clone()));
    }

    /// Moves to Connecting and returns the new epoch.
    pub(crate) fn begin_connect(&mut self, url: String, engine_generation: u64) -> Option<u64> {
        if matches!(self.state, BridgeState::Connecting | BridgeState::Open) {
            return None;
        }
        info!("Connecting to engine at {}", url);
        self.epoch += 1;
        self.state = BridgeState::Connecting;
        self.url = Some(url);
        self.engine_generation = engine_generation;
        self.writer = None;
        self.outstanding = None;
        Some(self.epoch)
    }

    /// Completes a connection attempt. Returns false when the attempt is no
    /// longer wanted; the caller must then close `writer`.
    pub fn mark_open(&mut self, epoch: u64, writer: mpsc::Sender<WriterCommand>) -> bool {
        if epoch != self.epoch || self.state != BridgeState::Connecting {
            let _ = writer.try_send(WriterCommand::Close);
            return false;
        }
        self.state = BridgeState::Open;
        self.writer = Some(writer);
        true
    }

    /// A failed attempt leaves the bridge free to retry.
    pub fn mark_connect_failed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != BridgeState::Connecting {
            return false;
        }
        self.state = BridgeState::Disconnected;
        true
    }

    /// Queues `text` for the engine. Never blocks; failures are returned and
    /// the text is dropped.
    pub fn send(&mut self, text: String, pending: PendingAnalysis) -> Result<(), RelayError> {
        let bytes = text.len();
        let Some(writer) = self.writer.as_ref().filter(|_| self.state == BridgeState::Open) else {
            return Err(RelayError::SendOnClosedConnection { bytes });
        };
        if self.outstanding.is_some() {
            return Err(RelayError::AwaitingReply { bytes });
        }
        match writer.try_send(WriterCommand::Send(text)) {
            Ok(()) => {
                self.outstanding = Some(pending);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(RelayError::AwaitingReply { bytes }),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RelayError::SendOnClosedConnection { bytes })
            }
        }
    }

    /// The request answered by the inbound reply.
    pub fn take_reply_context(&mut self) -> Option<PendingAnalysis> {
        self.outstanding.take()
    }

    /// Closes the connection. Returns false if it was not connecting or open.
    pub fn close(&mut self) -> bool {
        if !matches!(self.state, BridgeState::Connecting | BridgeState::Open) {
            return false;
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.try_send(WriterCommand::Close);
        }
        self.state = BridgeState::Closed;
        self.outstanding = None;
        true
    }
}

async fn run_connection(epoch: u64, url: String, events: mpsc::Sender<RelayEvent>) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            let error = RelayError::ConnectionFailure {
                url,
                reason: err.to_string(),
            };
            let _ = events
                .send(RelayEvent::Bridge(BridgeEvent::ConnectFailed { epoch, error }))
                .await;
            return;
        }
    };

    let (mut sink, mut source) = stream.split();
    let (writer_tx, mut writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
    let opened = BridgeEvent::Opened {
        epoch,
        writer: writer_tx,
    };
    if events.send(RelayEvent::Bridge(opened)).await.is_err() {
        return;
    }

    tokio::spawn(async move {
        while let Some(command) = writer_rx.recv().await {
            match command {
                WriterCommand::Send(text) => {
                    if let Err(err) = sink.send(Message::text(text)).await {
                        warn!("Engine socket write error: {err}");
                        break;
                    }
                }
                WriterCommand::Close => break,
            }
        }
        let _ = sink.close().await;
    });

    let reason = loop {
        let text = match source.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    warn!("Dropping non UTF-8 engine message: {err}");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || "closed by engine".to_string(),
                    |frame| {
                        format!(
                            "closed by engine: {} {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        )
                    },
                );
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => break err.to_string(),
            None => break "connection ended".to_string(),
        };
        debug!("Engine message: {}", text);
        let message = BridgeEvent::Message { epoch, text };
        if events.send(RelayEvent::Bridge(message)).await.is_err() {
            return;
        }
    };
    let _ = events
        .send(RelayEvent::Bridge(BridgeEvent::Closed { epoch, reason }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::Position;

    fn pending(generation: u64) -> PendingAnalysis {
        PendingAnalysis {
            uri: Url::parse("file:///work/a.json").unwrap(),
            generation,
            range: Range::new(Position::new(0, 0), Position::new(0, 1)),
        }
    }

    fn open_bridge() -> (Bridge, mpsc::Receiver<WriterCommand>) {
        let mut bridge = Bridge::new();
        let epoch = bridge
            .begin_connect("ws://127.0.0.1:1".to_string(), 1)
            .expect("connecting");
        let (tx, rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        assert!(bridge.mark_open(epoch, tx));
        (bridge, rx)
    }

    #[test]
    fn send_while_not_open_is_dropped_without_panicking() {
        let mut bridge = Bridge::new();
        assert!(matches!(
            bridge.send("{}".to_string(), pending(1)),
            Err(RelayError::SendOnClosedConnection { bytes: 2 })
        ));

        bridge.begin_connect("ws://127.0.0.1:1".to_string(), 1);
        assert_eq!(bridge.state(), BridgeState::Connecting);
        assert!(!bridge.is_idle());
        assert!(bridge.send("{}".to_string(), pending(1)).is_err());
        assert_eq!(bridge.in_flight(), 0);
    }

    #[test]
    fn one_request_is_outstanding_at_a_time() {
        let (mut bridge, mut rx) = open_bridge();
        assert!(bridge.is_idle());
        bridge.send("one".to_string(), pending(1)).expect("send one");
        assert!(!bridge.is_idle());
        assert!(matches!(
            bridge.send("two".to_string(), pending(2)),
            Err(RelayError::AwaitingReply { bytes: 3 })
        ));
        assert!(matches!(rx.try_recv(), Ok(WriterCommand::Send(text)) if text == "one"));
        assert!(rx.try_recv().is_err());

        assert_eq!(bridge.take_reply_context().map(|p| p.generation), Some(1));
        assert_eq!(bridge.take_reply_context(), None);
        assert!(bridge.is_idle());
        bridge.send("two".to_string(), pending(2)).expect("send two");
        assert_eq!(bridge.outstanding().map(|p| p.generation), Some(2));
    }

    #[test]
    fn close_drops_outstanding_and_rejects_sends() {
        let (mut bridge, mut rx) = open_bridge();
        bridge.send("a".to_string(), pending(1)).expect("send");
        assert!(bridge.close());
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_eq!(bridge.in_flight(), 0);
        assert!(!bridge.close());

        assert!(matches!(rx.try_recv(), Ok(WriterCommand::Send(_))));
        assert!(matches!(rx.try_recv(), Ok(WriterCommand::Close)));
        assert!(matches!(
            bridge.send("b".to_string(), pending(2)),
            Err(RelayError::SendOnClosedConnection { .. })
        ));
    }

    #[test]
    fn stale_open_is_rejected() {
        let mut bridge = Bridge::new();
        let first = bridge
            .begin_connect("ws://127.0.0.1:1".to_string(), 1)
            .expect("connecting");
        assert!(bridge.begin_connect("ws://127.0.0.1:1".to_string(), 1).is_none());
        bridge.close();

        let (tx, mut rx) = mpsc::channel(1);
        assert!(!bridge.mark_open(first, tx));
        assert!(matches!(rx.try_recv(), Ok(WriterCommand::Close)));
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn connection_failure_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(4);
        let mut bridge = Bridge::new();
        bridge.connect(format!("ws://127.0.0.1:{port}"), 1, &tx);
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        let RelayEvent::Bridge(BridgeEvent::ConnectFailed { epoch, error }) = event else {
            panic!("expected connect failure");
        };
        assert!(matches!(error, RelayError::ConnectionFailure { .. }));
        assert!(bridge.mark_connect_failed(epoch));
        assert_eq!(bridge.state(), BridgeState::Disconnected);
    }
}
