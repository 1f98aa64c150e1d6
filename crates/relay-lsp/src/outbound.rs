//! Outbound editor traffic.
//!
//! The relay never talks to the `tower_lsp::Client` directly. It pushes
//! messages into an [`Outbox`]; a pump task drains them into the client in
//! the order they were produced.

use tokio::sync::mpsc;
use tower_lsp::lsp_types::MessageType;
use tower_lsp::Client;
use tracing::debug;

use crate::translate::DiagnosticSet;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ShowMessage {
        kind: MessageType,
        text: String,
    },
    PublishDiagnostics {
        set: DiagnosticSet,
        version: Option<i32>,
    },
}

/// Sending half of the outbound queue. Sends never block.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn show_message(&self, kind: MessageType, text: impl Into<String>) {
        self.push(Outbound::ShowMessage {
            kind,
            text: text.into(),
        });
    }

    pub fn publish(&self, set: DiagnosticSet, version: Option<i32>) {
        self.push(Outbound::PublishDiagnostics { set, version });
    }

    fn push(&self, message: Outbound) {
        if self.tx.send(message).is_err() {
            debug!("Outbound queue closed; dropping editor message");
        }
    }
}

/// Forwards queued messages to the editor until every [`Outbox`] is dropped.
pub async fn forward_to_client(client: Client, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(message) = rx.recv().await {
        match message {
            Outbound::ShowMessage { kind, text } => client.show_message(kind, text).await,
            Outbound::PublishDiagnostics { set, version } => {
                client
                    .publish_diagnostics(set.uri, set.diagnostics, version)
                    .await;
            }
        }
    }
}
