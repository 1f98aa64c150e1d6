//! Test helpers shared across relay unit tests.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::outbound::Outbound;

/// In-process stand-in for the analysis engine's socket listener.
///
/// Every received text is recorded and answered with the reply function's
/// result; a `None` reply closes the connection.
pub(crate) struct FakeEngine {
    pub port: u16,
    pub received: mpsc::UnboundedReceiver<String>,
}

impl FakeEngine {
    pub async fn start(reply: fn(&str) -> Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake engine");
        let port = listener.local_addr().expect("fake engine addr").port();
        let (tx, received) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut socket) = accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(message)) = socket.next().await {
                        let Message::Text(text) = message else {
                            continue;
                        };
                        let text = text.as_str().to_owned();
                        let _ = tx.send(text.clone());
                        match reply(&text) {
                            Some(answer) => {
                                if socket.send(Message::text(answer)).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                let _ = socket.close(None).await;
                                return;
                            }
                        }
                    }
                });
            }
        });
        Self { port, received }
    }
}

/// Replies like the sample engine: `"bad input"` is a syntax error,
/// `"close me"` drops the connection, anything else succeeds.
pub(crate) fn sample_reply(text: &str) -> Option<String> {
    match text {
        "bad input" => Some(r#"{"status":"error","message":"syntax error"}"#.to_string()),
        "close me" => None,
        _ => Some(r#"{"type":"success"}"#.to_string()),
    }
}

/// Waits for the next outbound message matching `predicate`, skipping others.
pub(crate) async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    predicate: impl Fn(&Outbound) -> bool,
) -> Outbound {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = rx.recv().await.expect("outbound channel open");
            if predicate(&message) {
                return message;
            }
        }
    })
    .await
    .expect("outbound message in time")
}

pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

pub(crate) fn shown_texts(messages: &[Outbound]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| match message {
            Outbound::ShowMessage { text, .. } => Some(text.clone()),
            Outbound::PublishDiagnostics { .. } => None,
        })
        .collect()
}
