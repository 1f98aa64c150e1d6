//! Document synchronization handlers.

use tower_lsp::lsp_types::*;
use tracing::debug;

use crate::relay::{RelayEvent, RelayHandle};

pub async fn did_open(relay: &RelayHandle, params: DidOpenTextDocumentParams) {
    let document = params.text_document;
    debug!("didOpen {} (version {})", document.uri, document.version);
    relay
        .send(RelayEvent::DocumentOpened {
            uri: document.uri,
            version: document.version,
            text: document.text,
        })
        .await;
}

pub async fn did_change(relay: &RelayHandle, params: DidChangeTextDocumentParams) {
    let document = params.text_document;
    debug!("didChange {} (version {})", document.uri, document.version);
    relay
        .send(RelayEvent::DocumentChanged {
            uri: document.uri,
            version: document.version,
            changes: params.content_changes,
        })
        .await;
}

pub async fn did_close(relay: &RelayHandle, params: DidCloseTextDocumentParams) {
    debug!("didClose {}", params.text_document.uri);
    relay
        .send(RelayEvent::DocumentClosed {
            uri: params.text_document.uri,
        })
        .await;
}
