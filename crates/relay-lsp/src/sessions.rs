//! Open document tracking.
//!
//! Each open document keeps its latest text snapshot, the diagnostics last
//! published for it and the generation of its most recent analysis request.
//! Replies are only accepted for the most recent generation. Documents whose
//! text has not been analyzed yet wait in a queue, once each.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tower_lsp::lsp_types::{Diagnostic, TextDocumentContentChangeEvent, Url};

/// A document open in the editor.
#[derive(Debug, Clone)]
pub struct DocumentSession {
    /// The document URI.
    pub uri: Url,
    /// The document version.
    pub version: i32,
    /// The document content.
    pub text: String,
    /// Diagnostics last published for this document.
    pub diagnostics: Vec<Diagnostic>,
    /// Generation of the most recent analysis request (0 = never requested).
    pub latest_request: u64,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: FxHashMap<Url, DocumentSession>,
    next_request: u64,
    queued: VecDeque<Url>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, uri: Url, version: i32, text: String) {
        self.sessions.insert(
            uri.clone(),
            DocumentSession {
                uri,
                version,
                text,
                diagnostics: Vec::new(),
                latest_request: 0,
            },
        );
    }

    /// Applies editor changes to the snapshot. Returns false for unknown
    /// documents or changes that do not fit the current text.
    pub fn apply_changes(
        &mut self,
        uri: &Url,
        version: i32,
        changes: &[TextDocumentContentChangeEvent],
    ) -> bool {
        let Some(session) = self.sessions.get_mut(uri) else {
            return false;
        };
        let Some(updated) = apply_content_changes(&session.text, changes) else {
            return false;
        };
        session.text = updated;
        session.version = version;
        true
    }

    /// Removes the session, returning it if it was open.
    pub fn close(&mut self, uri: &Url) -> Option<DocumentSession> {
        self.queued.retain(|queued| queued != uri);
        self.sessions.remove(uri)
    }

    pub fn get(&self, uri: &Url) -> Option<&DocumentSession> {
        self.sessions.get(uri)
    }

    pub fn uris(&self) -> Vec<Url> {
        let mut uris: Vec<Url> = self
            .sessions
            .values()
            .map(|session| session.uri.clone())
            .collect();
        uris.sort();
        uris
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Starts a new analysis request for the current text of `uri` and
    /// queues the document. Any earlier request for it becomes stale.
    pub fn request_analysis(&mut self, uri: &Url) -> Option<u64> {
        let session = self.sessions.get_mut(uri)?;
        self.next_request += 1;
        session.latest_request = self.next_request;
        self.enqueue(uri);
        Some(self.next_request)
    }

    /// Queues `uri` again without starting a new request.
    pub fn requeue(&mut self, uri: &Url) {
        if self.sessions.contains_key(uri) {
            self.enqueue(uri);
        }
    }

    /// Next document waiting to be sent to the engine.
    pub fn next_queued(&mut self) -> Option<Url> {
        self.queued.pop_front()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    fn enqueue(&mut self, uri: &Url) {
        if !self.queued.contains(uri) {
            self.queued.push_back(uri.clone());
        }
    }

    /// True when `generation` is the newest request issued for an open `uri`.
    pub fn is_current(&self, uri: &Url, generation: u64) -> bool {
        self.sessions
            .get(uri)
            .is_some_and(|session| session.latest_request == generation)
    }

    pub fn set_diagnostics(&mut self, uri: &Url, diagnostics: Vec<Diagnostic>) -> Option<i32> {
        let session = self.sessions.get_mut(uri)?;
        session.diagnostics = diagnostics;
        Some(session.version)
    }
}

fn apply_content_changes(
    content: &str,
    changes: &[TextDocumentContentChangeEvent],
) -> Option<String> {
    let mut updated = content.to_string();
    for change in changes {
        if let Some(range) = change.range {
            let start = position_to_offset(&updated, range.start)?;
            let end = position_to_offset(&updated, range.end)?;
            if start > end || end > updated.len() {
                return None;
            }
            let mut next = String::with_capacity(
                updated.len().saturating_sub(end - start) + change.text.len(),
            );
            next.push_str(&updated[..start]);
            next.push_str(&change.text);
            next.push_str(&updated[end..]);
            updated = next;
        } else {
            updated.clone_from(&change.text);
        }
    }
    Some(updated)
}

/// Byte offset of an LSP position (UTF-16 columns).
fn position_to_offset(content: &str, position: tower_lsp::lsp_types::Position) -> Option<usize> {
    let mut line = 0u32;
    let mut col = 0u32;

    for (i, c) in content.char_indices() {
        if line == position.line && col >= position.character {
            return Some(i);
        }
        if c == '\n' {
            if line == position.line {
                // Position is past the end of this line
                return Some(i);
            }
            line += 1;
            col = 0;
        } else {
            col += u32::try_from(c.len_utf16()).unwrap_or(2);
        }
    }

    if line == position.line {
        Some(content.len())
    } else {
        None
    }
}
