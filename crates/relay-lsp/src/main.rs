//! `relay-lsp` - language server that relays open documents to an
//! out-of-process analysis engine and publishes its verdicts as diagnostics.

mod bridge;
mod config;
mod countdown;
mod error;
mod handlers;
mod outbound;
mod relay;
mod sessions;
mod supervisor;
#[cfg(test)]
mod test_support;
mod translate;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};
use tracing::info;

use crate::config::RelayConfig;
use crate::countdown::{COUNT_DOWN_BLOCKING, COUNT_DOWN_NON_BLOCKING};
use crate::handlers::STATUS_COMMAND;
use crate::outbound::{forward_to_client, Outbox};
use crate::relay::{Relay, RelayEvent, RelayHandle};

#[derive(Debug, Parser)]
#[command(name = "relay-lsp", version, about = "Analysis engine relay language server")]
struct Args {
    /// Configuration file to use instead of the workspace `relay-lsp.toml`.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Serve the editor protocol over TCP instead of stdio.
    #[arg(long)]
    tcp: bool,
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 2087)]
    port: u16,
}

/// The language server. All document and engine state lives in the relay.
pub struct RelayLanguageServer {
    client: Client,
    relay: RelayHandle,
    /// Configuration given on the command line; wins over workspace discovery.
    config_override: Option<RelayConfig>,
}

impl RelayLanguageServer {
    fn new(client: Client, config_override: Option<RelayConfig>) -> Self {
        let (outbox, outbound) = Outbox::new();
        tokio::spawn(forward_to_client(client.clone(), outbound));
        let relay = Relay::spawn(RelayConfig::default(), outbox);
        Self {
            client,
            relay,
            config_override,
        }
    }

    async fn count_down_blocking(&self) -> Result<()> {
        self.relay.count_down_blocking().await;
        Ok(())
    }

    async fn count_down_non_blocking(&self) -> Result<()> {
        self.relay.send(RelayEvent::CountDownNonBlocking).await;
        Ok(())
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for RelayLanguageServer {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        info!("relay-lsp initializing");

        let root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .map(|folder| folder.uri.clone())
            .or(params.root_uri);
        let config = match &self.config_override {
            Some(config) => config.clone(),
            None => root
                .and_then(|uri| uri.to_file_path().ok())
                .map(|path| RelayConfig::load(&path))
                .unwrap_or_default(),
        };
        self.relay.send(RelayEvent::Configure(config)).await;

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        ..Default::default()
                    },
                )),
                completion_provider: Some(CompletionOptions::default()),
                execute_command_provider: Some(ExecuteCommandOptions {
                    commands: vec![STATUS_COMMAND.to_string()],
                    ..Default::default()
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "relay-lsp".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _params: InitializedParams) {
        info!("relay-lsp initialized");
        self.client
            .log_message(MessageType::INFO, "relay-lsp initialized!")
            .await;
    }

    async fn shutdown(&self) -> Result<()> {
        info!("relay-lsp shutting down");
        self.relay.shutdown().await;
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        handlers::did_open(&self.relay, params).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        handlers::did_change(&self.relay, params).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        handlers::did_close(&self.relay, params).await;
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        Ok(Some(handlers::completion(params)))
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> Result<Option<Value>> {
        Ok(handlers::execute_command(&self.relay, params).await)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_override = args
        .config
        .as_deref()
        .map(|path| {
            RelayConfig::load_file(path)
                .with_context(|| format!("failed to read config file {}", path.display()))
        })
        .transpose()?;

    info!("Starting relay-lsp");

    let (service, socket) =
        LspService::build(move |client| RelayLanguageServer::new(client, config_override))
            .custom_method(COUNT_DOWN_BLOCKING, RelayLanguageServer::count_down_blocking)
            .custom_method(
                COUNT_DOWN_NON_BLOCKING,
                RelayLanguageServer::count_down_non_blocking,
            )
            .finish();

    if args.tcp {
        let listener = TcpListener::bind((args.host.as_str(), args.port))
            .await
            .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;
        info!("Listening on {}", listener.local_addr()?);
        let (stream, peer) = listener
            .accept()
            .await
            .context("failed to accept editor connection")?;
        info!("Editor connected from {peer}");
        let (read, write) = tokio::io::split(stream);
        Server::new(read, write, socket).serve(service).await;
    } else {
        Server::new(tokio::io::stdin(), tokio::io::stdout(), socket)
            .serve(service)
            .await;
    }
    Ok(())
}
