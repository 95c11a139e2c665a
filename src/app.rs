use anyhow::{anyhow, Context};
use async_trait::async_trait;
use lsp_types::notification::{LogMessage, ShowMessage};
use lsp_types::request::WorkspaceSymbolRequest;
use lsp_types::{
    ClientCapabilities, InitializeParams, LogMessageParams, MessageType, PartialResultParams,
    ShowMessageParams, SymbolInformation, Url, WorkDoneProgressParams,
    WorkspaceClientCapabilities, WorkspaceFolder, WorkspaceSymbolClientCapabilities,
    WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use lsp_session::lsp::registry::{LspNotification, LspRequest};
use lsp_session::lsp::{ResponseError, StdioServer};
use lsp_session::{
    Error, MethodRegistry, RequestHandler, Router, Session, SessionBuilder, SessionConfig,
    SessionPhase,
};

use crate::cli::Config;

type WorkspaceSymbol = LspRequest<WorkspaceSymbolRequest>;
type LogMessageNotification = LspNotification<LogMessage>;
type ShowMessageNotification = LspNotification<ShowMessage>;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(build_registry()?);
    let router = Router::new(registry.clone())
        .on_notification::<LogMessageNotification, _, _>(|p: LogMessageParams| async move {
            log_server_message(p.typ, &p.message)
        })?
        .on_notification::<ShowMessageNotification, _, _>(|p: ShowMessageParams| async move {
            log_server_message(p.typ, &p.message)
        })?
        .fallback_requests(Arc::new(AcceptServerRequests));

    let cwd = Some(config.workspace.as_path());
    let server = StdioServer::spawn(&config.server, &config.args, cwd)
        .with_context(|| format!("failed to start {}", config.server))?;
    let builder = SessionBuilder::new(registry)
        .config(SessionConfig::default().with_name(config.server.clone()))
        .router(router)?;
    let (session, mut child) = server.connect(builder);

    let result = probe(&session, &config).await;
    if let Err(e) = &result {
        error!(error = %e, "probe failed");
    }

    if let Err(e) = stop(&session, config.timeout).await {
        warn!(error = %e, "server did not shut down cleanly");
    }
    match timeout(config.timeout, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "server exited"),
        Ok(Err(e)) => warn!(error = %e, "failed to wait for server"),
        Err(_) => {
            warn!("server did not exit, killing it");
            child.kill().await?;
        }
    }

    result
}

fn build_registry() -> anyhow::Result<MethodRegistry> {
    let mut registry = MethodRegistry::lsp();
    registry
        .register_request::<WorkspaceSymbol>()?
        .register_notification::<LogMessageNotification>()?
        .register_notification::<ShowMessageNotification>()?;
    Ok(registry)
}

async fn probe(session: &Session, config: &Config) -> anyhow::Result<()> {
    let params = initialize_params(&config.workspace)?;
    let result = timeout(config.timeout, session.initialize(params))
        .await
        .map_err(|_| anyhow!("initialize timed out"))??;

    let server_name = result
        .server_info
        .map(|info| match info.version {
            Some(version) => format!("{} {}", info.name, version),
            None => info.name,
        })
        .unwrap_or_else(|| config.server.clone());
    println!("Initialized: {}", server_name);

    if let Some(query) = &config.query {
        let symbols = workspace_symbols_with_retry(session, query, config).await?;
        for symbol in &symbols {
            println!("{:?}: {} ({})", symbol.kind, symbol.name, symbol.location.uri);
        }
        println!("{} symbols", symbols.len());
    }

    Ok(())
}

async fn stop(session: &Session, limit: Duration) -> anyhow::Result<()> {
    if session.is_closed() {
        return Ok(());
    }
    if session.phase() == SessionPhase::Running {
        timeout(limit, session.shutdown())
            .await
            .map_err(|_| anyhow!("shutdown timed out"))??;
    }
    session.exit().await?;
    Ok(())
}

fn initialize_params(workspace: &Path) -> anyhow::Result<InitializeParams> {
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("invalid workspace {}", workspace.display()))?;
    let uri = Url::from_directory_path(&workspace)
        .map_err(|_| anyhow!("workspace {} is not an absolute path", workspace.display()))?;
    let name = workspace
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("workspace"));

    Ok(InitializeParams {
        process_id: Some(std::process::id()),
        workspace_folders: Some(vec![WorkspaceFolder { uri, name }]),
        capabilities: ClientCapabilities {
            workspace: Some(WorkspaceClientCapabilities {
                symbol: Some(WorkspaceSymbolClientCapabilities {
                    dynamic_registration: Some(false),
                    ..Default::default()
                }),
                workspace_folders: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Servers often answer `workspace/symbol` with an error while indexing.
async fn workspace_symbols_with_retry(
    session: &Session,
    query: &str,
    config: &Config,
) -> anyhow::Result<Vec<SymbolInformation>> {
    for attempt in 1..=config.attempts {
        let params = WorkspaceSymbolParams {
            query: query.to_string(),
            partial_result_params: PartialResultParams::default(),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        match session
            .call_with_timeout::<WorkspaceSymbol>(params, config.timeout)
            .await
        {
            Ok(response) => return Ok(flatten_symbols(response)),
            Err(Error::Remote(e)) if attempt < config.attempts => {
                warn!(attempt, code = e.code, message = %e.message, "symbol query failed");
                sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(anyhow!("symbol query failed after {} attempts", config.attempts))
}

fn flatten_symbols(response: Option<WorkspaceSymbolResponse>) -> Vec<SymbolInformation> {
    match response {
        Some(WorkspaceSymbolResponse::Flat(symbols)) => symbols,
        Some(WorkspaceSymbolResponse::Nested(symbols)) => {
            debug!(count = symbols.len(), "skipping nested workspace symbols");
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn log_server_message(typ: MessageType, message: &str) {
    match typ {
        MessageType::ERROR => error!(target: "server", "{}", message),
        MessageType::WARNING => warn!(target: "server", "{}", message),
        MessageType::INFO => info!(target: "server", "{}", message),
        _ => debug!(target: "server", "{}", message),
    }
}

/// Accepts registration and progress requests from the server with a `null`
/// result; everything else is `MethodNotFound`.
struct AcceptServerRequests;

#[async_trait]
impl RequestHandler for AcceptServerRequests {
    async fn handle_request(&self, method: &str, _params: Value) -> Result<Value, ResponseError> {
        match method {
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => {
                debug!(method, "accepting server request");
                Ok(Value::Null)
            }
            _ => Err(ResponseError::method_not_found(method)),
        }
    }
}
