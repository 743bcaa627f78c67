use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use warp::http::{HeaderMap, Method};
use warp::path::FullPath;
use warp::Reply;

use crate::control_plane::responses::{failure, respond, success};
use crate::control_plane::server::AppState;
use crate::error_handling::types::{ApiError, PortError};
use crate::files::operations::{self, Encoding};
use crate::files::stream_read;
use crate::git::clone_repository;
use crate::lifecycle::Sandbox;
use crate::ports::proxy as port_proxy;
use crate::session_management::session::Session;
use crate::session_management::session_manager::CreateSessionOptions;
use crate::sse::transport;
use crate::sse::SseHub;

/// Per-request headers recognized on every endpoint.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub sandbox_id: Option<String>,
    pub session_id: Option<String>,
    pub keep_alive: Option<String>,
}

/// Resolves the addressed sandbox (lazily creating it) and renews its
/// activity deadline.
async fn resolve_sandbox(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<Arc<Sandbox>, ApiError> {
    let id = ctx
        .sandbox_id
        .clone()
        .or_else(|| state.config.sandbox_name.clone())
        .unwrap_or_else(|| "default".to_string());
    let sandbox = state.registry.get_or_create(&id).await?;
    sandbox.touch();
    if let Some(flag) = &ctx.keep_alive {
        sandbox.set_keep_alive(flag.eq_ignore_ascii_case("true"));
    }
    Ok(sandbox)
}

async fn resolve_session(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<(Arc<Sandbox>, Arc<Session>), ApiError> {
    let sandbox = resolve_sandbox(state, ctx).await?;
    let session = sandbox.sessions.resolve(ctx.session_id.as_deref()).await?;
    Ok((sandbox, session))
}

/// Wraps a finite event stream as an SSE reply registered with the hub, so
/// sandbox teardown ends it.
fn sse_with_hub<S, T>(hub: &SseHub, events: S) -> warp::reply::Response
where
    S: futures::Stream<Item = T> + Send + Unpin + Sync + 'static,
    T: serde::Serialize + Send + Sync + 'static,
{
    let mut guard = hub.register();
    let stream = async_stream::stream! {
        let mut events = events;
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => yield event,
                    None => break,
                },
                _ = guard.closed() => break,
            }
        }
    };
    transport::reply_with(stream).into_response()
}

// ---------------------------------------------------------------------------
// Sessions & commands

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBody {
    pub command: String,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecStreamBody {
    pub command: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvSetBody {
    pub env_vars: HashMap<String, String>,
}

pub async fn session_create(
    ctx: RequestContext,
    body: CreateSessionOptions,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let session = sandbox.sessions.create_session(body).await?;
        Ok(json!({ "sessionId": session.id }))
    }
    .await;
    Ok(respond(result))
}

pub async fn execute(
    ctx: RequestContext,
    body: ExecuteBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let (_, session) = resolve_session(&state, &ctx).await?;
        let result = session.exec(&body.command, body.timeout_ms).await?;
        Ok(json!({
            "stdout": result.stdout,
            "stderr": result.stderr,
            "exitCode": result.exit_code,
            "success": result.success,
        }))
    }
    .await;
    Ok(respond(result))
}

pub async fn exec_stream(
    ctx: RequestContext,
    body: ExecStreamBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let (sandbox, session) = match resolve_session(&state, &ctx).await {
        Ok(pair) => pair,
        Err(err) => return Ok(failure(&err)),
    };
    match session.exec_stream(&body.command).await {
        Ok(events) => Ok(sse_with_hub(&sandbox.sse, ReceiverStream::new(events))),
        Err(err) => Ok(failure(&ApiError::from(err))),
    }
}

pub async fn env_set(
    ctx: RequestContext,
    body: EnvSetBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let (_, session) = resolve_session(&state, &ctx).await?;
        session.set_env(&body.env_vars).await?;
        Ok(json!({}))
    }
    .await;
    Ok(respond(result))
}

// ---------------------------------------------------------------------------
// Files

#[derive(Debug, Deserialize)]
pub struct MkdirBody {
    pub path: PathBuf,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub path: PathBuf,
    pub content: String,
    #[serde(default)]
    pub encoding: Encoding,
}

#[derive(Debug, Deserialize)]
pub struct PathBody {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    pub path: PathBuf,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameBody {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveBody {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
}

pub async fn file_mkdir(
    ctx: RequestContext,
    body: MkdirBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        operations::mkdir(&body.path, body.recursive).await?;
        Ok(json!({ "path": body.path.display().to_string() }))
    }
    .await;
    Ok(respond(result))
}

pub async fn file_write(
    ctx: RequestContext,
    body: WriteBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        let written = operations::write(&body.path, &body.content, body.encoding).await?;
        Ok(json!({
            "path": body.path.display().to_string(),
            "bytesWritten": written,
        }))
    }
    .await;
    Ok(respond(result))
}

pub async fn file_read(
    ctx: RequestContext,
    body: PathBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        let read = operations::read(&body.path).await?;
        let mut payload = serde_json::to_value(&read).unwrap_or_default();
        payload["path"] = Value::String(body.path.display().to_string());
        Ok(payload)
    }
    .await;
    Ok(respond(result))
}

pub async fn file_read_stream(
    ctx: RequestContext,
    body: PathBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let sandbox = match resolve_sandbox(&state, &ctx).await {
        Ok(sandbox) => sandbox,
        Err(err) => return Ok(failure(&err)),
    };
    match stream_read::stream_file(&body.path).await {
        Ok(events) => Ok(sse_with_hub(&sandbox.sse, ReceiverStream::new(events))),
        Err(err) => Ok(failure(&ApiError::from(err))),
    }
}

pub async fn file_delete(
    ctx: RequestContext,
    body: DeleteBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        operations::delete(&body.path, body.recursive).await?;
        Ok(json!({ "path": body.path.display().to_string() }))
    }
    .await;
    Ok(respond(result))
}

pub async fn file_rename(
    ctx: RequestContext,
    body: RenameBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        operations::rename(&body.old_path, &body.new_path).await?;
        Ok(json!({
            "oldPath": body.old_path.display().to_string(),
            "newPath": body.new_path.display().to_string(),
        }))
    }
    .await;
    Ok(respond(result))
}

pub async fn file_move(
    ctx: RequestContext,
    body: MoveBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        operations::move_path(&body.source_path, &body.destination_path).await?;
        Ok(json!({
            "sourcePath": body.source_path.display().to_string(),
            "destinationPath": body.destination_path.display().to_string(),
        }))
    }
    .await;
    Ok(respond(result))
}

pub async fn file_list(
    ctx: RequestContext,
    body: PathBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        let entries = operations::list(&body.path).await?;
        let count = entries.len();
        Ok(json!({
            "path": body.path.display().to_string(),
            "entries": entries,
            "count": count,
        }))
    }
    .await;
    Ok(respond(result))
}

pub async fn file_exists(
    ctx: RequestContext,
    body: PathBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        let probe = operations::exists(&body.path).await?;
        let mut payload = serde_json::to_value(&probe).unwrap_or_default();
        payload["path"] = Value::String(body.path.display().to_string());
        Ok(payload)
    }
    .await;
    Ok(respond(result))
}

// ---------------------------------------------------------------------------
// Background processes

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStartBody {
    pub command: String,
    pub process_id: Option<String>,
    pub session_id: Option<String>,
}

pub async fn process_start(
    ctx: RequestContext,
    body: ProcessStartBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let session_id = body.session_id.or_else(|| ctx.session_id.clone());
        let process = sandbox
            .processes
            .start(&body.command, session_id, body.process_id)?;
        Ok(serde_json::to_value(process.info()).unwrap_or_default())
    }
    .await;
    Ok(respond(result))
}

pub async fn process_list(
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let processes = sandbox.processes.list();
        let count = processes.len();
        Ok(json!({ "processes": processes, "count": count }))
    }
    .await;
    Ok(respond(result))
}

pub async fn process_get(
    id: String,
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let process = sandbox.processes.get(&id)?;
        Ok(serde_json::to_value(process.info()).unwrap_or_default())
    }
    .await;
    Ok(respond(result))
}

pub async fn process_logs(
    id: String,
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let (stdout, stderr) = sandbox.processes.logs(&id)?;
        Ok(json!({ "stdout": stdout, "stderr": stderr }))
    }
    .await;
    Ok(respond(result))
}

pub async fn process_stream(
    id: String,
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let sandbox = match resolve_sandbox(&state, &ctx).await {
        Ok(sandbox) => sandbox,
        Err(err) => return Ok(failure(&err)),
    };
    match sandbox.processes.stream_logs(&id) {
        Ok(events) => Ok(sse_with_hub(&sandbox.sse, ReceiverStream::new(events))),
        Err(err) => Ok(failure(&ApiError::from(err))),
    }
}

pub async fn process_kill(
    id: String,
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        sandbox.processes.kill(&id)?;
        Ok(json!({ "id": id }))
    }
    .await;
    Ok(respond(result))
}

pub async fn process_kill_all(
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        Ok(json!({ "cleanedCount": sandbox.processes.kill_all() }))
    }
    .await;
    Ok(respond(result))
}

// ---------------------------------------------------------------------------
// Ports

#[derive(Debug, Deserialize)]
pub struct PortExposeBody {
    pub port: u16,
    pub name: Option<String>,
}

pub async fn port_expose(
    ctx: RequestContext,
    body: PortExposeBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let info = sandbox
            .ports
            .expose(body.port, body.name, &state.config, &sandbox.id)?;
        Ok(serde_json::to_value(info).unwrap_or_default())
    }
    .await;
    Ok(respond(result))
}

pub async fn port_unexpose(
    port: u16,
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        sandbox.ports.unexpose(port)?;
        Ok(json!({ "port": port }))
    }
    .await;
    Ok(respond(result))
}

pub async fn port_list(
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let ports = sandbox.ports.list(&state.config, &sandbox.id);
        let count = ports.len();
        Ok(json!({ "ports": ports, "count": count }))
    }
    .await;
    Ok(respond(result))
}

// ---------------------------------------------------------------------------
// Git

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCloneBody {
    pub repo_url: String,
    pub branch: Option<String>,
    pub target_dir: Option<String>,
}

pub async fn git_clone(
    ctx: RequestContext,
    body: GitCloneBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        let outcome = clone_repository(
            &state.config.workspace_root,
            &body.repo_url,
            body.branch.as_deref(),
            body.target_dir.as_deref(),
        )
        .await?;
        Ok(serde_json::to_value(outcome).unwrap_or_default())
    }
    .await;
    Ok(respond(result))
}

// ---------------------------------------------------------------------------
// Interpreter contexts

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCreateBody {
    pub language: String,
    pub cwd: Option<PathBuf>,
    pub env_vars: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeOptions {
    pub context: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CodeExecuteBody {
    pub code: String,
    #[serde(default)]
    pub options: Option<CodeOptions>,
}

pub async fn code_context_create(
    ctx: RequestContext,
    body: ContextCreateBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let info = sandbox
            .interpreters
            .create_context(&body.language, body.cwd, body.env_vars)
            .await?;
        Ok(serde_json::to_value(info).unwrap_or_default())
    }
    .await;
    Ok(respond(result))
}

pub async fn code_context_list(
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let contexts = sandbox.interpreters.list_contexts().await;
        let count = contexts.len();
        Ok(json!({ "contexts": contexts, "count": count }))
    }
    .await;
    Ok(respond(result))
}

pub async fn code_context_delete(
    id: String,
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        sandbox.interpreters.delete_context(&id).await?;
        Ok(json!({ "id": id }))
    }
    .await;
    Ok(respond(result))
}

pub async fn code_execute(
    ctx: RequestContext,
    body: CodeExecuteBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        let sandbox = resolve_sandbox(&state, &ctx).await?;
        let options = body.options.unwrap_or_default();
        let context_id = options
            .context
            .ok_or_else(|| ApiError::bad_request("options.context is required"))?;
        let outcome = sandbox
            .interpreters
            .run_code(&context_id, &body.code, options.timeout_ms)
            .await?;
        Ok(serde_json::to_value(outcome).unwrap_or_default())
    }
    .await;
    Ok(respond(result))
}

pub async fn code_execute_stream(
    ctx: RequestContext,
    body: CodeExecuteBody,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let sandbox = match resolve_sandbox(&state, &ctx).await {
        Ok(sandbox) => sandbox,
        Err(err) => return Ok(failure(&err)),
    };
    let options = body.options.unwrap_or_default();
    let Some(context_id) = options.context else {
        return Ok(failure(&ApiError::bad_request("options.context is required")));
    };
    match sandbox
        .interpreters
        .run_code_stream(&context_id, &body.code)
        .await
    {
        Ok(events) => Ok(sse_with_hub(
            &sandbox.sse,
            UnboundedReceiverStream::new(events),
        )),
        Err(err) => Ok(failure(&ApiError::from(err))),
    }
}

// ---------------------------------------------------------------------------
// Sandbox lifecycle & misc

pub async fn sandbox_destroy(
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let id = ctx
        .sandbox_id
        .clone()
        .or_else(|| state.config.sandbox_name.clone())
        .unwrap_or_else(|| "default".to_string());
    state.registry.destroy(&id).await;
    Ok(success(json!({ "id": id })))
}

pub async fn ping(
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let result = async {
        resolve_sandbox(&state, &ctx).await?;
        Ok(json!({ "message": "pong" }))
    }
    .await;
    Ok(respond(result))
}

pub async fn version() -> Result<warp::reply::Response, Infallible> {
    Ok(success(json!({ "version": env!("CARGO_PKG_VERSION") })))
}

pub async fn commands() -> Result<warp::reply::Response, Infallible> {
    let commands = json!([
        { "method": "POST", "path": "/api/session/create" },
        { "method": "POST", "path": "/api/execute" },
        { "method": "POST", "path": "/api/execStream" },
        { "method": "POST", "path": "/api/env/set" },
        { "method": "POST", "path": "/api/file/mkdir" },
        { "method": "POST", "path": "/api/file/write" },
        { "method": "POST", "path": "/api/file/read" },
        { "method": "POST", "path": "/api/file/read/stream" },
        { "method": "POST", "path": "/api/file/delete" },
        { "method": "POST", "path": "/api/file/rename" },
        { "method": "POST", "path": "/api/file/move" },
        { "method": "POST", "path": "/api/file/list" },
        { "method": "POST", "path": "/api/file/exists" },
        { "method": "POST", "path": "/api/process/start" },
        { "method": "GET", "path": "/api/process/list" },
        { "method": "GET", "path": "/api/process/:id" },
        { "method": "GET", "path": "/api/process/:id/logs" },
        { "method": "GET", "path": "/api/process/:id/stream" },
        { "method": "DELETE", "path": "/api/process/:id" },
        { "method": "POST", "path": "/api/process/kill-all" },
        { "method": "POST", "path": "/api/port/expose" },
        { "method": "GET", "path": "/api/exposed-ports" },
        { "method": "DELETE", "path": "/api/exposed-ports/:port" },
        { "method": "POST", "path": "/api/git/clone" },
        { "method": "POST", "path": "/api/code/context/create" },
        { "method": "GET", "path": "/api/code/context/list" },
        { "method": "DELETE", "path": "/api/code/context/:id" },
        { "method": "POST", "path": "/api/code/execute" },
        { "method": "POST", "path": "/api/code/execute/stream" },
        { "method": "DELETE", "path": "/api/sandbox" },
        { "method": "GET", "path": "/api/ping" },
        { "method": "GET", "path": "/api/commands" },
        { "method": "GET", "path": "/api/version" },
    ]);
    Ok(success(json!({ "commands": commands })))
}

// ---------------------------------------------------------------------------
// Exposed-port proxy dispatch

#[allow(clippy::too_many_arguments)]
pub async fn proxy_http(
    port: u16,
    method: Method,
    path: FullPath,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let sandbox = match resolve_sandbox(&state, &ctx).await {
        Ok(sandbox) => sandbox,
        Err(err) => return Ok(failure(&err)),
    };
    if port == state.config.control_port {
        return Ok(failure(&ApiError::from(PortError::Reserved(port))));
    }
    if !sandbox.ports.is_exposed(port) {
        return Ok(failure(&ApiError::from(PortError::NotExposed(port))));
    }

    let query = if query.is_empty() { None } else { Some(query) };
    match port_proxy::forward_http(
        &state.http_client,
        port,
        &method,
        path.as_str(),
        query.as_deref(),
        &headers,
        body,
    )
    .await
    {
        Ok(response) => Ok(response.into_response()),
        Err(err) => Ok(failure(&ApiError::from(err))),
    }
}

pub async fn proxy_ws(
    ws: warp::ws::Ws,
    port: u16,
    path: FullPath,
    query: String,
    ctx: RequestContext,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let sandbox = match resolve_sandbox(&state, &ctx).await {
        Ok(sandbox) => sandbox,
        Err(err) => return Ok(failure(&err)),
    };
    if !sandbox.ports.is_exposed(port) {
        return Ok(failure(&ApiError::from(PortError::NotExposed(port))));
    }

    let path = path.as_str().to_string();
    let query = if query.is_empty() { None } else { Some(query) };
    Ok(ws
        .on_upgrade(move |socket| port_proxy::bridge_websocket(socket, port, path, query))
        .into_response())
}
