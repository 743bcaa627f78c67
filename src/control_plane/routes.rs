use std::convert::Infallible;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::control_plane::handlers::{self, RequestContext};
use crate::control_plane::responses::failure;
use crate::control_plane::server::AppState;
use crate::error_handling::types::ApiError;

fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Extracts the sandbox headers recognized on every request.
fn context() -> impl Filter<Extract = (RequestContext,), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-sandbox-id")
        .and(warp::header::optional::<String>("x-session-id"))
        .and(warp::header::optional::<String>("x-sandbox-keepalive"))
        .map(
            |sandbox_id: Option<String>,
             session_id: Option<String>,
             keep_alive: Option<String>| RequestContext {
                sandbox_id,
                session_id,
                keep_alive,
            },
        )
}

/// The raw query string, or empty when the request has none.
fn query_opt() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::query::raw().or_else(|_| async { Ok::<(String,), Rejection>((String::new(),)) })
}

fn session_routes(state: AppState) -> BoxedFilter<(warp::reply::Response,)> {
    let create = warp::path!("api" / "session" / "create")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::session_create);

    let execute = warp::path!("api" / "execute")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::execute);

    let exec_stream = warp::path!("api" / "execStream")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::exec_stream);

    let env_set = warp::path!("api" / "env" / "set")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handlers::env_set);

    create.or(execute).unify().or(exec_stream).unify().or(env_set).unify().boxed()
}

fn file_routes(state: AppState) -> BoxedFilter<(warp::reply::Response,)> {
    let read_stream = warp::path!("api" / "file" / "read" / "stream")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::file_read_stream);

    let mkdir = warp::path!("api" / "file" / "mkdir")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::file_mkdir);

    let write = warp::path!("api" / "file" / "write")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::file_write);

    let read = warp::path!("api" / "file" / "read")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::file_read);

    let delete = warp::path!("api" / "file" / "delete")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::file_delete);

    let rename = warp::path!("api" / "file" / "rename")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::file_rename);

    let move_route = warp::path!("api" / "file" / "move")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::file_move);

    let list = warp::path!("api" / "file" / "list")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::file_list);

    let exists = warp::path!("api" / "file" / "exists")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handlers::file_exists);

    read_stream
        .or(mkdir)
        .unify()
        .or(write)
        .unify()
        .or(read)
        .unify()
        .or(delete)
        .unify()
        .or(rename)
        .unify()
        .or(move_route)
        .unify()
        .or(list)
        .unify()
        .or(exists)
        .unify()
        .boxed()
}

fn process_routes(state: AppState) -> BoxedFilter<(warp::reply::Response,)> {
    let start = warp::path!("api" / "process" / "start")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::process_start);

    let list = warp::path!("api" / "process" / "list")
        .and(warp::get())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::process_list);

    let kill_all = warp::path!("api" / "process" / "kill-all")
        .and(warp::post())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::process_kill_all);

    let logs = warp::path!("api" / "process" / String / "logs")
        .and(warp::get())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::process_logs);

    let stream = warp::path!("api" / "process" / String / "stream")
        .and(warp::get())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::process_stream);

    let get = warp::path!("api" / "process" / String)
        .and(warp::get())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::process_get);

    let kill = warp::path!("api" / "process" / String)
        .and(warp::delete())
        .and(context())
        .and(with_state(state))
        .and_then(handlers::process_kill);

    start
        .or(list)
        .unify()
        .or(kill_all)
        .unify()
        .or(logs)
        .unify()
        .or(stream)
        .unify()
        .or(get)
        .unify()
        .or(kill)
        .unify()
        .boxed()
}

fn port_routes(state: AppState) -> BoxedFilter<(warp::reply::Response,)> {
    let expose = warp::path!("api" / "port" / "expose")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::port_expose);

    let list = warp::path!("api" / "exposed-ports")
        .and(warp::get())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::port_list);

    let unexpose = warp::path!("api" / "exposed-ports" / u16)
        .and(warp::delete())
        .and(context())
        .and(with_state(state))
        .and_then(handlers::port_unexpose);

    expose.or(list).unify().or(unexpose).unify().boxed()
}

fn code_routes(state: AppState) -> BoxedFilter<(warp::reply::Response,)> {
    let context_create = warp::path!("api" / "code" / "context" / "create")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::code_context_create);

    let context_list = warp::path!("api" / "code" / "context" / "list")
        .and(warp::get())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::code_context_list);

    let context_delete = warp::path!("api" / "code" / "context" / String)
        .and(warp::delete())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::code_context_delete);

    let execute_stream = warp::path!("api" / "code" / "execute" / "stream")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::code_execute_stream);

    let execute = warp::path!("api" / "code" / "execute")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handlers::code_execute);

    context_create
        .or(context_list)
        .unify()
        .or(context_delete)
        .unify()
        .or(execute_stream)
        .unify()
        .or(execute)
        .unify()
        .boxed()
}

fn misc_routes(state: AppState) -> BoxedFilter<(warp::reply::Response,)> {
    let git_clone = warp::path!("api" / "git" / "clone")
        .and(warp::post())
        .and(context())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::git_clone);

    let destroy = warp::path!("api" / "sandbox")
        .and(warp::delete())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::sandbox_destroy);

    let ping = warp::path!("api" / "ping")
        .and(warp::get())
        .and(context())
        .and(with_state(state))
        .and_then(handlers::ping);

    let commands = warp::path!("api" / "commands")
        .and(warp::get())
        .and_then(|| handlers::commands());

    let version = warp::path!("api" / "version")
        .and(warp::get())
        .and_then(|| handlers::version());

    git_clone
        .or(destroy)
        .unify()
        .or(ping)
        .unify()
        .or(commands)
        .unify()
        .or(version)
        .unify()
        .boxed()
}

/// Proxy dispatch for exposed user ports: requests arrive from the front-end
/// router with the target port in a header, any method, any path.
fn proxy_routes(state: AppState) -> BoxedFilter<(warp::reply::Response,)> {
    let ws = warp::ws()
        .and(warp::header::<u16>("x-ruche-proxy-port"))
        .and(warp::path::full())
        .and(query_opt())
        .and(context())
        .and(with_state(state.clone()))
        .and_then(handlers::proxy_ws);

    let http = warp::header::<u16>("x-ruche-proxy-port")
        .and(warp::method())
        .and(warp::path::full())
        .and(query_opt())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(context())
        .and(with_state(state))
        .and_then(handlers::proxy_http);

    ws.or(http).unify().boxed()
}

async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    if err.is_not_found() {
        return Ok(failure(&ApiError::new(
            "NOT_FOUND",
            StatusCode::NOT_FOUND,
            "no such endpoint",
        )));
    }
    if let Some(body_err) = err.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(failure(&ApiError::bad_request(body_err.to_string())));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(failure(&ApiError::new(
            "METHOD_NOT_ALLOWED",
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        )));
    }
    Ok(failure(&ApiError::internal("unhandled rejection")))
}

/// The complete control-plane filter tree.
pub fn api(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    proxy_routes(state.clone())
        .or(session_routes(state.clone()))
        .unify()
        .or(file_routes(state.clone()))
        .unify()
        .or(process_routes(state.clone()))
        .unify()
        .or(port_routes(state.clone()))
        .unify()
        .or(code_routes(state.clone()))
        .unify()
        .or(misc_routes(state))
        .unify()
        .recover(handle_rejection)
}
