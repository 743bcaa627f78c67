use bytes::Bytes;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use warp::http::{HeaderMap, Method, StatusCode};
use warp::path::FullPath;
use warp::{Filter, Reply};

use crate::configuration::Config;
use crate::ports::proxy::relay_frames;
use crate::router::patterns::{RouteTarget, UrlRouter};
use crate::router::retry::{fetch_with_retry, FetchedResponse, RetryPolicy};

const SKIP_FORWARD_HEADERS: &[&str] = &["host", "content-length", "connection", "upgrade"];

/// The stateless front door: pattern-match the URL, forward to the sandbox.
pub struct FrontendRouter {
    config: Arc<Config>,
    urls: UrlRouter,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl FrontendRouter {
    pub fn new(config: Arc<Config>) -> Self {
        let base_domain = config
            .base_url
            .as_deref()
            .and_then(|base| url::Url::parse(base).ok())
            .and_then(|base| base.host_str().map(str::to_string));
        FrontendRouter {
            urls: UrlRouter::new(base_domain.as_deref()),
            client: reqwest::Client::new(),
            policy: RetryPolicy::default(),
            config,
        }
    }

    /// Address of the sandbox's control plane. One container per process
    /// here, so every sandbox id lands on the local control port.
    fn control_base(&self, _sandbox_id: &str) -> String {
        format!("http://127.0.0.1:{}", self.config.control_port)
    }

    pub fn route_target(&self, host: &str, path: &str) -> Option<RouteTarget> {
        self.urls.route(host, path)
    }

    /// Forwards a routed request. `None` when the URL matches no pattern;
    /// the host application keeps it.
    pub async fn forward(
        &self,
        method: &Method,
        host: &str,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Option<warp::http::Response<Vec<u8>>> {
        let target = self.urls.route(host, path)?;
        let base = self.control_base(&target.sandbox_id);

        let url = match query {
            Some(query) if !query.is_empty() => format!("{}{}?{}", base, target.path, query),
            _ => format!("{}{}", base, target.path),
        };
        let original = match query {
            Some(query) if !query.is_empty() => format!("http://{}{}?{}", host, path, query),
            _ => format!("http://{}{}", host, path),
        };

        debug!("Routing {} {} -> {}", method, original, url);
        let reqwest_method =
            reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);

        let make_request = || {
            let mut request = self.client.request(reqwest_method.clone(), &url);
            for (name, value) in headers {
                if !SKIP_FORWARD_HEADERS
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(name.as_str()))
                {
                    request = request.header(name.as_str(), value.as_bytes());
                }
            }
            request = request
                .header("X-Original-URL", &original)
                .header("X-Forwarded-Host", host)
                .header("X-Forwarded-Proto", "http")
                .header("X-Sandbox-Name", &target.sandbox_id)
                .header("X-Sandbox-Id", &target.sandbox_id);
            if target.port != self.config.control_port {
                request = request.header("X-Ruche-Proxy-Port", target.port);
            }
            if !body.is_empty() {
                request = request.body(body.to_vec());
            }
            request
        };

        match fetch_with_retry(&self.policy, make_request).await {
            Ok(fetched) => Some(into_http_response(fetched)),
            Err(err) => {
                warn!("Forwarding to {} failed: {}", url, err);
                Some(
                    warp::http::Response::builder()
                        .status(StatusCode::BAD_GATEWAY)
                        .body(format!("upstream unreachable: {}", err).into_bytes())
                        .unwrap_or_default(),
                )
            }
        }
    }

    /// Runs the router's own HTTP server until aborted.
    pub async fn start(self: Arc<Self>) {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.router_port).into();
        info!("Front-end router listening on {}", addr);
        let routes = router_filter(self);
        warp::serve(routes).run(addr).await;
    }
}

fn into_http_response(fetched: FetchedResponse) -> warp::http::Response<Vec<u8>> {
    let status = StatusCode::from_u16(fetched.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = warp::http::Response::builder().status(status);
    for (name, value) in &fetched.headers {
        if !name.as_str().eq_ignore_ascii_case("transfer-encoding") {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    builder
        .body(fetched.body.to_vec())
        .unwrap_or_default()
}

/// The catch-all warp filter for the router process.
pub fn router_filter(
    router: Arc<FrontendRouter>,
) -> impl Filter<Extract = (impl Reply,), Error = std::convert::Infallible> + Clone {
    let with_router = {
        let router = router.clone();
        warp::any().map(move || router.clone())
    };

    // WebSocket upgrades route identically but bridge frames instead of
    // buffering a response body.
    let ws = warp::ws()
        .and(warp::header::<String>("host"))
        .and(warp::path::full())
        .and(with_router.clone())
        .and_then(
            |ws: warp::ws::Ws, host: String, path: FullPath, router: Arc<FrontendRouter>| async move {
                let Some(target) = router.route_target(&host, path.as_str()) else {
                    return Err(warp::reject::not_found());
                };
                let control_port = router.config.control_port;
                Ok::<_, warp::Rejection>(
                    ws.on_upgrade(move |socket| async move {
                        let url = format!("ws://127.0.0.1:{}{}", control_port, target.path);
                        let mut request = match url.clone().into_client_request() {
                            Ok(request) => request,
                            Err(err) => {
                                warn!("Bad upstream WS request {}: {}", url, err);
                                return;
                            }
                        };
                        if target.port != control_port {
                            if let Ok(value) = target.port.to_string().parse() {
                                request
                                    .headers_mut()
                                    .insert("x-ruche-proxy-port", value);
                            }
                        }
                        if let Ok(value) = target.sandbox_id.parse() {
                            request.headers_mut().insert("x-sandbox-id", value);
                        }
                        match tokio_tungstenite::connect_async(request).await {
                            Ok((upstream, _)) => relay_frames(socket, upstream).await,
                            Err(err) => {
                                warn!("WS forward to {} failed: {}", url, err);
                                let _ = socket.close().await;
                            }
                        }
                    })
                    .into_response(),
                )
            },
        );

    let http = warp::method()
        .and(warp::header::<String>("host"))
        .and(warp::path::full())
        .and(
            warp::query::raw()
                .map(Some)
                .or_else(|_| async { Ok::<(Option<String>,), warp::Rejection>((None,)) }),
        )
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(with_router)
        .and_then(
            |method: Method,
             host: String,
             path: FullPath,
             query: Option<String>,
             headers: HeaderMap,
             body: Bytes,
             router: Arc<FrontendRouter>| async move {
                match router
                    .forward(&method, &host, path.as_str(), query.as_deref(), &headers, body)
                    .await
                {
                    Some(response) => Ok::<_, warp::Rejection>(response.into_response()),
                    None => Err(warp::reject::not_found()),
                }
            },
        );

    ws.or(http).unify().recover(|_| async {
        Ok::<_, std::convert::Infallible>(
            warp::reply::with_status("not routed", StatusCode::NOT_FOUND).into_response(),
        )
    })
}
