use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio_tungstenite::tungstenite;
use warp::http::{HeaderMap, StatusCode};

use crate::error_handling::types::PortError;

/// Headers that must not travel across the proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn target_url(port: u16, path: &str, query: Option<&str>) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    match query {
        Some(query) if !query.is_empty() => format!("http://127.0.0.1:{}{}?{}", port, path, query),
        _ => format!("http://127.0.0.1:{}{}", port, path),
    }
}

/// Forwards one HTTP request to the user program listening on `port`,
/// preserving method, headers, and body both ways.
pub async fn forward_http(
    client: &reqwest::Client,
    port: u16,
    method: &warp::http::Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<warp::http::Response<Vec<u8>>, PortError> {
    let url = target_url(port, path, query);
    debug!("Proxying {} {}", method, url);

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| PortError::ServiceNotResponding(port, "bad method".to_string()))?;

    let mut request = client.request(reqwest_method, &url);
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            request = request.header(name.as_str(), value.as_bytes());
        }
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }

    let response = request
        .send()
        .await
        .map_err(|e| PortError::ServiceNotResponding(port, e.to_string()))?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = warp::http::Response::builder().status(status);
    for (name, value) in response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| PortError::ServiceNotResponding(port, e.to_string()))?;

    builder
        .body(body.to_vec())
        .map_err(|e| PortError::ServiceNotResponding(port, e.to_string()))
}

fn client_to_upstream(message: warp::ws::Message) -> Option<tungstenite::Message> {
    if message.is_text() {
        Some(tungstenite::Message::Text(
            message.to_str().unwrap_or_default().to_string(),
        ))
    } else if message.is_binary() {
        Some(tungstenite::Message::Binary(message.into_bytes().to_vec()))
    } else if message.is_ping() {
        Some(tungstenite::Message::Ping(message.into_bytes().to_vec()))
    } else if message.is_pong() {
        Some(tungstenite::Message::Pong(message.into_bytes().to_vec()))
    } else if message.is_close() {
        Some(tungstenite::Message::Close(None))
    } else {
        None
    }
}

fn upstream_to_client(message: tungstenite::Message) -> Option<warp::ws::Message> {
    match message {
        tungstenite::Message::Text(text) => Some(warp::ws::Message::text(text)),
        tungstenite::Message::Binary(data) => Some(warp::ws::Message::binary(data)),
        tungstenite::Message::Ping(data) => Some(warp::ws::Message::ping(data)),
        tungstenite::Message::Pong(data) => Some(warp::ws::Message::pong(data)),
        tungstenite::Message::Close(_) => Some(warp::ws::Message::close()),
        tungstenite::Message::Frame(_) => None,
    }
}

/// Bridges an accepted client WebSocket to the user program on `port`,
/// relaying frames both ways until either peer closes.
pub async fn bridge_websocket(
    client: warp::ws::WebSocket,
    port: u16,
    path: String,
    query: Option<String>,
) {
    let url = target_url(port, &path, query.as_deref()).replacen("http://", "ws://", 1);
    debug!("Bridging WebSocket to {}", url);

    let upstream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            warn!("WebSocket upstream connect to {} failed: {}", url, err);
            let _ = client.close().await;
            return;
        }
    };

    relay_frames(client, upstream).await;
}

/// Frame relay between an accepted client socket and a dialed upstream,
/// until either peer closes or errors.
pub async fn relay_frames<S>(
    client: warp::ws::WebSocket,
    upstream: tokio_tungstenite::WebSocketStream<S>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            from_client = client_rx.next() => {
                match from_client {
                    Some(Ok(message)) => {
                        let closing = message.is_close();
                        if let Some(converted) = client_to_upstream(message) {
                            if upstream_tx.send(converted).await.is_err() {
                                break;
                            }
                        }
                        if closing {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!("Client WebSocket error: {}", err);
                        break;
                    }
                    None => break,
                }
            }
            from_upstream = upstream_rx.next() => {
                match from_upstream {
                    Some(Ok(message)) => {
                        let closing = matches!(message, tungstenite::Message::Close(_));
                        if let Some(converted) = upstream_to_client(message) {
                            if client_tx.send(converted).await.is_err() {
                                break;
                            }
                        }
                        if closing {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!("Upstream WebSocket error: {}", err);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;
    debug!("WebSocket bridge closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::Filter;

    async fn spawn_echo_server() -> (u16, tokio::task::JoinHandle<()>) {
        let route = warp::any()
            .and(warp::method())
            .and(warp::path::full())
            .and(warp::header::optional::<String>("x-probe"))
            .and(warp::body::bytes())
            .map(
                |method: warp::http::Method,
                 path: warp::path::FullPath,
                 probe: Option<String>,
                 body: Bytes| {
                    warp::http::Response::builder()
                        .header("x-upstream", "yes")
                        .body(format!(
                            "{} {} probe={} body={}",
                            method,
                            path.as_str(),
                            probe.unwrap_or_default(),
                            String::from_utf8_lossy(&body)
                        ))
                        .unwrap()
                },
            );

        let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr: std::net::SocketAddr = ([127, 0, 0, 1], port).into();
        let handle = tokio::spawn(async move {
            warp::serve(route).run(addr).await;
        });

        // Let the server come up before the test fires at it.
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        (port, handle)
    }

    #[tokio::test]
    async fn forwards_method_path_headers_and_body() {
        let (port, server) = spawn_echo_server().await;
        let client = reqwest::Client::new();

        let mut headers = HeaderMap::new();
        headers.insert("x-probe", "42".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());

        let response = forward_http(
            &client,
            port,
            &warp::http::Method::POST,
            "/echo/me",
            Some("a=1"),
            &headers,
            Bytes::from_static(b"ping"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-upstream").unwrap(),
            "yes"
        );
        let body = String::from_utf8_lossy(response.body());
        assert!(body.contains("POST /echo/me"));
        assert!(body.contains("probe=42"));
        assert!(body.contains("body=ping"));

        server.abort();
    }

    #[tokio::test]
    async fn unreachable_port_is_service_not_responding() {
        let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = reqwest::Client::new();
        let err = forward_http(
            &client,
            dead_port,
            &warp::http::Method::GET,
            "/",
            None,
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PortError::ServiceNotResponding(p, _) if p == dead_port));
    }

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("x-custom"));
    }

    #[test]
    fn target_urls_compose_path_and_query() {
        assert_eq!(target_url(8080, "/a/b", None), "http://127.0.0.1:8080/a/b");
        assert_eq!(
            target_url(8080, "a", Some("q=1")),
            "http://127.0.0.1:8080/a?q=1"
        );
    }
}
