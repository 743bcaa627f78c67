use log::info;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::configuration::Config;
use crate::control_plane::routes;
use crate::lifecycle::SandboxRegistry;

/// Shared dependencies every handler sees.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SandboxRegistry>,
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
}

/// The in-sandbox HTTP server.
pub struct ControlPlane {
    state: AppState,
}

impl ControlPlane {
    pub fn new(config: Arc<Config>) -> Self {
        let registry = Arc::new(SandboxRegistry::new(config.clone()));
        ControlPlane {
            state: AppState {
                registry,
                config,
                http_client: reqwest::Client::new(),
            },
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn registry(&self) -> Arc<SandboxRegistry> {
        self.state.registry.clone()
    }

    /// Runs the server until the task is aborted.
    pub async fn start(&self) {
        let addr: SocketAddr = ([0, 0, 0, 0], self.state.config.control_port).into();
        info!("Control plane listening on {}", addr);
        warp::serve(routes::api(self.state.clone()))
            .run(addr)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::transport::SseParser;
    use crate::sse::SseFrame;
    use serde_json::Value;
    use std::time::Duration;

    struct TestServer {
        base: String,
        state: AppState,
        handle: tokio::task::JoinHandle<()>,
        client: reqwest::Client,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        async fn spawn() -> TestServer {
            let dir = tempfile::TempDir::new().unwrap();
            let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
                .await
                .unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let mut config = Config::default();
            config.control_port = port;
            config.temp_dir = dir.path().to_path_buf();
            config.state_dir = dir.path().join("state");
            config.workspace_root = dir.path().join("workspace");
            config.sandbox_name = Some("test".to_string());
            std::fs::create_dir_all(&config.workspace_root).unwrap();

            let plane = ControlPlane::new(Arc::new(config));
            let state = plane.state();
            let addr: SocketAddr = ([127, 0, 0, 1], port).into();
            let api = routes::api(state.clone());
            let handle = tokio::spawn(async move {
                warp::serve(api).run(addr).await;
            });

            // Wait for the socket to accept.
            for _ in 0..100 {
                if tokio::net::TcpStream::connect(addr).await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            TestServer {
                base: format!("http://127.0.0.1:{}", port),
                state,
                handle,
                client: reqwest::Client::new(),
                _dir: dir,
            }
        }

        async fn shutdown(self) {
            self.state.registry.destroy_all().await;
            self.handle.abort();
        }
    }

    #[tokio::test]
    async fn execute_returns_command_output() {
        let server = TestServer::spawn().await;

        let body: Value = server
            .client
            .post(format!("{}/api/execute", server.base))
            .json(&serde_json::json!({ "command": "echo Hello from sandbox" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["stdout"], "Hello from sandbox\n");
        assert_eq!(body["stderr"], "");
        assert_eq!(body["exitCode"], 0);
        assert_eq!(body["success"], true);
        assert!(body["timestamp"].is_string());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn env_set_then_execute_sees_variables() {
        let server = TestServer::spawn().await;

        let response = server
            .client
            .post(format!("{}/api/env/set", server.base))
            .json(&serde_json::json!({ "envVars": { "NODE_ENV": "test", "API_KEY": "k" } }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let body: Value = server
            .client
            .post(format!("{}/api/execute", server.base))
            .json(&serde_json::json!({ "command": "echo $NODE_ENV\\|$API_KEY" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["stdout"], "test|k\n");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn exec_stream_is_sse_with_done_sentinel() {
        let server = TestServer::spawn().await;

        let response = server
            .client
            .post(format!("{}/api/execStream", server.base))
            .json(&serde_json::json!({ "command": "for i in 1 2 3; do echo Line $i; done" }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let raw = response.text().await.unwrap();
        let mut parser = SseParser::new();
        let frames = parser.push(&raw);
        assert_eq!(frames.last(), Some(&SseFrame::Done));

        let events: Vec<Value> = frames
            .iter()
            .filter_map(|f| match f {
                SseFrame::Data(payload) => serde_json::from_str(payload).ok(),
                SseFrame::Done => None,
            })
            .collect();
        assert_eq!(events.first().unwrap()["type"], "start");
        let stdout: String = events
            .iter()
            .filter(|e| e["type"] == "stdout")
            .map(|e| e["data"].as_str().unwrap_or_default())
            .collect();
        assert!(stdout.contains("Line 1"));
        assert!(stdout.contains("Line 3"));
        assert_eq!(events.last().unwrap()["type"], "complete");
        assert_eq!(events.last().unwrap()["exitCode"], 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn session_isolation_across_header_scoped_sessions() {
        let server = TestServer::spawn().await;

        let send = |session: &'static str, command: &'static str| {
            let client = server.client.clone();
            let base = server.base.clone();
            async move {
                client
                    .post(format!("{}/api/execute", base))
                    .header("x-session-id", session)
                    .json(&serde_json::json!({ "command": command }))
                    .send()
                    .await
                    .unwrap()
                    .json::<Value>()
                    .await
                    .unwrap()
            }
        };

        send("a", "export SCOPE=a-only").await;
        let from_a = send("a", "echo ${SCOPE:-unset}").await;
        let from_b = send("b", "echo ${SCOPE:-unset}").await;
        assert_eq!(from_a["stdout"], "a-only\n");
        assert_eq!(from_b["stdout"], "unset\n");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn file_endpoints_round_trip() {
        let server = TestServer::spawn().await;
        let path = server._dir.path().join("workspace/data.txt");
        let path = path.display().to_string();

        let write: Value = server
            .client
            .post(format!("{}/api/file/write", server.base))
            .json(&serde_json::json!({ "path": path, "content": "payload" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(write["bytesWritten"], 7);

        let read: Value = server
            .client
            .post(format!("{}/api/file/read", server.base))
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(read["content"], "payload");
        assert_eq!(read["encoding"], "utf-8");

        let missing = server
            .client
            .post(format!("{}/api/file/read", server.base))
            .json(&serde_json::json!({ "path": "/definitely/not/here" }))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);
        let missing: Value = missing.json().await.unwrap();
        assert_eq!(missing["code"], "FILE_NOT_FOUND");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn port_expose_unexpose_and_errors() {
        let server = TestServer::spawn().await;

        let exposed: Value = server
            .client
            .post(format!("{}/api/port/expose", server.base))
            .json(&serde_json::json!({ "port": 8080, "name": "web" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(exposed["port"], 8080);
        assert!(exposed["url"].as_str().unwrap().contains("/preview/8080/"));

        let listed: Value = server
            .client
            .get(format!("{}/api/exposed-ports", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["count"], 1);

        let unexposed_unknown = server
            .client
            .delete(format!("{}/api/exposed-ports/9999", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(unexposed_unknown.status().as_u16(), 404);
        let body: Value = unexposed_unknown.json().await.unwrap();
        assert_eq!(body["code"], "PORT_NOT_EXPOSED");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn proxy_forwards_to_exposed_port() {
        let server = TestServer::spawn().await;

        // A tiny upstream app inside the "container".
        let upstream_listener =
            tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
                .await
                .unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        drop(upstream_listener);
        let upstream_addr: SocketAddr = ([127, 0, 0, 1], upstream_port).into();
        let upstream = tokio::spawn(async move {
            use warp::Filter;
            let route = warp::any().map(|| "hello from app".to_string());
            warp::serve(route).run(upstream_addr).await;
        });
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(upstream_addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Unexposed port: refused.
        let refused = server
            .client
            .get(format!("{}/anything", server.base))
            .header("x-ruche-proxy-port", upstream_port)
            .send()
            .await
            .unwrap();
        assert_eq!(refused.status().as_u16(), 404);

        server
            .client
            .post(format!("{}/api/port/expose", server.base))
            .json(&serde_json::json!({ "port": upstream_port }))
            .send()
            .await
            .unwrap();

        let proxied = server
            .client
            .get(format!("{}/anything", server.base))
            .header("x-ruche-proxy-port", upstream_port)
            .send()
            .await
            .unwrap();
        assert_eq!(proxied.status().as_u16(), 200);
        assert_eq!(proxied.text().await.unwrap(), "hello from app");

        upstream.abort();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn ping_commands_version_respond() {
        let server = TestServer::spawn().await;

        let ping: Value = server
            .client
            .get(format!("{}/api/ping", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ping["message"], "pong");

        let commands: Value = server
            .client
            .get(format!("{}/api/commands", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(commands["commands"].as_array().unwrap().len() > 20);

        let version: Value = server
            .client
            .get(format!("{}/api/version", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));

        let unknown = server
            .client
            .get(format!("{}/api/nope", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status().as_u16(), 404);

        server.shutdown().await;
    }
}
