use log::debug;
use regex::Regex;

/// Where a front-door request should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub sandbox_id: String,
    pub port: u16,
    /// Path to forward inside the sandbox (preview prefix stripped).
    pub path: String,
}

/// Hostname/path pattern matcher for the two preview URL forms.
pub struct UrlRouter {
    subdomain: Regex,
    preview: Regex,
}

impl UrlRouter {
    /// `base_domain` anchors the subdomain pattern when known; without it
    /// any domain after the `<port>-<sandbox>.` prefix matches.
    pub fn new(base_domain: Option<&str>) -> Self {
        let subdomain = match base_domain {
            Some(domain) => Regex::new(&format!(
                r"^(\d+)-([A-Za-z0-9-]+)\.{}(?::\d+)?$",
                regex::escape(domain)
            ))
            .unwrap(),
            None => Regex::new(r"^(\d+)-([A-Za-z0-9-]+)\.").unwrap(),
        };
        let preview = Regex::new(r"^/preview/(\d+)/([^/]+)(/.*)?$").unwrap();
        UrlRouter { subdomain, preview }
    }

    /// Tries the patterns in order: subdomain first, then the localhost dev
    /// path form. `None` means the host application handles the request.
    pub fn route(&self, host: &str, path: &str) -> Option<RouteTarget> {
        let hostname = host.split(':').next().unwrap_or(host);

        if let Some(captures) = self.subdomain.captures(host).or_else(|| {
            // Re-try against the bare hostname for the unanchored form.
            self.subdomain.captures(hostname)
        }) {
            let port: u16 = captures.get(1)?.as_str().parse().ok()?;
            let sandbox_id = captures.get(2)?.as_str().to_string();
            debug!("Subdomain route: {} -> {}:{}", host, sandbox_id, port);
            return Some(RouteTarget {
                sandbox_id,
                port,
                path: path.to_string(),
            });
        }

        if is_localhost(hostname) {
            if let Some(captures) = self.preview.captures(path) {
                let port: u16 = captures.get(1)?.as_str().parse().ok()?;
                let sandbox_id = captures.get(2)?.as_str().to_string();
                let inner = captures
                    .get(3)
                    .map(|m| m.as_str().to_string())
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "/".to_string());
                debug!("Dev-path route: {} -> {}:{}", path, sandbox_id, port);
                return Some(RouteTarget {
                    sandbox_id,
                    port,
                    path: inner,
                });
            }
        }

        None
    }
}

fn is_localhost(hostname: &str) -> bool {
    hostname == "localhost" || hostname == "127.0.0.1" || hostname == "[::1]" || hostname == "::1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_pattern_extracts_port_and_sandbox() {
        let router = UrlRouter::new(Some("example.dev"));
        let target = router
            .route("8080-my-sandbox.example.dev", "/index.html")
            .unwrap();
        assert_eq!(target.port, 8080);
        assert_eq!(target.sandbox_id, "my-sandbox");
        assert_eq!(target.path, "/index.html");
    }

    #[test]
    fn subdomain_pattern_requires_the_base_domain() {
        let router = UrlRouter::new(Some("example.dev"));
        assert!(router.route("8080-sb.other.dev", "/").is_none());
    }

    #[test]
    fn dev_path_pattern_matches_on_localhost_only() {
        let router = UrlRouter::new(None);
        let target = router
            .route("localhost:8787", "/preview/3001/sb42/app/page?x=1")
            .unwrap();
        assert_eq!(target.port, 3001);
        assert_eq!(target.sandbox_id, "sb42");
        assert_eq!(target.path, "/app/page?x=1");

        assert!(router
            .route("example.com", "/preview/3001/sb42/app")
            .is_none());
    }

    #[test]
    fn dev_path_without_trailing_path_defaults_to_root() {
        let router = UrlRouter::new(None);
        let target = router.route("127.0.0.1", "/preview/9000/sb1").unwrap();
        assert_eq!(target.path, "/");
    }

    #[test]
    fn unroutable_urls_fall_through() {
        let router = UrlRouter::new(None);
        assert!(router.route("example.com", "/").is_none());
        assert!(router.route("localhost", "/api/execute").is_none());
        // Port beyond u16 cannot route.
        assert!(router.route("localhost", "/preview/70000/sb/x").is_none());
    }
}
