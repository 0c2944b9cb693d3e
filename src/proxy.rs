//! Reverse-proxy virtual host generation (nginx).
//!
//! The route table is fixed and ordered; first matching prefix wins. Prefixes
//! are authored disjoint so ordering never becomes load-bearing, and a test
//! enforces that.

use anyhow::Result;
use serde::Serialize;
use tera::Context;
use tracing::{info, warn};

use crate::config::ApConfig;
use crate::dnsmasq::LOCAL_DOMAIN;
use crate::render::TEMPLATES;
use crate::runner::CommandRunner;
use crate::store::ConfigStore;

pub const SITE_RESOURCE: &str = "etc/nginx/sites-available/g2-ap";
pub const SITE_ENABLED_RESOURCE: &str = "etc/nginx/sites-enabled/g2-ap";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub path_prefix: String,
    pub upstream: String,
    pub websocket: bool,
    /// Whether the matched prefix is removed before forwarding.
    pub strip_prefix: bool,
}

impl ProxyRoute {
    fn new(path_prefix: &str, upstream: &str, websocket: bool, strip_prefix: bool) -> Self {
        Self {
            path_prefix: path_prefix.to_string(),
            upstream: upstream.to_string(),
            websocket,
            strip_prefix,
        }
    }
}

/// The fixed route set: API prefix, docs shortcut, printer API, its WebSocket,
/// the tablet service under an explicit prefix, and the catch-all UI root.
pub fn routes(cfg: &ApConfig) -> Vec<ProxyRoute> {
    let api = format!("http://127.0.0.1:{}", cfg.api_port);
    let ui = format!("http://127.0.0.1:{}", cfg.ui_port);
    let ws = format!("http://127.0.0.1:{}", cfg.websocket_port);
    vec![
        ProxyRoute::new("/g2", &api, false, true),
        ProxyRoute::new("/docs", &format!("{}/docs", api), false, false),
        ProxyRoute::new("/printer", &ws, false, true),
        ProxyRoute::new("/websocket", &format!("{}/websocket", ws), true, false),
        ProxyRoute::new("/tablet", &ui, false, true),
        ProxyRoute::new("/", &ui, false, false),
    ]
}

/// First-match routing, mirroring the generated nginx semantics. Returns the
/// winning route and the path the upstream will see.
pub fn match_route<'a>(routes: &'a [ProxyRoute], path: &str) -> Option<(&'a ProxyRoute, String)> {
    for route in routes {
        let matched = if route.path_prefix == "/" {
            true
        } else {
            path == route.path_prefix
                || path.starts_with(&format!("{}/", route.path_prefix))
        };
        if !matched {
            continue;
        }
        let forwarded = if route.strip_prefix {
            let rest = &path[route.path_prefix.len()..];
            if rest.is_empty() { "/".to_string() } else { rest.to_string() }
        } else {
            path.to_string()
        };
        return Some((route, forwarded));
    }
    None
}

/// No non-catch-all prefix may shadow another; the catch-all must come last.
pub fn prefixes_are_disjoint(routes: &[ProxyRoute]) -> bool {
    for (i, a) in routes.iter().enumerate() {
        if a.path_prefix == "/" {
            return i == routes.len() - 1;
        }
        for b in &routes[i + 1..] {
            if b.path_prefix != "/" && b.path_prefix.starts_with(&a.path_prefix) {
                return false;
            }
        }
    }
    true
}

#[derive(Serialize)]
struct RenderedRoute {
    location: String,
    upstream: String,
    websocket: bool,
}

pub struct ReverseProxyConfigurator<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a ConfigStore,
}

impl<'a> ReverseProxyConfigurator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, store: &'a ConfigStore) -> Self {
        Self { runner, store }
    }

    pub fn render(cfg: &ApConfig) -> Result<String> {
        let rendered: Vec<RenderedRoute> = routes(cfg)
            .iter()
            .map(|route| {
                // nginx strips the location prefix when proxy_pass carries a
                // trailing slash.
                let (location, upstream) = if route.strip_prefix {
                    (format!("{}/", route.path_prefix), format!("{}/", route.upstream))
                } else {
                    (route.path_prefix.clone(), route.upstream.clone())
                };
                RenderedRoute {
                    location,
                    upstream,
                    websocket: route.websocket,
                }
            })
            .collect();

        let mut ctx = Context::new();
        ctx.insert("listen_address", &cfg.address.address);
        ctx.insert("server_names", &format!("{} g2tablet.local", LOCAL_DOMAIN));
        ctx.insert("routes", &rendered);

        Ok(TEMPLATES.render("nginx-vhost.conf", &ctx)?)
    }

    /// Install the vhost and reload nginx if the configuration validates.
    /// Validation failure is logged and skipped: clients can still reach
    /// every service on its direct port.
    pub fn install(&self, cfg: &ApConfig) -> Result<()> {
        let vhost = Self::render(cfg)?;
        self.store.write(SITE_RESOURCE, &vhost)?;
        self.store.write(SITE_ENABLED_RESOURCE, &vhost)?;

        match self.runner.run("nginx", &["-t"]) {
            Ok(out) if out.success => {
                self.runner.run_unchecked("systemctl", &["reload-or-restart", "nginx"]);
                info!("Reverse proxy vhost installed and nginx reloaded");
            }
            Ok(out) => {
                warn!("nginx config validation failed, skipping reload: {}", out.message());
            }
            Err(e) => {
                warn!("nginx not available, skipping reload: {}", e);
            }
        }
        Ok(())
    }
}
