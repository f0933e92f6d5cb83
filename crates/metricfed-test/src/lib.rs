//! Helpers for testing the federated fetch layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`Server`] or [`HitCounter`], make sure that the server is held until all
//!    requests to it have been made. If the server is dropped, the ports remain open and all
//!    connections to it will time out. To avoid this, assign it to a variable:
//!    `let server = HitCounter::new(router);`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{Router, extract, middleware};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this workspace and mutes all other
///    logs (such as hyper).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("metricfed_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server from the given router.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));

        let server = axum::Server::bind(&addr).serve(router.into_make_service());
        let socket = server.local_addr();

        let handle = tokio::spawn(async move {
            server.await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns the `host:port` pair this server listens on.
    pub fn host(&self) -> String {
        format!("localhost:{}", self.port())
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A test server that counts the requests made to each URI.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    /// Wraps the given router with hit-counting middleware and serves it.
    pub fn new(router: Router) -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req, next: middleware::Next<_>| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = router.layer(middleware::from_fn(hitcounter));
        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the total number of requests served so far, resetting the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the number of requests whose URI path starts with `prefix`, without resetting.
    pub fn hits_for(&self, prefix: &str) -> usize {
        let map = self.hits.lock().unwrap();
        map.iter()
            .filter(|(uri, _)| uri.starts_with(prefix))
            .map(|(_, count)| count)
            .sum()
    }

    /// Returns all per-URI hit counts, resetting the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Returns the `host:port` pair this server listens on.
    pub fn host(&self) -> String {
        self.server.host()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}
