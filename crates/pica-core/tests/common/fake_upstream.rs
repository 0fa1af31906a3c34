//! Minimal scripted HTTP/1.1 server for engine integration tests.
//!
//! Serves an exact-path route table. A route can be told to fail with a
//! given status for its first N hits, or to delay before responding; every
//! hit is counted so tests can assert how many GETs a run actually made.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// One parsed incoming request: path (with query) and lowercase headers.
pub struct ParsedRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
}

type Handler = Box<dyn Fn(&ParsedRequest) -> (u16, String, Vec<u8>) + Send + Sync>;

enum Responder {
    Static { content_type: String, body: Vec<u8> },
    Handler(Handler),
}

pub struct Route {
    responder: Responder,
    fail_status: u16,
    failures_left: AtomicUsize,
    delay: Duration,
    hits: AtomicUsize,
}

impl Route {
    pub fn bytes(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            responder: Responder::Static {
                content_type: content_type.to_string(),
                body,
            },
            fail_status: 0,
            failures_left: AtomicUsize::new(0),
            delay: Duration::ZERO,
            hits: AtomicUsize::new(0),
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::bytes("application/json", value.to_string().into_bytes())
    }

    pub fn handler(
        f: impl Fn(&ParsedRequest) -> (u16, String, Vec<u8>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Responder::Handler(Box::new(f)),
            fail_status: 0,
            failures_left: AtomicUsize::new(0),
            delay: Duration::ZERO,
            hits: AtomicUsize::new(0),
        }
    }

    /// Respond with `status` for the first `times` hits, then normally.
    pub fn fail(mut self, status: u16, times: usize) -> Self {
        self.fail_status = status;
        self.failures_left = AtomicUsize::new(times);
        self
    }

    /// Sleep before responding; used to hold a transfer open long enough
    /// for a pause/cancel signal to land mid-task.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub struct FakeUpstream {
    base_url: String,
    routes: Arc<Mutex<HashMap<String, Arc<Route>>>>,
}

impl FakeUpstream {
    /// Bind 127.0.0.1:0 and serve in a background thread until the process
    /// exits.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let routes: Arc<Mutex<HashMap<String, Arc<Route>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let accept_routes = Arc::clone(&routes);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let routes = Arc::clone(&accept_routes);
                thread::spawn(move || handle(stream, &routes));
            }
        });
        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            routes,
        }
    }

    /// Base URL without a trailing slash.
    pub fn url(&self) -> &str {
        &self.base_url
    }

    pub fn route(&self, path: &str, route: Route) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::new(route));
        self
    }

    /// Total hits a path has received.
    pub fn hits(&self, path: &str) -> usize {
        self.routes
            .lock()
            .unwrap()
            .get(path)
            .map(|r| r.hits.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

fn handle(mut stream: std::net::TcpStream, routes: &Mutex<HashMap<String, Arc<Route>>>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 16384];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let Some(parsed) = parse_request(request) else {
        return;
    };

    let route = routes.lock().unwrap().get(&parsed.path).cloned();
    let Some(route) = route else {
        let _ = stream.write_all(
            b"HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: 9\r\n\r\nnot found",
        );
        return;
    };

    route.hits.fetch_add(1, Ordering::SeqCst);
    if !route.delay.is_zero() {
        thread::sleep(route.delay);
    }

    let failures = route.failures_left.load(Ordering::SeqCst);
    if failures > 0
        && route
            .failures_left
            .compare_exchange(failures, failures - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    {
        let body = b"scripted failure";
        let response = format!(
            "HTTP/1.1 {} Scripted\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            route.fail_status,
            body.len()
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.write_all(body);
        return;
    }

    let (status, content_type, body) = match &route.responder {
        Responder::Static { content_type, body } => (200, content_type.clone(), body.clone()),
        Responder::Handler(f) => f(&parsed),
    };
    let response = format!(
        "HTTP/1.1 {status} OK\r\nConnection: close\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.write_all(&body);
}

/// Returns the path (with query) and headers of a GET request.
fn parse_request(request: &str) -> Option<ParsedRequest> {
    let mut lines = request.lines();
    let first = lines.next()?;
    let mut parts = first.split_whitespace();
    let _method = parts.next()?;
    let path = parts.next()?.to_string();
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    Some(ParsedRequest { path, headers })
}
