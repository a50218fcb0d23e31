//! Request log for the exporter endpoints.
//!
//! Scrapes are logged at info, `/health` polls at debug unless they fail,
//! and server errors at warn.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use tracing::{Level, debug, info, warn};

#[derive(Clone)]
pub(crate) struct AccessLogLayer;

impl<S> tower::Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

/// What is known about a request before it reaches the handler.
struct Entry {
    method: Method,
    path: String,
    peer: Option<SocketAddr>,
    started: Instant,
}

impl Entry {
    fn new(req: &Request) -> Self {
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_owned(),
            peer: req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            started: Instant::now(),
        }
    }

    fn level(&self, status: StatusCode) -> Level {
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            Level::WARN
        } else if self.path == "/health" && status.is_success() {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    fn finish(self, status: StatusCode) {
        let level = self.level(status);
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let peer = self.peer.map(|a| a.ip().to_string());
        let peer = peer.as_deref().unwrap_or("-");
        let status = status.as_u16();
        let (method, path) = (&self.method, &self.path);
        if level == Level::WARN {
            warn!(peer, status, latency_ms, "{method} {path}");
        } else if level == Level::DEBUG {
            debug!(peer, status, latency_ms, "{method} {path}");
        } else {
            info!(peer, status, latency_ms, "{method} {path}");
        }
    }
}

#[derive(Clone)]
pub(crate) struct AccessLogService<S> {
    inner: S,
}

impl<S> tower::Service<Request> for AccessLogService<S>
where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let entry = Entry::new(&req);
        // take the service that was polled ready, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let response = inner.call(req).await?;
            entry.finish(response.status());
            Ok(response)
        })
    }
}
