//! HTTPS daemon in front of the controller
//!
//! One task accepts connections, one task per connection runs the TLS
//! handshake and serves HTTP/1.1. Stopping wakes the accept loop through a
//! `Notify`, so no request has to be sent to the server itself.

use crate::controller::{ProxyController, Reply};
use crate::error::{FacadeError, Result};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Reserved path; always answered with 503 and never routed
pub const SHUTDOWN_PATH: &str = "/__pipproxy_shutdown__";

type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Lifecycle of a [`ProxyServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Listening,
    Stopping,
    Stopped,
}

/// Where to listen
#[derive(Debug)]
pub enum Binding {
    /// Use a socket that is already bound
    Listener(std::net::TcpListener),
    /// Bind the first free port in `ports` on `interface`
    Address {
        interface: String,
        ports: RangeInclusive<u16>,
    },
}

pub struct ProxyServer {
    controller: Arc<ProxyController>,
    acceptor: TlsAcceptor,
    state: Mutex<DaemonState>,
    stopping: AtomicBool,
    shutdown: Notify,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(controller: Arc<ProxyController>, tls: ServerConfig) -> Self {
        Self {
            controller,
            acceptor: TlsAcceptor::from(Arc::new(tls)),
            state: Mutex::new(DaemonState::Stopped),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn controller(&self) -> &Arc<ProxyController> {
        &self.controller
    }

    fn set_state(&self, state: DaemonState) {
        debug!("Daemon state {:?}", state);
        *self.state.lock() = state;
    }

    /// Bind and start accepting. Returns once the socket is bound.
    pub async fn start(self: &Arc<Self>, binding: Binding) -> Result<SocketAddr> {
        self.set_state(DaemonState::Starting);
        self.stopping.store(false, Ordering::SeqCst);

        let listener = match binding {
            Binding::Listener(listener) => {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)?
            }
            Binding::Address { interface, ports } => match bind_first(&interface, ports).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.set_state(DaemonState::Stopped);
                    return Err(e);
                }
            },
        };

        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        self.set_state(DaemonState::Listening);
        info!("Listening on https://{}", addr);

        let server = self.clone();
        let handle = tokio::spawn(async move { server.accept_loop(listener).await });
        *self.accept_task.lock() = Some(handle);
        Ok(addr)
    }

    /// Stop accepting and wait for the accept loop to finish
    pub async fn stop(&self) {
        if self.state() != DaemonState::Listening {
            return;
        }
        self.set_state(DaemonState::Stopping);
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();

        let handle = self.accept_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
        self.set_state(DaemonState::Stopped);
        info!("Stopped listening");
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_connection(stream, remote_addr).await });
                    }
                    Err(e) if self.is_stopping() => debug!("Accept during shutdown: {}", e),
                    Err(e) => error!("Accept failed: {}", e),
                },
            }
        }
    }

    /// Handle a single HTTPS connection
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let tls = match self.acceptor.accept(stream).await {
            Ok(tls) => tls,
            Err(e) if self.is_stopping() => {
                debug!("TLS handshake with {} during shutdown: {}", remote_addr, e);
                return;
            }
            Err(e) => {
                warn!("TLS handshake with {} failed: {}", remote_addr, e);
                return;
            }
        };

        let server = self.clone();
        let result = http1::Builder::new()
            .serve_connection(
                TokioIo::new(tls),
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await;

        if let Err(e) = result {
            if is_disconnect(&e) {
                debug!("{} ({})", FacadeError::ClientDisconnected, remote_addr);
            } else {
                debug!("Connection error from {}: {}", remote_addr, e);
            }
        }
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> std::result::Result<Response<ResponseBody>, Infallible> {
        let path = decoded_path(req.uri().path());
        debug!("{} {} from {}", req.method(), path, remote_addr);

        if path == SHUTDOWN_PATH {
            return Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "Shutting down"));
        }
        if req.method() != Method::GET {
            let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "Only GET is supported");
            response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET"));
            return Ok(response);
        }

        let response = match self.controller.handle(&path).await {
            Ok(Reply::Html(html)) => html_response(html),
            Ok(Reply::NotFound(message)) => text_response(StatusCode::NOT_FOUND, &message),
            Ok(Reply::File(body)) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, body.len)
                .body(StreamBody::new(body.stream.map_ok(Frame::data)).boxed_unsync())
                .unwrap(),
            Err(e @ FacadeError::NotAvailable { .. }) => {
                warn!("{}", e);
                text_response(StatusCode::NOT_FOUND, &e.to_string())
            }
            Err(e) => {
                error!("Request for {} failed: {}", path, e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };
        Ok(response)
    }
}

async fn bind_first(interface: &str, ports: RangeInclusive<u16>) -> Result<TcpListener> {
    let (first, last) = (*ports.start(), *ports.end());
    for port in ports {
        match TcpListener::bind((interface, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("Cannot bind {}:{}: {}", interface, port, e),
        }
    }
    Err(FacadeError::Configuration(format!(
        "no free port in {}-{} on {}",
        first, last, interface
    )))
}

/// Request path with percent escapes resolved, so `%2B` finds `+` filenames
fn decoded_path(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(path) => path.into_owned(),
        Err(_) => raw.to_string(),
    }
}

fn is_disconnect(err: &hyper::Error) -> bool {
    if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            );
        }
        source = cause.source();
    }
    false
}

fn text_response(status: StatusCode, body: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

fn html_response(html: String) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(Bytes::from(html)))
        .unwrap()
}

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_first_skips_taken_ports() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        if port == u16::MAX {
            return;
        }

        let listener = bind_first("127.0.0.1", port..=port + 1).await;
        match listener {
            Ok(listener) => assert_eq!(listener.local_addr().unwrap().port(), port + 1),
            // The neighbouring port may belong to someone else.
            Err(e) => assert!(matches!(e, FacadeError::Configuration(_))),
        }
    }

    #[tokio::test]
    async fn test_bind_first_reports_exhausted_range() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = bind_first("127.0.0.1", port..=port).await.unwrap_err();
        assert!(matches!(err, FacadeError::Configuration(_)));
    }

    #[test]
    fn test_decoded_path() {
        assert_eq!(
            decoded_path("/default/torch/torch-2.0.0%2Bcpu-cp311-cp311-linux_x86_64.whl"),
            "/default/torch/torch-2.0.0+cpu-cp311-cp311-linux_x86_64.whl"
        );
        assert_eq!(decoded_path("/default/pip/"), "/default/pip/");
        assert_eq!(decoded_path("/bad/%FF/"), "/bad/%FF/");
    }

    #[tokio::test]
    async fn test_text_response() {
        let response = text_response(StatusCode::SERVICE_UNAVAILABLE, "Shutting down");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"Shutting down"));
    }
}
