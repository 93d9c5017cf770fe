//! Prometheus text exposition of the gauge store.
//!
//! Every `GET`, whatever the path, is answered with the current contents of
//! the [`GaugeStore`] in the Prometheus text format, version 0.0.4, followed
//! by the exporter's own telemetry when a recorder handle is supplied. Other
//! methods receive `405 Method Not Allowed`.

use std::{
    fmt::{self, Write as _},
    net::SocketAddr,
    sync::Arc,
};

use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use sql_exporter_signal::Watcher;
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::gauge::{GaugeSeries, GaugeStore};

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

fn default_binding_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9296))
}

fn default_concurrent_requests_max() -> usize {
    100
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Server`]
pub struct Config {
    /// Address and port the exposition endpoint listens on
    #[serde(default = "default_binding_addr")]
    pub binding_addr: SocketAddr,
    /// Maximum number of connections served at once, excess connections are
    /// dropped
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binding_addr: default_binding_addr(),
            concurrent_requests_max: default_concurrent_requests_max(),
        }
    }
}

/// Render a store snapshot, as returned by [`GaugeStore::snapshot`], in the
/// Prometheus text format.
#[must_use]
pub fn render(snapshot: &[(String, GaugeSeries)]) -> String {
    Exposition(snapshot).to_string()
}

struct Exposition<'a>(&'a [(String, GaugeSeries)]);

impl fmt::Display for Exposition<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, series) in self.0 {
            writeln!(f, "# TYPE {name} gauge")?;

            let mut lines: Vec<(&Vec<String>, f64)> =
                series.current().iter().map(|(k, v)| (k, *v)).collect();
            lines.sort_by(|a, b| a.0.cmp(b.0));

            for (label_values, value) in lines {
                f.write_str(name)?;
                if !series.label_keys().is_empty() {
                    f.write_char('{')?;
                    for (i, (key, label)) in
                        series.label_keys().iter().zip(label_values).enumerate()
                    {
                        if i > 0 {
                            f.write_char(',')?;
                        }
                        write!(f, "{key}=\"")?;
                        write_escaped(f, label)?;
                        f.write_char('"')?;
                    }
                    f.write_char('}')?;
                }
                f.write_char(' ')?;
                write_value(f, value)?;
                f.write_char('\n')?;
            }
        }
        Ok(())
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    for c in value.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '"' => f.write_str("\\\"")?,
            '\n' => f.write_str("\\n")?,
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

fn write_value(f: &mut fmt::Formatter<'_>, value: f64) -> fmt::Result {
    if value.is_nan() {
        f.write_str("NaN")
    } else if value.is_infinite() {
        f.write_str(if value.is_sign_positive() { "+Inf" } else { "-Inf" })
    } else {
        write!(f, "{value}")
    }
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[derive(Clone)]
struct Handler {
    store: Arc<GaugeStore>,
    telemetry: Option<PrometheusHandle>,
}

impl Handler {
    async fn handle_request(
        self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        if *req.method() != Method::GET {
            let mut response = Response::new(full(Bytes::from_static(b"Method Not Allowed")));
            *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET"));
            return Ok(response);
        }

        let mut body = render(&self.store.snapshot());
        if let Some(telemetry) = &self.telemetry {
            body.push_str(&telemetry.render());
        }

        let mut response = Response::new(full(body));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
        Ok(response)
    }
}

/// The HTTP exposition endpoint.
pub struct Server {
    listener: TcpListener,
    concurrency_limit: usize,
    handler: Handler,
    shutdown: Watcher,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.listener.local_addr().ok())
            .field("concurrency_limit", &self.concurrency_limit)
            .field("telemetry", &self.handler.telemetry.is_some())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a new [`Server`] instance, bound to the configured address
    ///
    /// `telemetry`, when present, is rendered after the gauge store on every
    /// scrape.
    ///
    /// # Errors
    ///
    /// Function will return an error if the address cannot be bound.
    pub async fn bind(
        config: Config,
        store: Arc<GaugeStore>,
        telemetry: Option<PrometheusHandle>,
        shutdown: Watcher,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.binding_addr).await?;
        Ok(Self {
            listener,
            concurrency_limit: config.concurrent_requests_max,
            handler: Handler { store, telemetry },
            shutdown,
        })
    }

    /// The address actually bound, useful when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Function will return an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Run this [`Server`] to completion
    ///
    /// Serves scrapes until the shutdown signal is received. Connections
    /// still open at shutdown are aborted.
    ///
    /// # Errors
    ///
    /// Function will return an error if the listener's address cannot be
    /// read.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            listener,
            concurrency_limit,
            handler,
            shutdown,
        } = self;
        info!("exposition endpoint listening on {}", listener.local_addr()?);
        let sem = Arc::new(Semaphore::new(concurrency_limit));
        let mut join_set = JoinSet::new();

        let shutdown_fut = shutdown.recv();
        pin!(shutdown_fut);
        loop {
            tokio::select! {
                () = &mut shutdown_fut => {
                    info!("Shutdown signal received, stopping accept loop.");
                    break;
                }

                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(sa) => sa,
                        Err(e) => {
                            error!("Error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {addr}");

                    let sem = Arc::clone(&sem);
                    let handler = handler.clone();

                    join_set.spawn(async move {
                        let permit = match sem.try_acquire() {
                            Ok(p) => p,
                            Err(TryAcquireError::Closed) => {
                                error!("Semaphore closed");
                                return;
                            }
                            Err(TryAcquireError::NoPermits) => {
                                warn!("exposition over connection capacity, load shedding");
                                drop(stream);
                                return;
                            }
                        };

                        let service = hyper::service::service_fn(move |req| {
                            handler.clone().handle_request(req)
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = builder
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            error!("Error serving {addr}: {e}");
                        }
                        drop(permit);
                    });
                }
            }
        }

        drop(listener);
        join_set.shutdown().await;
        Ok(())
    }
}
