use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1::Builder as Http1Builder,
    service::service_fn,
};
use hyper_util::rt::tokio::TokioIo;
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::bridge::UiBridge;
use crate::launcher_log;

/// Local HTTP accessor for a UI that runs in another process.
pub struct InfoServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl InfoServer {
    pub async fn start(bind_addr: SocketAddr, bridge: Arc<UiBridge>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind info server on {bind_addr}"))?;
        let local_addr = listener.local_addr()?;
        launcher_log::info(
            module_path!(),
            format!("info server listening on http://{local_addr}"),
        );
        let (tx, mut shutdown) = oneshot::channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    accept = listener.accept() => match accept {
                        Ok((stream, _peer)) => {
                            let bridge = bridge.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    handle_request(req, bridge.clone())
                                });
                                let http = Http1Builder::new();
                                let stream = TokioIo::new(stream);
                                if let Err(err) = http.serve_connection(stream, service).await {
                                    launcher_log::error(
                                        module_path!(),
                                        format!("info server connection error: {err}"),
                                    );
                                }
                            });
                        }
                        Err(err) => {
                            launcher_log::error(
                                module_path!(),
                                format!("info server accept error: {err}"),
                            );
                        }
                    },
                }
            }
        });
        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    bridge: Arc<UiBridge>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({ "error": "only GET is supported" }),
        ));
    }
    let response = match req.uri().path() {
        "/tunnel-url" => json_response(
            StatusCode::OK,
            json!({ "tunnel_url": bridge.tunnel_url() }),
        ),
        "/network-info" => match serde_json::to_value(bridge.network_info()) {
            Ok(value) => json_response(StatusCode::OK, value),
            Err(err) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.to_string() }),
            ),
        },
        "/endpoint" => match serde_json::to_value(bridge.current()) {
            Ok(value) => json_response(StatusCode::OK, value),
            Err(err) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.to_string() }),
            ),
        },
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    };
    Ok(response)
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
