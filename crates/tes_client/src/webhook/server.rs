#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::{WebhookHandler, WebhookHeaders};

#[derive(Clone)]
struct WebhookState {
	path: Arc<str>,
	handler: Arc<WebhookHandler>,
}

/// Serve `handler` on `bind`, accepting deliveries at `path`. Runs until the listener fails.
pub async fn serve(bind: SocketAddr, path: &str, handler: Arc<WebhookHandler>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	serve_listener(listener, path, handler).await
}

/// Like [`serve`] on an already bound listener.
pub async fn serve_listener(listener: TcpListener, path: &str, handler: Arc<WebhookHandler>) -> anyhow::Result<()> {
	let state = WebhookState {
		path: Arc::from(path),
		handler,
	};
	info!(bind = ?listener.local_addr().ok(), path = %state.path, "webhook listener started");

	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_webhook(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "webhook connection error");
			}
		});
	}
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::new()))
		.unwrap()
}

async fn handle_webhook(req: Request<Incoming>, state: WebhookState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();

	if parts.method != Method::POST {
		return Ok(empty(StatusCode::METHOD_NOT_ALLOWED));
	}

	if parts.uri.path() != &*state.path {
		return Ok(empty(StatusCode::NOT_FOUND));
	}

	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(err) => {
			warn!(error = %err, "webhook body read failed");
			return Ok(empty(StatusCode::BAD_REQUEST));
		}
	};

	let headers = WebhookHeaders::from_header_map(&parts.headers);
	let reply = state.handler.handle(&headers, &body_bytes);

	let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	Ok(Response::builder()
		.status(status)
		.header(CONTENT_TYPE, reply.content_type)
		.body(Full::new(Bytes::from(reply.body)))
		.unwrap())
}
