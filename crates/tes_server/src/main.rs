#![forbid(unsafe_code)]

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use tes_client::{EventDescriptor, EventSubClient, EventType, TransportMethod, webhook};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{ServerConfig, SubscriptionSettings};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tes_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.tes/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter =
		std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tes_server=debug,tes_client=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tes_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn log_event(payload: &serde_json::Value, descriptor: &EventDescriptor) {
	metrics::counter!("tes_server_events_total").increment(1);
	match descriptor {
		EventDescriptor::Subscription(sub) => {
			info!(subscription_id = %sub.id, subscription_type = %sub.kind, event = %payload, "event");
		}
		EventDescriptor::ConnectionLost => {
			warn!(subscriptions = %payload, "websocket connection lost");
		}
		EventDescriptor::Revocation(sub) => {
			warn!(subscription_id = %sub.id, subscription_type = %sub.kind, status = ?sub.status, "subscription revoked");
		}
	}
}

fn register_handlers(client: &EventSubClient, subscriptions: &[SubscriptionSettings]) {
	for sub in subscriptions {
		client.on(sub.kind.as_str(), log_event);
	}
	client.on(EventType::ConnectionLost, log_event);
	client.on(EventType::Revocation, log_event);
}

fn spawn_webhook_listener(client: &EventSubClient, cfg: &ServerConfig) -> anyhow::Result<()> {
	let Some(handler) = client.webhook_handler() else {
		return Ok(());
	};
	let Some(bind) = cfg.server.webhook_bind.as_deref() else {
		warn!("webhook transport configured without server.webhook_bind; not listening");
		return Ok(());
	};
	let addr: SocketAddr = bind
		.parse()
		.map_err(|e| anyhow::anyhow!("invalid webhook bind address {bind}: {e}"))?;

	let path = cfg.listener.webhook_path.clone();
	tokio::spawn(async move {
		if let Err(e) = webhook::serve(addr, &path, handler).await {
			error!(error = %e, "webhook listener stopped");
		}
	});
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let client = EventSubClient::new(server_cfg.to_tes_config())?;
	register_handlers(&client, &server_cfg.subscriptions);

	if client.transport() == TransportMethod::Webhook {
		spawn_webhook_listener(&client, &server_cfg)?;
	}

	for sub in &server_cfg.subscriptions {
		let client = client.clone();
		let sub = sub.clone();
		tokio::spawn(async move {
			match client.subscribe(&sub.kind, sub.condition.clone(), &sub.version).await {
				Ok(created) => {
					info!(subscription_id = %created.id, subscription_type = %created.kind, condition = %created.condition, "subscribed");
				}
				Err(e) => {
					error!(subscription_type = %sub.kind, condition = %sub.condition, error = %e, "subscribe failed");
				}
			}
		});
	}

	tokio::signal::ctrl_c().await?;
	info!("shutting down");
	client.close();

	Ok(())
}
