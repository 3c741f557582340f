//! Hosts the folio portfolio http-server.
//!
//! The server exposes the portfolio content (projects, skills, awards and timeline) and a storage
//! browser over JSON. Everything is persisted through one storage backend, picked at start-up from
//! the configuration: local files, process memory, a cloud edge-KV service or an HTTP proxy in
//! front of one.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;

use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;

use tracing::{error, info, warn};

use api::auth::{Authorizer, NoopAuthorizer};
#[cfg(feature = "jwt")]
use auth_impls::jwt::JwtAuthorizer;
use folio_service::FolioService;
use impls::storage_factory::create_storage_backend;

mod folio_service;
mod resource_store;
mod telemetry;
mod util;

/// Time in-flight requests get to finish once shutdown starts.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

fn main() {
	let args: Vec<String> = std::env::args().collect();

	let config =
		util::config::load_configuration(args.get(1).map(|s| s.as_str())).unwrap_or_else(|e| {
			eprintln!("Failed to load configuration: {}", e);
			std::process::exit(-1);
		});

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(runtime) => Arc::new(runtime),
		Err(e) => {
			eprintln!("Failed to setup tokio runtime: {}", e);
			std::process::exit(-1);
		},
	};

	// The OTLP exporter needs a runtime context when it is built.
	let tracer_provider = runtime.block_on(async {
		telemetry::configure_tracer(config.log_level, config.otlp_endpoint.as_deref())
			.unwrap_or_else(|e| {
				eprintln!("Failed to initialize tracing: {}", e);
				std::process::exit(-1);
			})
	});

	runtime.block_on(async {
		let mut sigterm_stream = match tokio::signal::unix::signal(SignalKind::terminate()) {
			Ok(stream) => stream,
			Err(e) => {
				error!("Failed to register for SIGTERM stream: {}", e);
				std::process::exit(-1);
			},
		};

		let authorizer: Option<Arc<dyn Authorizer>> = {
			#[cfg(feature = "jwt")]
			{
				let configured = match (&config.rsa_pem, &config.jwt_secret) {
					(Some(rsa_pem), _) => Some(JwtAuthorizer::from_rsa_pem(rsa_pem).map(|auth| {
						info!("Configured JWT authorizer with RSA public key");
						auth
					})),
					(None, Some(secret)) => Some(JwtAuthorizer::from_secret(secret).map(|auth| {
						info!("Configured JWT authorizer with shared secret");
						auth
					})),
					(None, None) => None,
				};
				match configured.transpose() {
					Ok(auth) => auth.map(|auth| Arc::new(auth) as Arc<dyn Authorizer>),
					Err(e) => {
						error!("Failed to configure JWT authorizer: {}", e);
						std::process::exit(-1);
					},
				}
			}
			#[cfg(not(feature = "jwt"))]
			{
				None
			}
		};
		let authorizer = if let Some(auth) = authorizer {
			auth
		} else {
			warn!("No authentication method configured, every caller may modify the portfolio content.");
			Arc::new(NoopAuthorizer {})
		};

		let backend = create_storage_backend(&config.storage).unwrap_or_else(|e| {
			error!("Failed to create storage backend: {}", e);
			std::process::exit(-1);
		});
		let folio_service = FolioService::new(backend, authorizer);

		let rest_svc_listener = TcpListener::bind(&config.bind_address).await.unwrap_or_else(|e| {
			error!("Failed to bind listening port: {}", e);
			std::process::exit(-1);
		});
		info!("Listening for incoming connections on {}", config.bind_address);

		let graceful = GracefulShutdown::new();
		loop {
			tokio::select! {
				res = rest_svc_listener.accept() => {
					match res {
						Ok((stream, _)) => {
							let io_stream = TokioIo::new(stream);
							let connection = http1::Builder::new().serve_connection(io_stream, folio_service.clone());
							let connection = graceful.watch(connection);
							runtime.spawn(async move {
								if let Err(err) = connection.await {
									warn!("Failed to serve connection: {}", err);
								}
							});
						},
						Err(e) => warn!("Failed to accept connection: {}", e),
					}
				}
				_ = tokio::signal::ctrl_c() => {
					info!("Received CTRL-C, shutting down..");
					break;
				}
				_ = sigterm_stream.recv() => {
					info!("Received SIGTERM, shutting down..");
					break;
				}
			}
		}

		if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, graceful.shutdown()).await.is_err() {
			warn!("Timed out waiting for open connections to close");
		}
	});

	if let Some(provider) = tracer_provider {
		if let Err(e) = provider.shutdown() {
			eprintln!("Failed to flush traces: {}", e);
		}
	}
}
