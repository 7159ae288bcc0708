#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod access;
mod aes;
mod api;
mod chunk_engine;
pub mod config;
pub mod download_streamer;
pub mod edge_proxy;
mod error;
pub mod export_policy;
mod middleware;
pub mod path_resolver;
mod pgp;
mod request_hook;
mod resumable;
mod stream_pipeline;
pub mod tenant_keys;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{uri::Scheme, Uri},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;

use access::http::{apply_auth, AuthState};
use config::Config;
use error::{ServerError, ServerResult};
use middleware::{init_request_state, restrict_host};
use pgp::PgpKeyring;
use resumable::ResumableStore;
use tenant_keys::TenantKeyStore;

type State = Arc<StateInner>;
type RequestState = Arc<RequestStateInner>;

/// Global server state.
pub struct StateInner {
    /// The service configuration.
    config: Config,

    /// Per-tenant JWT verification keys.
    tenant_keys: TenantKeyStore,

    /// Bookkeeping for in-progress resumable uploads.
    resumable: ResumableStore,

    /// The service's OpenPGP private key, if this deployment supports
    /// PGP-wrapped `Aes-Key` headers.
    pgp_keyring: Option<PgpKeyring>,

    /// Client used for EdgeProxy's internal loopback requests.
    http_client: reqwest::Client,
}

/// Request state.
#[derive(Debug)]
struct RequestStateInner {
    /// Auth state.
    auth: AuthState,

    /// The canonical API endpoint.
    api_endpoint: Option<String>,

    /// The potentially-invalid Host header supplied by the client.
    host: String,

    /// Whether the client claims the connection is HTTPS or not.
    client_claims_https: bool,
}

impl StateInner {
    async fn new(config: Config) -> Result<State> {
        let pgp_keyring = match &config.pgp {
            Some(pgp_config) => {
                let armored = tokio::fs::read_to_string(&pgp_config.private_key_path)
                    .await
                    .context("reading PGP private key")?;
                Some(
                    PgpKeyring::from_armored(&armored, pgp_config.passphrase.clone())
                        .map_err(|e| anyhow::anyhow!("{e}"))?,
                )
            }
            None => None,
        };

        let tenant_keys = TenantKeyStore::new(config.tenant_keys.clone());
        let resumable = ResumableStore::new();
        let http_client = reqwest::Client::new();

        Ok(Arc::new(Self {
            config,
            tenant_keys,
            resumable,
            pgp_keyring,
            http_client,
        }))
    }
}

impl RequestStateInner {
    /// Returns the base API endpoint for clients, used to build `href`s in
    /// export listings.
    fn api_endpoint(&self) -> ServerResult<String> {
        if let Some(endpoint) = &self.api_endpoint {
            Ok(endpoint.to_owned())
        } else {
            // Naively synthesize from client's Host header.
            // For convenience and shouldn't be used in production!
            let uri = Uri::builder()
                .scheme(if self.client_claims_https {
                    Scheme::HTTPS
                } else {
                    Scheme::HTTP
                })
                .authority(self.host.to_owned())
                .path_and_query("/")
                .build()
                .map_err(ServerError::request_error)?;

            Ok(uri.to_string())
        }
    }
}

/// The fallback route.
#[axum_macros::debug_handler]
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ServerError::NotFound)
}

/// Runs the API server.
pub async fn run_api_server(cli_listen: Option<SocketAddr>, config: Config) -> Result<()> {
    eprintln!("Starting API server...");

    let state = StateInner::new(config).await?;

    let listen = if let Some(cli_listen) = cli_listen {
        cli_listen
    } else {
        state.config.listen.to_owned()
    };

    let rest = Router::new()
        .merge(api::get_router())
        .fallback(fallback)
        // middlewares
        .layer(axum::middleware::from_fn(apply_auth))
        .layer(axum::middleware::from_fn(init_request_state))
        .layer(axum::middleware::from_fn(restrict_host))
        .layer(Extension(state.clone()))
        .layer(CatchPanicLayer::new());

    eprintln!("Listening on {:?}...", listen);

    axum::Server::bind(&listen)
        .serve(rest.into_make_service())
        .await?;

    Ok(())
}
