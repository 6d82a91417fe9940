//! # Bricata API Client
//!
//! A Rust client library for the Bricata alert management REST API.
//!
//! ## Features
//!
//! - Session login/logout with lazy login on first authenticated call
//! - Alert listing, lookup, tagging and untagging
//! - Tag create/update/delete
//! - Batches run with bounded concurrency (5 in flight by default)
//! - Transient failures (429, 503, connection errors) retried with
//!   exponential backoff and jitter
//! - One failed request never aborts its batch: every call returns
//!   [`Results`] with a success/failure partition
//!
//! ## Example
//!
//! ```rust,no_run
//! use bricata_api_client::{AlertsFilter, BricataClient, ClientConfig, TagRequest};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::load(Path::new("bricata_api_client.toml"))?;
//!     let client = BricataClient::new(config)?;
//!
//!     client
//!         .put_tag(&TagRequest::new("Escalate").with_color("#D94444"))
//!         .await?;
//!
//!     let alerts = client
//!         .get_alerts(Some(&AlertsFilter::new().with_tags("Drop").with_limit(50)))
//!         .await?;
//!     let uuids: Vec<&str> = alerts
//!         .records()
//!         .into_iter()
//!         .filter_map(|alert| alert["uuid"].as_str())
//!         .collect();
//!
//!     let tagged = client.tag_alerts(&uuids, "Escalate").await?;
//!     println!("tagged {}, failed {}", tagged.success.len(), tagged.failure.len());
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod dispatch;
mod errors;
mod results;
mod retry;
mod session;
mod transport;
mod types;

pub use client::BricataClient;
pub use config::{ClientConfig, Credentials, ProxyConfig, RetrySettings, TlsConfig};
pub use dispatch::Dispatcher;
pub use errors::{BricataError, Failure, FailureKind, Result, TransportError, TransportErrorKind};
pub use results::{aggregate, Outcome, Results, Success};
pub use retry::{Classification, Jitter, RetryContext, RetryPolicy, Sleeper, TokioSleeper};
pub use session::{AuthSession, SessionManager, SessionState};
pub use transport::{path_segment, Headers, HttpMethod, ReqwestTransport, Request, Response, Transport};
pub use types::{AlertQuery, AlertsFilter, TagRequest, TagsOp, ALERTS_DATA_KEY};
