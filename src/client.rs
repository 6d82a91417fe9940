use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::errors::{BricataError, Result};
use crate::results::Results;
use crate::session::{AuthSession, SessionManager};
use crate::transport::{path_segment, ReqwestTransport, Request, Transport};
use crate::types::{AlertQuery, AlertsFilter, TagRequest, ALERTS_DATA_KEY};

/// Client for the Bricata alert API
///
/// Every endpoint call logs in lazily, runs its requests as one batch and
/// reports per-request failures inside [`Results`] instead of failing the
/// call.
///
/// # Example
///
/// ```rust,no_run
/// use bricata_api_client::{BricataClient, ClientConfig, Credentials};
/// use url::Url;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::new(Url::parse("https://bricata.example.com/api")?)
///         .with_credentials(Credentials::new("analyst", "secret"));
///     let client = BricataClient::new(config)?;
///
///     let results = client.tag_alert("6f1c0c7e", "Escalate").await?;
///     if !results.is_ok() {
///         eprintln!("tagging failed: {:?}", results.failure);
///     }
///
///     client.close().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct BricataClient {
    session: Arc<SessionManager>,
    api_url: Url,
}

impl BricataClient {
    /// Create a new client from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation or the HTTP client
    /// cannot be built from the proxy and TLS settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client = build_http_client(&config)?;
        let client = ClientBuilder::new(client).build();
        Ok(Self::with_client(client, config))
    }

    /// Create a new client with a custom reqwest middleware client
    ///
    /// The timeout, proxy and TLS settings in `config` are not applied; the
    /// given client is used as is.
    pub fn with_client(client: ClientWithMiddleware, config: ClientConfig) -> Self {
        let transport = ReqwestTransport::new(client, config.base_uri.clone());
        Self::with_transport(Arc::new(transport), config)
    }

    /// Create a new client over any [`Transport`]
    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let dispatcher = Dispatcher::new(transport)
            .with_policy(config.retry.to_policy())
            .with_concurrency(config.concurrency)
            .with_batch_timeout(config.batch_timeout());
        let session = SessionManager::new(dispatcher, config.credentials.map(Arc::new));

        Self {
            session: Arc::new(session),
            api_url: config.base_uri,
        }
    }

    /// Log in unless already authenticated
    pub async fn login(&self) -> Result<Results> {
        self.session.login().await
    }

    /// Log in again, replacing the current token
    pub async fn relogin(&self) -> Result<Results> {
        self.session.relogin().await
    }

    /// Log out; the local session is dropped even if the server call fails
    pub async fn logout(&self) -> Result<Results> {
        self.session.logout().await
    }

    /// End the session, logging out if one is active
    pub async fn close(&self) -> Result<Results> {
        debug!("Closing Bricata client");
        self.session.logout().await
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub async fn session(&self) -> AuthSession {
        self.session.session().await
    }

    /// Run arbitrary authenticated requests as one batch
    pub async fn execute(&self, requests: Vec<Request>, data_key: Option<&str>) -> Result<Results> {
        self.session.execute(requests, data_key).await
    }

    /// Run arbitrary authenticated requests, aborting the batch when `token` fires
    pub async fn execute_cancellable(
        &self,
        requests: Vec<Request>,
        data_key: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Results> {
        self.session.execute_cancellable(requests, data_key, token).await
    }

    /// List alerts, optionally filtered
    ///
    /// Each success holds the `objects` array of one page; use
    /// [`Results::records`] for individual alerts.
    #[instrument(name = "BricataClient::get_alerts", skip_all)]
    pub async fn get_alerts(&self, filter: Option<&AlertsFilter>) -> Result<Results> {
        debug!("Getting alerts from Bricata");

        let mut request = Request::get("/alerts/");
        if let Some(filter) = filter {
            request = request.with_query_pairs(filter.to_query());
        }

        let results = self.execute(vec![request], Some(ALERTS_DATA_KEY)).await?;
        debug!(alerts = results.records().len(), "Retrieved alerts");
        Ok(results)
    }

    /// Run an [`AlertQuery`], listing or fetching a single alert
    #[instrument(name = "BricataClient::get_records", skip_all, fields(endpoint = %query.endpoint()))]
    pub async fn get_records(&self, query: &AlertQuery) -> Result<Results> {
        let request = Request::get(query.endpoint()).with_query_pairs(query.to_query());
        self.execute(vec![request], query.data_key()).await
    }

    /// Get a single alert
    #[instrument(name = "BricataClient::get_alert", skip_all, fields(uuid = uuid))]
    pub async fn get_alert(&self, uuid: &str) -> Result<Results> {
        debug!("Getting alert from Bricata");
        self.execute(vec![Request::get(alert_endpoint(uuid))], None)
            .await
    }

    /// Get several alerts concurrently, one request per uuid
    #[instrument(name = "BricataClient::get_alerts_by_uuid", skip_all, fields(count = uuids.len()))]
    pub async fn get_alerts_by_uuid(&self, uuids: &[&str]) -> Result<Results> {
        let requests = uuids
            .iter()
            .map(|uuid| Request::get(alert_endpoint(uuid)))
            .collect();
        self.execute(requests, None).await
    }

    /// Add `tag` to an alert
    #[instrument(name = "BricataClient::tag_alert", skip_all, fields(uuid = uuid, tag = tag))]
    pub async fn tag_alert(&self, uuid: &str, tag: &str) -> Result<Results> {
        self.tag_alerts(&[uuid], tag).await
    }

    /// Remove `tag` from an alert
    #[instrument(name = "BricataClient::untag_alert", skip_all, fields(uuid = uuid, tag = tag))]
    pub async fn untag_alert(&self, uuid: &str, tag: &str) -> Result<Results> {
        self.untag_alerts(&[uuid], tag).await
    }

    /// Add `tag` to every alert in `uuids`
    #[instrument(name = "BricataClient::tag_alerts", skip_all, fields(count = uuids.len(), tag = tag))]
    pub async fn tag_alerts(&self, uuids: &[&str], tag: &str) -> Result<Results> {
        debug!("Tagging alerts in Bricata");
        let requests = uuids
            .iter()
            .map(|uuid| Request::put(alert_tag_endpoint(uuid, tag)))
            .collect();
        self.execute(requests, None).await
    }

    /// Remove `tag` from every alert in `uuids`
    #[instrument(name = "BricataClient::untag_alerts", skip_all, fields(count = uuids.len(), tag = tag))]
    pub async fn untag_alerts(&self, uuids: &[&str], tag: &str) -> Result<Results> {
        debug!("Untagging alerts in Bricata");
        let requests = uuids
            .iter()
            .map(|uuid| Request::delete(alert_tag_endpoint(uuid, tag)))
            .collect();
        self.execute(requests, None).await
    }

    /// List all tags
    #[instrument(name = "BricataClient::get_tags", skip_all)]
    pub async fn get_tags(&self) -> Result<Results> {
        debug!("Getting tags from Bricata");
        self.execute(vec![Request::get("/tags/")], None).await
    }

    /// Create or update a tag
    ///
    /// # Errors
    ///
    /// Returns an error if the tag cannot be serialized, in addition to the
    /// errors of [`execute`](Self::execute).
    #[instrument(name = "BricataClient::put_tag", skip_all, fields(tag = %tag.name))]
    pub async fn put_tag(&self, tag: &TagRequest) -> Result<Results> {
        debug!("Creating tag in Bricata");
        let request = Request::put(tag_endpoint(&tag.name)).with_json(tag)?;
        self.execute(vec![request], None).await
    }

    /// Delete a tag
    #[instrument(name = "BricataClient::delete_tag", skip_all, fields(tag = name))]
    pub async fn delete_tag(&self, name: &str) -> Result<Results> {
        debug!("Deleting tag from Bricata");
        self.execute(vec![Request::delete(tag_endpoint(name))], None)
            .await
    }

    /// Get the base API URL
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }
}

fn alert_endpoint(uuid: &str) -> String {
    format!("/alert/{}", path_segment(uuid))
}

fn alert_tag_endpoint(uuid: &str, tag: &str) -> String {
    format!("/alerts/{}/tag/{}/", path_segment(uuid), path_segment(tag))
}

fn tag_endpoint(name: &str) -> String {
    format!("/tags/{}/", path_segment(name))
}

fn build_http_client(config: &ClientConfig) -> Result<Client> {
    let mut builder = Client::builder().timeout(config.timeout());

    if let Some(proxy) = &config.proxy {
        let mut http_proxy = reqwest::Proxy::all(format!("http://{}", proxy.uri))
            .map_err(BricataError::BuildHttpClient)?;
        if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            use secrecy::ExposeSecret;
            http_proxy = http_proxy.basic_auth(username, password.expose_secret());
        }
        builder = builder.proxy(http_proxy);
    }

    builder = apply_tls(builder, config)?;
    builder.build().map_err(BricataError::BuildHttpClient)
}

#[cfg(any(feature = "native-tls", feature = "rustls-tls"))]
fn apply_tls(mut builder: reqwest::ClientBuilder, config: &ClientConfig) -> Result<reqwest::ClientBuilder> {
    if !config.tls.verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(path) = &config.tls.ca_path {
        let pem = std::fs::read(path).map_err(BricataError::ConfigIo)?;
        let certificate =
            reqwest::Certificate::from_pem(&pem).map_err(BricataError::BuildHttpClient)?;
        builder = builder.add_root_certificate(certificate);
    }
    Ok(builder)
}

#[cfg(not(any(feature = "native-tls", feature = "rustls-tls")))]
fn apply_tls(builder: reqwest::ClientBuilder, config: &ClientConfig) -> Result<reqwest::ClientBuilder> {
    if !config.tls.verify || config.tls.ca_path.is_some() {
        return Err(BricataError::InvalidConfig(
            "TLS settings need the native-tls or rustls-tls feature".to_string(),
        ));
    }
    Ok(builder)
}
