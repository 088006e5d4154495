// REST client - CRUD, schema, delta and import calls with bearer auth

pub mod auth;

use std::sync::Arc;

use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::records::{
    CreateOutcome, DeleteOutcome, DeltaPayload, EntityRecord, EntitySummary, ImportList,
    ImportedEntity, UpdateOutcome,
};
use crate::schema::Schema;
use auth::{Session, SessionStore, TokenPair};

/// Refresh the access token when it expires within this window.
const TOKEN_LEEWAY_SECS: i64 = 30;

/// Client for the graph CRUD API. Data endpoints live under
/// `<server>/api`, token endpoints at the server root.
#[derive(Clone, Debug)]
pub struct ApiClient {
    server_url: String,
    api_base: String,
    client: reqwest::Client,
    store: SessionStore,
    session: Arc<RwLock<Session>>,
}

impl ApiClient {
    pub fn new(server: &ServerConfig, store: SessionStore) -> AppResult<Self> {
        let server_url = server.url.trim_end_matches('/').to_string();
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(AppError::ConfigurationError(format!(
                "Server URL must start with http:// or https://, got '{}'",
                server.url
            )));
        }
        let api_base = format!("{}/api", server_url);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(server.request_timeout_secs))
            .build()
            .map_err(|e| AppError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        let session = store.load()?;
        Ok(Self {
            server_url,
            api_base,
            client,
            store,
            session: Arc::new(RwLock::new(session)),
        })
    }

    // ========== Authentication ==========

    /// Exchanges credentials for a token pair and persists the session.
    pub async fn login(&self, username: &str, password: &str) -> AppResult<()> {
        let url = format!("{}/token/", self.server_url);
        let body = serde_json::json!({"username": username, "password": password});
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("Login request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(AppError::Unauthorized(
                "Login failed; check username and password".to_string(),
            ));
        }
        let tokens: TokenPair = resp.json().await.map_err(|e| {
            AppError::DeserializationError(format!("Token response did not parse: {}", e))
        })?;
        let mut session = self.session.write().await;
        session.username = Some(username.to_string());
        session.tokens = Some(tokens);
        self.store.save(&session)?;
        info!(username, "logged in");
        Ok(())
    }

    /// Drops tokens locally; the server keeps no session state.
    pub async fn logout(&self) -> AppResult<()> {
        let mut session = self.session.write().await;
        session.clear();
        self.store.clear()?;
        info!("logged out");
        Ok(())
    }

    pub async fn current_username(&self) -> Option<String> {
        self.session.read().await.username.clone()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.session.read().await.is_logged_in()
    }

    pub async fn access_expiry(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let session = self.session.read().await;
        let tokens = session.tokens.as_ref()?;
        auth::token_expiry(&tokens.access)
    }

    /// Trades the refresh token for a new access token. A rejected
    /// refresh token ends the session.
    async fn refresh(&self) -> AppResult<()> {
        let refresh = {
            let session = self.session.read().await;
            match &session.tokens {
                Some(tokens) => tokens.refresh.clone(),
                None => {
                    return Err(AppError::Unauthorized("Not logged in".to_string()));
                }
            }
        };
        let url = format!("{}/token/refresh/", self.server_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({"refresh": refresh}))
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("Token refresh failed: {}", e)))?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "refresh token rejected, ending session");
            self.logout().await?;
            return Err(AppError::Unauthorized(
                "Session expired; please log in again".to_string(),
            ));
        }
        #[derive(serde::Deserialize)]
        struct Refreshed {
            access: String,
        }
        let refreshed: Refreshed = resp.json().await.map_err(|e| {
            AppError::DeserializationError(format!("Refresh response did not parse: {}", e))
        })?;
        let mut session = self.session.write().await;
        if let Some(tokens) = session.tokens.as_mut() {
            tokens.access = refreshed.access;
        }
        self.store.save(&session)?;
        debug!("access token refreshed");
        Ok(())
    }

    // ========== Request plumbing ==========

    async fn dispatch(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> AppResult<Response> {
        let mut request = self.client.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(tokens) = self.session.read().await.tokens.as_ref() {
            request = request.bearer_auth(&tokens.access);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("Request to {} failed: {}", url, e)))
    }

    /// Sends a request, refreshing the access token once when the
    /// server flags it as expired, then retrying. Any other rejection
    /// surfaces as an authorization error.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> AppResult<Response> {
        let needs_refresh = {
            let session = self.session.read().await;
            session
                .tokens
                .as_ref()
                .map(|t| auth::token_expires_soon(&t.access, TOKEN_LEEWAY_SECS))
                .unwrap_or(false)
        };
        if needs_refresh {
            self.refresh().await?;
        }

        let resp = self.dispatch(method.clone(), url, query, body).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let payload: Value = resp.json().await.unwrap_or(Value::Null);
        if payload.get("code").and_then(Value::as_str) == Some("token_not_valid") {
            debug!(url, "access token expired, refreshing and retrying");
            self.refresh().await?;
            let retried = self.dispatch(method, url, query, body).await?;
            if retried.status() == StatusCode::UNAUTHORIZED {
                return Err(AppError::Unauthorized(
                    "Still unauthorized after refreshing the session".to_string(),
                ));
            }
            return Ok(retried);
        }
        Err(AppError::Unauthorized(
            "The server rejected the request; please log in".to_string(),
        ))
    }

    async fn expect_json<T: DeserializeOwned>(&self, resp: Response, context: &str) -> AppResult<T> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            let detail = resp.text().await.unwrap_or_default();
            return Err(AppError::NotFound(format!("{}: {}", context, detail)));
        }
        if !status.is_success() {
            return Err(AppError::Api(format!(
                "{} returned status {}",
                context, status
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| AppError::DeserializationError(format!("{}: {}", context, e)))
    }

    // ========== Endpoint URLs ==========

    fn list_url(&self, app: &str, entity_type: &str) -> String {
        format!("{}/{}/{}/", self.api_base, app, entity_type)
    }

    fn autocomplete_url(&self, app: &str, entity_type: &str) -> String {
        format!("{}/{}/autocomplete/{}/", self.api_base, app, entity_type)
    }

    fn record_url(&self, app: &str, entity_type: &str, uid: &str) -> String {
        format!("{}/{}/{}/{}", self.api_base, app, entity_type, uid)
    }

    fn create_url(&self, app: &str, entity_type: &str) -> String {
        format!("{}/{}/{}/new/", self.api_base, app, entity_type)
    }

    fn delete_url(&self, app: &str, entity_type: &str, uid: &str) -> String {
        format!("{}/{}/{}/{}/", self.api_base, app, entity_type, uid)
    }

    fn import_url(&self, app: &str, entity_type: &str, slug: &str) -> String {
        format!("{}/import/{}/{}/{}/", self.api_base, app, entity_type, slug)
    }

    // ========== Schema ==========

    pub async fn fetch_schema(&self) -> AppResult<Schema> {
        let url = format!("{}/schema/", self.api_base);
        let resp = self.execute(Method::GET, &url, &[], None).await?;
        self.expect_json(resp, "Schema fetch").await
    }

    // ========== Lists ==========

    /// Full list of summaries for a type.
    pub async fn list(&self, app: &str, entity_type: &str) -> AppResult<Vec<EntitySummary>> {
        let url = self.list_url(app, entity_type);
        let resp = self.execute(Method::GET, &url, &[], None).await?;
        self.expect_json(resp, "List fetch").await
    }

    /// Server-side filtered list; results are never cached.
    pub async fn list_filtered(
        &self,
        app: &str,
        entity_type: &str,
        filter: &str,
    ) -> AppResult<Vec<EntitySummary>> {
        let url = self.list_url(app, entity_type);
        let resp = self
            .execute(Method::GET, &url, &[("filter", filter)], None)
            .await?;
        self.expect_json(resp, "Filtered list fetch").await
    }

    /// Changes since `since`, an ISO-8601 timestamp from a previous
    /// full or delta fetch.
    pub async fn list_delta(
        &self,
        app: &str,
        entity_type: &str,
        since: &str,
    ) -> AppResult<DeltaPayload> {
        let url = self.list_url(app, entity_type);
        let resp = self
            .execute(Method::GET, &url, &[("lastRefreshedTimestamp", since)], None)
            .await?;
        self.expect_json(resp, "Delta fetch").await
    }

    pub async fn autocomplete(
        &self,
        app: &str,
        entity_type: &str,
    ) -> AppResult<Vec<EntitySummary>> {
        let url = self.autocomplete_url(app, entity_type);
        let resp = self.execute(Method::GET, &url, &[], None).await?;
        self.expect_json(resp, "Autocomplete fetch").await
    }

    // ========== Records ==========

    pub async fn record(
        &self,
        app: &str,
        entity_type: &str,
        uid: &str,
    ) -> AppResult<EntityRecord> {
        let url = self.record_url(app, entity_type, uid);
        let resp = self.execute(Method::GET, &url, &[], None).await?;
        self.expect_json(resp, "Record fetch").await
    }

    pub async fn create(
        &self,
        app: &str,
        entity_type: &str,
        data: &Value,
    ) -> AppResult<CreateOutcome> {
        let url = self.create_url(app, entity_type);
        let resp = self.execute(Method::POST, &url, &[], Some(data)).await?;
        self.expect_json(resp, "Create").await
    }

    pub async fn update(
        &self,
        app: &str,
        entity_type: &str,
        uid: &str,
        data: &Value,
    ) -> AppResult<UpdateOutcome> {
        let url = self.record_url(app, entity_type, uid);
        let resp = self.execute(Method::PUT, &url, &[], Some(data)).await?;
        self.expect_json(resp, "Update").await
    }

    /// Requests deletion. The outcome distinguishes an outright
    /// removal from one pending on dependent entities; both arrive as
    /// a JSON body even on error statuses.
    pub async fn delete(
        &self,
        app: &str,
        entity_type: &str,
        uid: &str,
    ) -> AppResult<DeleteOutcome> {
        let url = self.delete_url(app, entity_type, uid);
        let resp = self.execute(Method::DELETE, &url, &[], None).await?;
        self.read_delete_outcome(resp, "Delete").await
    }

    /// Undoes a pending deletion.
    pub async fn restore(
        &self,
        app: &str,
        entity_type: &str,
        uid: &str,
    ) -> AppResult<DeleteOutcome> {
        let url = self.delete_url(app, entity_type, uid);
        let resp = self
            .execute(Method::DELETE, &url, &[("restore", "true")], None)
            .await?;
        self.read_delete_outcome(resp, "Restore").await
    }

    async fn read_delete_outcome(
        &self,
        resp: Response,
        context: &str,
    ) -> AppResult<DeleteOutcome> {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<DeleteOutcome>(&text) {
            Ok(outcome) => Ok(outcome),
            Err(_) if status == StatusCode::NOT_FOUND => {
                Err(AppError::NotFound(format!("{}: {}", context, text)))
            }
            Err(e) => Err(AppError::DeserializationError(format!("{}: {}", context, e))),
        }
    }

    // ========== Import ==========

    /// Searches an external source through the server's import proxy.
    pub async fn import_search(
        &self,
        app: &str,
        entity_type: &str,
        slug: &str,
        q: &str,
    ) -> AppResult<ImportList> {
        let url = self.import_url(app, entity_type, slug);
        let resp = self.execute(Method::GET, &url, &[("q", q)], None).await?;
        self.expect_json(resp, "Import search").await
    }

    /// Asks the server to mint entities from source identifiers.
    pub async fn import_create(
        &self,
        app: &str,
        entity_type: &str,
        slug: &str,
        uris: &[String],
    ) -> AppResult<Vec<ImportedEntity>> {
        let url = self.import_url(app, entity_type, slug);
        let body = serde_json::to_value(uris).map_err(|e| {
            AppError::SerializationError(format!("Import request did not serialize: {}", e))
        })?;
        let resp = self.execute(Method::POST, &url, &[], Some(&body)).await?;
        self.expect_json(resp, "Import create").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tempfile::tempdir;

    fn client() -> ApiClient {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        ApiClient::new(
            &ServerConfig {
                url: "http://localhost:8000/".to_string(),
                request_timeout_secs: 5,
            },
            store,
        )
        .unwrap()
    }

    #[test]
    fn test_trailing_slash_stripped_from_server_url() {
        let client = client();
        assert_eq!(client.api_base, "http://localhost:8000/api");
    }

    #[test]
    fn test_server_url_requires_http_scheme() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        let err = ApiClient::new(
            &ServerConfig {
                url: "localhost:8000".to_string(),
                request_timeout_secs: 5,
            },
            store,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
    }

    #[test]
    fn test_endpoint_urls() {
        let client = client();
        assert_eq!(
            client.list_url("core", "person"),
            "http://localhost:8000/api/core/person/"
        );
        assert_eq!(
            client.autocomplete_url("core", "person"),
            "http://localhost:8000/api/core/autocomplete/person/"
        );
        assert_eq!(
            client.record_url("core", "person", "u1"),
            "http://localhost:8000/api/core/person/u1"
        );
        assert_eq!(
            client.create_url("core", "person"),
            "http://localhost:8000/api/core/person/new/"
        );
        assert_eq!(
            client.delete_url("core", "person", "u1"),
            "http://localhost:8000/api/core/person/u1/"
        );
        assert_eq!(
            client.import_url("core", "person", "wikidata"),
            "http://localhost:8000/api/import/core/person/wikidata/"
        );
    }
}
