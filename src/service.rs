// Desk service - ties schema, API client and caches together

use std::num::NonZeroUsize;

use futures::future::join_all;
use lru::LruCache;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::cache::SummaryCache;
use crate::error::{AppError, AppResult};
use crate::records::{
    CreateOutcome, DeleteOutcome, EntityRecord, EntitySummary, ImportList, ImportedEntity,
    UpdateOutcome,
};
use crate::schema::{EntityDescriptor, Schema};

/// One façade over everything the shell and views need: list reads
/// served from the summary cache where allowed, record CRUD passed to
/// the API, and autocomplete candidates kept warm in an LRU.
pub struct DeskService {
    api: ApiClient,
    cache: SummaryCache,
    schema: Schema,
    autocomplete: Mutex<LruCache<String, Vec<EntitySummary>>>,
}

impl DeskService {
    pub fn new(
        api: ApiClient,
        cache: SummaryCache,
        schema: Schema,
        autocomplete_capacity: usize,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(autocomplete_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            api,
            cache,
            schema,
            autocomplete: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    // ========== Session ==========

    pub async fn login(&self, username: &str, password: &str) -> AppResult<()> {
        self.api.login(username, password).await
    }

    pub async fn logout(&self) -> AppResult<()> {
        self.api.logout().await
    }

    pub async fn current_username(&self) -> Option<String> {
        self.api.current_username().await
    }

    pub async fn access_expiry(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.api.access_expiry().await
    }

    // ========== Lists ==========

    /// Summaries for a type. Filtered queries and types with list
    /// caching disabled go straight to the server; everything else is
    /// served from the cache after a full or delta refresh.
    pub async fn list(
        &self,
        entity_type: &str,
        filter: Option<&str>,
    ) -> AppResult<Vec<EntitySummary>> {
        let desc = self.schema.descriptor(entity_type)?;
        if desc.meta.inline_only {
            return Err(AppError::SchemaError(format!(
                "'{}' is inline-only and has no list endpoint",
                entity_type
            )));
        }

        if let Some(filter) = filter {
            return self.api.list_filtered(&desc.app, entity_type, filter).await;
        }
        if !desc.meta.list_cache_enabled() {
            return self.api.list(&desc.app, entity_type).await;
        }

        match self.cache.last_refreshed(entity_type).await? {
            Some(since) => {
                let delta = self.api.list_delta(&desc.app, entity_type, &since).await?;
                self.cache.apply_delta(entity_type, &delta).await?;
            }
            None => {
                let items = self.api.list(&desc.app, entity_type).await?;
                self.cache.store_full(entity_type, &items).await?;
            }
        }
        self.cache.list(entity_type).await
    }

    /// Drops the cached list for a type and fetches it in full.
    pub async fn refresh_list(&self, entity_type: &str) -> AppResult<Vec<EntitySummary>> {
        self.cache.forget_type(entity_type).await?;
        self.forget_candidates(entity_type).await;
        self.list(entity_type, None).await
    }

    /// Candidates for linking a relation against `entity_type`. Reads
    /// the cached list, memoized in an LRU so repeated filtering while
    /// editing does not re-query the cache.
    pub async fn autocomplete_candidates(
        &self,
        entity_type: &str,
    ) -> AppResult<Vec<EntitySummary>> {
        let key = entity_type.to_lowercase();
        if let Some(hit) = self.autocomplete.lock().await.get(&key) {
            return Ok(hit.clone());
        }
        let items = self.list(&key, None).await?;
        self.autocomplete.lock().await.put(key, items.clone());
        Ok(items)
    }

    async fn forget_candidates(&self, entity_type: &str) {
        self.autocomplete
            .lock()
            .await
            .pop(&entity_type.to_lowercase());
    }

    /// Prefetches list caches for every listable type concurrently.
    /// Failures are logged per type and do not stop the others.
    pub async fn warm_up(&self) -> usize {
        let types: Vec<String> = self
            .schema
            .listable_types()
            .iter()
            .map(|t| t.to_string())
            .collect();
        let results = join_all(types.iter().map(|t| self.list(t, None))).await;

        let mut warmed = 0;
        for (entity_type, result) in types.iter().zip(results) {
            match result {
                Ok(items) => {
                    warmed += 1;
                    debug!(entity_type = %entity_type, count = items.len(), "warmed list cache");
                }
                Err(e) => {
                    warn!(entity_type = %entity_type, error = %e, "list warm-up failed");
                }
            }
        }
        warmed
    }

    // ========== Records ==========

    pub async fn record(&self, entity_type: &str, uid: &str) -> AppResult<EntityRecord> {
        let desc = self.endpoint_descriptor(entity_type)?;
        self.api.record(&desc.app, entity_type, uid).await
    }

    pub async fn create(&self, entity_type: &str, data: &Value) -> AppResult<CreateOutcome> {
        let desc = self.endpoint_descriptor(entity_type)?;
        if desc.meta.is_abstract {
            return Err(AppError::SchemaError(format!(
                "'{}' is abstract; create one of its concrete subtypes",
                entity_type
            )));
        }
        let outcome = self.api.create(&desc.app, entity_type, data).await?;
        self.forget_candidates(entity_type).await;
        Ok(outcome)
    }

    pub async fn update(
        &self,
        entity_type: &str,
        uid: &str,
        data: &Value,
    ) -> AppResult<UpdateOutcome> {
        let desc = self.endpoint_descriptor(entity_type)?;
        let outcome = self.api.update(&desc.app, entity_type, uid, data).await?;
        self.forget_candidates(entity_type).await;
        Ok(outcome)
    }

    pub async fn delete(&self, entity_type: &str, uid: &str) -> AppResult<DeleteOutcome> {
        let desc = self.endpoint_descriptor(entity_type)?;
        let outcome = self.api.delete(&desc.app, entity_type, uid).await?;
        self.forget_candidates(entity_type).await;
        Ok(outcome)
    }

    pub async fn restore(&self, entity_type: &str, uid: &str) -> AppResult<DeleteOutcome> {
        let desc = self.endpoint_descriptor(entity_type)?;
        let outcome = self.api.restore(&desc.app, entity_type, uid).await?;
        self.forget_candidates(entity_type).await;
        Ok(outcome)
    }

    /// Inline-only types live nested inside other records; the server
    /// exposes no endpoints for them.
    fn endpoint_descriptor(&self, entity_type: &str) -> AppResult<&EntityDescriptor> {
        let desc = self.schema.descriptor(entity_type)?;
        if desc.meta.inline_only {
            return Err(AppError::SchemaError(format!(
                "'{}' is inline-only and has no endpoints of its own",
                entity_type
            )));
        }
        Ok(desc)
    }

    // ========== Import ==========

    /// Searches an import source. Uses the named importer, or the
    /// type's first one when none is named; returns the slug used so
    /// follow-up creates hit the same source.
    pub async fn import_search(
        &self,
        entity_type: &str,
        importer: Option<&str>,
        q: &str,
    ) -> AppResult<(String, ImportList)> {
        let desc = self.endpoint_descriptor(entity_type)?;
        let slug = importer_slug(desc, entity_type, importer)?;
        let list = self
            .api
            .import_search(&desc.app, entity_type, &slug, q)
            .await?;
        Ok((slug, list))
    }

    pub async fn import_create(
        &self,
        entity_type: &str,
        slug: &str,
        uris: &[String],
    ) -> AppResult<Vec<ImportedEntity>> {
        let desc = self.endpoint_descriptor(entity_type)?;
        let created = self
            .api
            .import_create(&desc.app, entity_type, slug, uris)
            .await?;
        self.forget_candidates(entity_type).await;
        Ok(created)
    }
}

fn importer_slug(
    desc: &EntityDescriptor,
    entity_type: &str,
    importer: Option<&str>,
) -> AppResult<String> {
    if desc.meta.importers.is_empty() {
        return Err(AppError::SchemaError(format!(
            "'{}' has no import sources",
            entity_type
        )));
    }
    match importer {
        Some(name) => desc.meta.importers.get(name).cloned().ok_or_else(|| {
            AppError::SchemaError(format!(
                "'{}' has no import source named '{}'",
                entity_type, name
            ))
        }),
        None => desc
            .meta
            .importers
            .values()
            .next()
            .cloned()
            .ok_or_else(|| {
                AppError::SchemaError(format!("'{}' has no import sources", entity_type))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::SessionStore;
    use crate::config::ServerConfig;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_schema() -> Schema {
        serde_json::from_value(json!({
            "person": {
                "app": "core",
                "fields": {},
                "meta": {
                    "importers": {"Wikidata": "wikidata", "GND": "gnd"}
                },
                "json_schema": {}
            },
            "entity": {
                "app": "core",
                "fields": {},
                "meta": { "abstract": true },
                "json_schema": {}
            },
            "birth": {
                "app": "core",
                "fields": {},
                "meta": { "inline_only": true },
                "json_schema": {}
            }
        }))
        .unwrap()
    }

    async fn service() -> DeskService {
        let dir = tempdir().unwrap();
        let api = ApiClient::new(
            &ServerConfig {
                // Nothing listens here; guarded calls must fail before
                // any request goes out.
                url: "http://127.0.0.1:9".to_string(),
                request_timeout_secs: 1,
            },
            SessionStore::new(dir.path().join("session.json")),
        )
        .unwrap();
        let cache = SummaryCache::open_in_memory().await.unwrap();
        DeskService::new(api, cache, sample_schema(), 10)
    }

    #[tokio::test]
    async fn test_inline_only_types_have_no_endpoints() {
        let service = service().await;
        let err = service.create("birth", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("inline-only"));
        let err = service.list("birth", None).await.unwrap_err();
        assert!(err.to_string().contains("inline-only"));
    }

    #[tokio::test]
    async fn test_abstract_types_cannot_be_created() {
        let service = service().await;
        let err = service.create("entity", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("abstract"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_a_schema_error() {
        let service = service().await;
        let err = service.list("planet", None).await.unwrap_err();
        assert!(matches!(err, AppError::SchemaError(_)));
    }

    #[test]
    fn test_importer_slug_resolution() {
        let schema = sample_schema();
        let person = schema.descriptor("person").unwrap();
        assert_eq!(importer_slug(person, "person", None).unwrap(), "wikidata");
        assert_eq!(
            importer_slug(person, "person", Some("GND")).unwrap(),
            "gnd"
        );
        assert!(importer_slug(person, "person", Some("viaf")).is_err());

        let birth = schema.descriptor("birth").unwrap();
        assert!(importer_slug(birth, "birth", None).is_err());
    }
}
