//! Provider Configuration Store
//!
//! Providers and their model mappings live in a JSON file. Two views of it exist:
//!
//! - the **staged** record, which is whatever was last written by [`ConfigStore::stage`]
//!   and carries `needs_restart` / `staged_at`;
//! - the **active** snapshot, which governs routing and only changes on
//!   [`ConfigStore::commit`].
//!
//! The active snapshot and its [`ModelRegistry`] are published together through an
//! `ArcSwap`, so request handlers read a complete table without taking a lock and a
//! stream that already resolved its route keeps its own `Arc` until it finishes.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::registry::{ModelRegistry, Route};

/// Wire dialect spoken by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// api.openai.com and faithful clones
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    /// Servers that only understand the legacy `max_tokens` field (vLLM, Ollama, ...)
    #[serde(rename = "openai_compatible")]
    OpenAICompatible,
}

/// Upstream request field that carries the completion token limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLimitField {
    MaxCompletionTokens,
    MaxTokens,
}

impl ProviderKind {
    pub fn token_limit_field(&self) -> Option<TokenLimitField> {
        match self {
            ProviderKind::OpenAI => Some(TokenLimitField::MaxCompletionTokens),
            ProviderKind::OpenAICompatible => Some(TokenLimitField::MaxTokens),
        }
    }

    /// Whether the upstream honours `stream_options.include_usage`
    pub fn reports_stream_usage(&self) -> bool {
        matches!(self, ProviderKind::OpenAI)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAI => write!(f, "openai"),
            ProviderKind::OpenAICompatible => write!(f, "openai_compatible"),
        }
    }
}

/// Proxy-facing model name and the upstream model it maps to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMapping {
    pub proxy_name: String,
    pub upstream_name: String,
}

/// One upstream provider as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "new_provider_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<ModelMapping>,
}

fn new_provider_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl ProviderConfig {
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Ordered provider list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl ConfigSnapshot {
    /// Check field validity and global uniqueness of proxy-facing names
    pub fn validate(&self) -> ApiResult<()> {
        let mut provider_ids = HashSet::new();
        let mut proxy_names: HashMap<&str, &str> = HashMap::new();

        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ApiError::config("provider id must not be empty"));
            }
            if !provider_ids.insert(provider.id.as_str()) {
                return Err(ApiError::config(format!(
                    "provider id '{}' is used more than once",
                    provider.id
                )));
            }
            if provider.name.trim().is_empty() {
                return Err(ApiError::config(format!(
                    "provider '{}' must have a name",
                    provider.id
                )));
            }
            validate_base_url(provider)?;
            if provider.api_key.is_empty() {
                return Err(ApiError::config(format!(
                    "provider '{}' must have an api_key",
                    provider.name
                )));
            }

            for mapping in &provider.models {
                if mapping.proxy_name.trim().is_empty() {
                    return Err(ApiError::config(format!(
                        "provider '{}' has a model mapping without a proxy_name",
                        provider.name
                    )));
                }
                if mapping.upstream_name.trim().is_empty() {
                    return Err(ApiError::config(format!(
                        "model '{}' must have an upstream_name",
                        mapping.proxy_name
                    )));
                }
                if let Some(owner) = proxy_names.insert(&mapping.proxy_name, &provider.name) {
                    return Err(ApiError::config(format!(
                        "model name '{}' is mapped by both '{}' and '{}'",
                        mapping.proxy_name, owner, provider.name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_base_url(provider: &ProviderConfig) -> ApiResult<()> {
    if provider.base_url.trim().is_empty() {
        return Err(ApiError::config(format!(
            "provider '{}' must have a base_url",
            provider.name
        )));
    }
    let url = url::Url::parse(&provider.base_url).map_err(|e| {
        ApiError::config(format!(
            "provider '{}' has an invalid base_url: {}",
            provider.name, e
        ))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::config(format!(
            "provider '{}' base_url must use http or https",
            provider.name
        )));
    }
    Ok(())
}

/// The persisted record: snapshot plus restart bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagedConfig {
    #[serde(flatten)]
    pub config: ConfigSnapshot,
    #[serde(default)]
    pub needs_restart: bool,
    #[serde(default)]
    pub staged_at: Option<i64>,
}

/// Snapshot currently used for routing
#[derive(Debug)]
pub struct ActiveConfig {
    pub snapshot: ConfigSnapshot,
    pub registry: ModelRegistry,
}

// ============================================================================
// Views and staging input
// ============================================================================

/// Provider as returned to admin clients, credential masked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderView {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: String,
    pub models: Vec<ModelMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigView {
    pub providers: Vec<ProviderView>,
    pub needs_restart: bool,
    pub staged_at: Option<i64>,
}

impl ConfigView {
    fn new(snapshot: &ConfigSnapshot, needs_restart: bool, staged_at: Option<i64>) -> Self {
        Self {
            providers: snapshot
                .providers
                .iter()
                .map(|p| ProviderView {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    kind: p.kind,
                    base_url: p.base_url.clone(),
                    api_key: mask_secret(&p.api_key),
                    models: p.models.clone(),
                })
                .collect(),
            needs_restart,
            staged_at,
        }
    }
}

/// Provider as submitted for staging; `id` and `api_key` may be omitted
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelMapping>,
}

/// Full replacement provider list
#[derive(Debug, Clone, Deserialize)]
pub struct StageRequest {
    #[serde(default)]
    pub providers: Vec<ProviderInput>,
}

const MASK_PREFIX: &str = "****";

/// Hide all but the last four characters of a credential
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", MASK_PREFIX, tail)
    } else {
        MASK_PREFIX.to_string()
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct ConfigStore {
    path: PathBuf,
    active: ArcSwap<ActiveConfig>,
    /// Staged record; its lock also serialises stage and commit
    staged: Mutex<StagedConfig>,
}

impl ConfigStore {
    /// Load the persisted record, creating an empty one when the file is missing,
    /// and adopt it as the active snapshot.
    pub fn open(path: impl Into<PathBuf>) -> ApiResult<Self> {
        let path = path.into();

        if !path.exists() {
            log::info!("No configuration at {}, creating an empty one", path.display());
            write_record(&path, &StagedConfig::default())?;
        }

        let mut record = read_record(&path)?;
        record.config.validate()?;
        let registry = ModelRegistry::build(&record.config)?;
        record.needs_restart = false;

        log::info!(
            "Loaded {} provider(s) and {} model mapping(s) from {}",
            record.config.providers.len(),
            registry.len(),
            path.display()
        );

        Ok(Self {
            path,
            active: ArcSwap::from_pointee(ActiveConfig {
                snapshot: record.config.clone(),
                registry,
            }),
            staged: Mutex::new(record),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current routing snapshot. Never blocks.
    pub fn active(&self) -> Arc<ActiveConfig> {
        self.active.load_full()
    }

    pub fn staged(&self) -> StagedConfig {
        self.staged.lock().clone()
    }

    pub fn resolve(&self, model: &str) -> ApiResult<Route> {
        self.active.load().registry.resolve(model)
    }

    pub fn active_view(&self) -> ConfigView {
        let (needs_restart, staged_at) = {
            let staged = self.staged.lock();
            (staged.needs_restart, staged.staged_at)
        };
        ConfigView::new(&self.active().snapshot, needs_restart, staged_at)
    }

    pub fn staged_view(&self) -> ConfigView {
        let staged = self.staged.lock();
        ConfigView::new(&staged.config, staged.needs_restart, staged.staged_at)
    }

    /// Validate and persist a replacement provider list. Routing is unaffected
    /// until [`commit`](Self::commit).
    pub fn stage(&self, request: StageRequest) -> ApiResult<ConfigView> {
        let mut staged = self.staged.lock();

        let known_secrets: HashMap<&str, &str> = staged
            .config
            .providers
            .iter()
            .map(|p| (p.id.as_str(), p.api_key.as_str()))
            .collect();

        let mut providers = Vec::with_capacity(request.providers.len());
        for input in request.providers {
            let id = input
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(new_provider_id);
            let api_key = resolve_secret(input.api_key, known_secrets.get(id.as_str()).copied())
                .ok_or_else(|| {
                    ApiError::config(format!(
                        "provider '{}' must have an api_key; a masked key only refers to a stored one",
                        input.name
                    ))
                })?;
            providers.push(ProviderConfig {
                id,
                name: input.name,
                kind: input.kind,
                base_url: input.base_url,
                api_key,
                models: input.models,
            });
        }

        let config = ConfigSnapshot { providers };
        config.validate()?;

        let record = StagedConfig {
            config,
            needs_restart: true,
            staged_at: Some(chrono::Utc::now().timestamp()),
        };
        write_record(&self.path, &record)?;

        log::info!(
            "Staged {} provider(s); restart required to apply",
            record.config.providers.len()
        );

        *staged = record;
        Ok(ConfigView::new(
            &staged.config,
            staged.needs_restart,
            staged.staged_at,
        ))
    }

    /// Reload the persisted record and make it the active snapshot.
    ///
    /// On any failure the previous snapshot stays active and the error is returned.
    pub fn commit(&self) -> ApiResult<ConfigView> {
        let mut staged = self.staged.lock();

        let mut record = read_record(&self.path)?;
        record.config.validate()?;
        let registry = ModelRegistry::build(&record.config)?;

        record.needs_restart = false;
        write_record(&self.path, &record)?;

        self.active.store(Arc::new(ActiveConfig {
            snapshot: record.config.clone(),
            registry,
        }));

        log::info!(
            "Applied configuration: {} provider(s), {} routable model(s)",
            record.config.providers.len(),
            self.active.load().registry.len()
        );

        *staged = record;
        Ok(ConfigView::new(
            &staged.config,
            staged.needs_restart,
            staged.staged_at,
        ))
    }
}

/// Keep the stored secret when the client sent nothing or echoed the mask back.
/// A masked value that matches no stored secret is never taken as a credential.
fn resolve_secret(submitted: Option<String>, stored: Option<&str>) -> Option<String> {
    match (submitted, stored) {
        (Some(key), Some(stored)) if key == mask_secret(stored) => Some(stored.to_string()),
        (Some(key), _) if key.starts_with(MASK_PREFIX) => None,
        (Some(key), _) if !key.is_empty() => Some(key),
        (_, Some(stored)) => Some(stored.to_string()),
        _ => None,
    }
}

fn read_record(path: &Path) -> ApiResult<StagedConfig> {
    let raw = fs::read_to_string(path).map_err(|e| {
        ApiError::Internal(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        ApiError::config(format!(
            "persisted configuration at {} is unreadable: {}",
            path.display(),
            e
        ))
    })
}

fn write_record(path: &Path, record: &StagedConfig) -> ApiResult<()> {
    let io_err =
        |e: std::io::Error| ApiError::Internal(format!("failed to write {}: {}", path.display(), e));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let serialized = serde_json::to_string_pretty(record)
        .map_err(|e| ApiError::Internal(format!("failed to serialize configuration: {}", e)))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, serialized).map_err(io_err)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage_request(value: serde_json::Value) -> StageRequest {
        serde_json::from_value(value).unwrap()
    }

    fn sonnet_payload() -> serde_json::Value {
        json!({
            "providers": [{
                "id": "p1",
                "name": "OpenAI",
                "base_url": "https://api.openai.com/v1",
                "api_key": "sk-test-123456789",
                "models": [{"proxy_name": "claude-sonnet", "upstream_name": "gpt-4.1"}]
            }]
        })
    }

    fn open_store(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::open(dir.path().join("config").join("settings.json")).unwrap()
    }

    #[test]
    fn test_open_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        assert!(store.path().exists());
        assert!(store.active().snapshot.providers.is_empty());
        assert!(!store.staged().needs_restart);
    }

    #[test]
    fn test_stage_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let staged = store.stage(stage_request(sonnet_payload())).unwrap();
        assert!(staged.needs_restart);
        assert!(staged.staged_at.is_some());

        let persisted: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(persisted["providers"][0]["api_key"], "sk-test-123456789");
        assert_eq!(persisted["needs_restart"], true);

        // staging leaves routing untouched
        assert!(matches!(
            store.resolve("claude-sonnet"),
            Err(ApiError::NotFound(_))
        ));

        let applied = store.commit().unwrap();
        assert!(!applied.needs_restart);
        let route = store.resolve("claude-sonnet").unwrap();
        assert_eq!(route.upstream_model, "gpt-4.1");
        assert_eq!(route.provider.api_key, "sk-test-123456789");
    }

    #[test]
    fn test_duplicate_model_across_providers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.stage(stage_request(sonnet_payload())).unwrap();
        store.commit().unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        let err = store
            .stage(stage_request(json!({
                "providers": [
                    {"id": "p1", "name": "P1", "base_url": "https://a.example.com/v1",
                     "api_key": "k1", "models": [{"proxy_name": "m1", "upstream_name": "up1"}]},
                    {"id": "p2", "name": "P2", "base_url": "https://b.example.com/v1",
                     "api_key": "k2", "models": [{"proxy_name": "m1", "upstream_name": "up2"}]}
                ]
            })))
            .unwrap_err();

        assert!(matches!(err, ApiError::ConfigValidation(_)));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
        assert!(store.resolve("claude-sonnet").is_ok());
        assert!(!store.staged().needs_restart);
    }

    #[test]
    fn test_invalid_fields_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let cases = [
            json!({"providers": [{"name": "P", "base_url": "", "api_key": "k", "models": []}]}),
            json!({"providers": [{"name": "P", "base_url": "ftp://x", "api_key": "k", "models": []}]}),
            json!({"providers": [{"name": "P", "base_url": "https://x", "api_key": "k",
                   "models": [{"proxy_name": " ", "upstream_name": "u"}]}]}),
            json!({"providers": [{"name": "P", "base_url": "https://x", "models": []}]}),
        ];
        for case in cases {
            let err = store.stage(stage_request(case.clone())).unwrap_err();
            assert!(matches!(err, ApiError::ConfigValidation(_)), "{}", case);
        }
    }

    #[test]
    fn test_commit_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.stage(stage_request(sonnet_payload())).unwrap();

        let first = store.commit().unwrap();
        let snapshot_after_first = store.active().snapshot.clone();
        let second = store.commit().unwrap();

        assert_eq!(first, second);
        assert!(!second.needs_restart);
        assert_eq!(store.active().snapshot, snapshot_after_first);
    }

    #[test]
    fn test_commit_of_corrupt_file_keeps_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.stage(stage_request(sonnet_payload())).unwrap();
        store.commit().unwrap();

        fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.commit(), Err(ApiError::ConfigValidation(_))));
        assert_eq!(
            store.resolve("claude-sonnet").unwrap().upstream_model,
            "gpt-4.1"
        );

        // externally written duplicates are caught as well
        fs::write(
            store.path(),
            json!({"providers": [
                {"id": "a", "name": "A", "base_url": "https://a.example.com", "api_key": "k",
                 "models": [{"proxy_name": "x", "upstream_name": "1"}]},
                {"id": "b", "name": "B", "base_url": "https://b.example.com", "api_key": "k",
                 "models": [{"proxy_name": "x", "upstream_name": "2"}]}
            ]})
            .to_string(),
        )
        .unwrap();
        assert!(store.commit().is_err());
        assert!(store.resolve("claude-sonnet").is_ok());
        assert!(store.resolve("x").is_err());
    }

    #[test]
    fn test_views_mask_secrets_and_restage_keeps_them() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.stage(stage_request(sonnet_payload())).unwrap();
        store.commit().unwrap();

        let view = store.active_view();
        assert_eq!(view.providers[0].api_key, "****6789");

        // echo the view back with a new mapping, as an admin console would
        let mut echoed = serde_json::to_value(&view).unwrap();
        echoed["providers"][0]["models"]
            .as_array_mut()
            .unwrap()
            .push(json!({"proxy_name": "claude-haiku", "upstream_name": "gpt-4.1-mini"}));
        store.stage(stage_request(echoed)).unwrap();
        store.commit().unwrap();

        let route = store.resolve("claude-haiku").unwrap();
        assert_eq!(route.provider.api_key, "sk-test-123456789");
    }

    #[test]
    fn test_masked_key_without_stored_secret_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.stage(stage_request(sonnet_payload())).unwrap();

        // unknown id: nothing to resolve the mask against
        let mut payload = sonnet_payload();
        payload["providers"][0]["id"] = json!("p2");
        payload["providers"][0]["api_key"] = json!("****6789");
        let err = store.stage(stage_request(payload)).unwrap_err();
        assert!(matches!(err, ApiError::ConfigValidation(_)));

        // known id, but the mask belongs to a different key
        let mut payload = sonnet_payload();
        payload["providers"][0]["api_key"] = json!("****0000");
        assert!(store.stage(stage_request(payload)).is_err());

        assert_eq!(store.staged().config.providers[0].api_key, "sk-test-123456789");
    }

    #[test]
    fn test_missing_id_gets_generated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let view = store
            .stage(stage_request(json!({"providers": [{
                "name": "Local", "kind": "openai_compatible",
                "base_url": "http://localhost:8000/v1", "api_key": "none",
                "models": [{"proxy_name": "local", "upstream_name": "qwen"}]
            }]})))
            .unwrap();

        assert_eq!(view.providers[0].id.len(), 32);
        assert_eq!(view.providers[0].kind, ProviderKind::OpenAICompatible);
        assert_eq!(view.providers[0].api_key, "****");
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // a non-empty directory where the record should go makes the rename fail
        let path = dir.path().join("settings.json");
        fs::create_dir_all(path.join("occupied")).unwrap();

        assert!(write_record(&path, &StagedConfig::default()).is_err());
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "****");
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("sk-abcdefgh1234"), "****1234");
    }
}
