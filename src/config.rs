use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::SystemTime,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;

use crate::app_state::AppError;

#[derive(Debug)]
pub enum ValidationError {
    Bounds,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ValidationError::Bounds => "bounds",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ValidationError {}

pub trait ConfigValue:
    'static + Send + Sync + Default + Clone + Serialize + DeserializeOwned
{
    const KEY: &'static str;
    const REQUIRE_RESTART: bool = false;

    fn env_key() -> String {
        format!("SUBLARR_{}", Self::KEY.to_uppercase())
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SettingValue<T> {
    default: T,
    config: Option<T>,
    cli: Option<T>,
    env: Option<T>,
}

#[derive(Debug, Serialize)]
pub struct SerializedSetting {
    require_restart: bool,
    key: String,
    default_value: serde_json::Value,
    config_value: serde_json::Value,
    cli_value: serde_json::Value,
    env_value: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ConfigurationApplyError {
    pub message: String,
    pub key: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ConfigurationApplyResult {
    pub require_restart: bool,
    pub errors: Vec<ConfigurationApplyError>,
}

impl<T: ConfigValue> SettingValue<T> {
    pub fn new(val: T) -> Self {
        let env = std::env::var(T::env_key()).ok().and_then(|val| {
            match serde_plain::from_str(&val) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(
                        found = %val,
                        "Found env value but could not parse it as {}. {e}",
                        type_name::<T>()
                    );
                    None
                }
            }
        });
        Self {
            default: val,
            config: None,
            cli: None,
            env,
        }
    }

    /// Setting value with respect to its source priority
    pub fn customized(&self) -> &T {
        self.cli
            .as_ref()
            .or(self.env.as_ref())
            .or(self.config.as_ref())
            .unwrap_or(&self.default)
    }
}

trait AnySettingValue: 'static + Send + Sync {
    fn key(&self) -> String;
    fn require_restart(&self) -> bool;
    fn type_name(&self) -> &'static str;

    fn customized_value(&self) -> &dyn Any;
    fn config_mut(&mut self) -> &mut dyn Any;
    fn cli_mut(&mut self) -> &mut dyn Any;
    fn reset_config_value(&mut self);

    fn serialize_config(&self) -> Option<toml::Value>;
    fn serialize_response(&self) -> SerializedSetting;

    fn deserialize_toml(&mut self, from: toml::Value) -> Result<(), toml::de::Error>;
    fn deserialize_json(&mut self, from: serde_json::Value) -> Result<(), serde_json::Error>;
}

impl<T: ConfigValue> AnySettingValue for SettingValue<T> {
    fn key(&self) -> String {
        T::KEY.to_string()
    }

    fn require_restart(&self) -> bool {
        T::REQUIRE_RESTART
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn deserialize_toml(&mut self, from: toml::Value) -> Result<(), toml::de::Error> {
        let value = T::deserialize(from)?;
        self.config = Some(value);
        Ok(())
    }

    fn deserialize_json(&mut self, json: serde_json::Value) -> Result<(), serde_json::Error> {
        match json {
            serde_json::Value::Null => {
                self.config = None;
            }
            _ => {
                let value = serde_json::from_value(json)?;
                self.config = Some(value);
            }
        }
        Ok(())
    }

    fn serialize_config(&self) -> Option<toml::Value> {
        let value = self.config.clone();
        Some(toml::Value::try_from(value?).unwrap())
    }

    fn serialize_response(&self) -> SerializedSetting {
        let serialize = |t: Option<&T>| serde_json::to_value(t).unwrap();
        SerializedSetting {
            key: self.key(),
            require_restart: T::REQUIRE_RESTART,
            default_value: serialize(Some(&self.default)),
            config_value: serialize(self.config.as_ref()),
            cli_value: serialize(self.cli.as_ref()),
            env_value: serialize(self.env.as_ref()),
        }
    }

    fn customized_value(&self) -> &dyn Any {
        self.customized()
    }

    fn config_mut(&mut self) -> &mut dyn Any {
        &mut self.config
    }

    fn cli_mut(&mut self) -> &mut dyn Any {
        &mut self.cli
    }

    fn reset_config_value(&mut self) {
        self.config = None;
    }
}

pub static CONFIG: LazyLock<ConfigStore> = LazyLock::new(ConfigStore::construct);

#[derive(Clone)]
pub struct ConfigStore {
    settings: watch::Sender<HashMap<TypeId, Box<dyn AnySettingValue>>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").finish()
    }
}

impl ConfigStore {
    pub fn construct() -> Self {
        let store = Self::new();

        store.register_value::<Port>();
        store.register_value::<StandaloneFolders>();
        store.register_value::<ScanWorkers>();
        store.register_value::<SearchWorkers>();
        store.register_value::<SearchQueueDepth>();
        store.register_value::<MaxAttempts>();
        store.register_value::<UpgradeMargin>();
        store.register_value::<FullScanEvery>();
        store.register_value::<WatcherDebounceSeconds>();
        store.register_value::<CollaboratorTimeoutSeconds>();
        store.register_value::<CircuitBreakerCooldownSeconds>();
        store.register_value::<EnabledProviders>();
        store.register_value::<ProviderScoreModifiers>();
        store.register_value::<ForcedFilenamePatterns>();
        store.register_value::<TranslationBackendName>();
        store.register_value::<OpenAiBaseUrl>();
        store.register_value::<OpenAiKey>();
        store.register_value::<OpenAiModel>();
        store.register_value::<TranslationBatchSize>();
        store.register_value::<TranslationWorkers>();
        store.register_value::<TmSimilarityThreshold>();
        store.register_value::<Glossary>();
        store.register_value::<MetadataCacheTtlSeconds>();
        store.register_value::<HookTimeoutSeconds>();
        store.register_value::<WebhookRetries>();
        store.register_value::<DispatcherWorkers>();
        store.register_value::<ScanIntervalSeconds>();
        store.register_value::<SearchIntervalSeconds>();
        store.register_value::<HealthIntervalSeconds>();
        store.register_value::<DedupIntervalSeconds>();
        store.register_value::<CleanupIntervalSeconds>();
        store.register_value::<BackupIntervalSeconds>();
        store.register_value::<DedupRoots>();
        store.register_value::<NotificationServices>();
        store.register_value::<LogLevel>();

        store
    }

    pub fn new() -> Self {
        let (settings_tx, _) = watch::channel(HashMap::new());
        Self {
            settings: settings_tx,
        }
    }

    pub fn register_value<T: ConfigValue>(&self) {
        let default = T::default();
        self.settings.send_modify(|setting| {
            setting.insert(TypeId::of::<T>(), Box::new(SettingValue::new(default)));
        });
    }

    pub fn get_value<T: ConfigValue>(&self) -> T {
        let settings = self.settings.borrow();
        let setting = settings
            .get(&TypeId::of::<T>())
            .unwrap_or_else(|| panic!("unregistered setting type {}", type_name::<T>()));
        let t: &T = setting.customized_value().downcast_ref().unwrap();
        t.clone()
    }

    pub fn update_value<T: ConfigValue>(&self, new: T) {
        self.settings.send_modify(|settings| {
            let setting = settings
                .get_mut(&TypeId::of::<T>())
                .unwrap_or_else(|| panic!("unregistered setting type {}", type_name::<T>()));
            let value = setting.config_mut();
            let value = value.downcast_mut().unwrap();
            *value = Some(new);
        });
    }

    pub fn construct_table(&self) -> toml::Table {
        let mut table = toml::Table::new();
        let settings = self.settings.borrow();
        for setting in settings.values() {
            let Some(value) = setting.serialize_config() else {
                continue;
            };
            table.insert(setting.key(), value);
        }
        table
    }

    pub fn json(&self) -> Vec<SerializedSetting> {
        let settings = self.settings.borrow();
        let mut out = Vec::with_capacity(settings.len());
        for setting in settings.values() {
            out.push(setting.serialize_response());
        }
        out
    }

    pub fn apply_toml_settings(&self, table: toml::Table) {
        self.settings.send_modify(|settings| {
            for setting in settings.values_mut() {
                let key = setting.key();
                if let Some(val) = table.get(&key).cloned() {
                    if let Err(err) = setting.deserialize_toml(val) {
                        tracing::warn!(
                            "Failed to deserialize toml value for {}: {err}",
                            setting.type_name()
                        )
                    };
                }
            }
        });
    }

    pub fn apply_json(
        &self,
        value: serde_json::Value,
    ) -> Result<ConfigurationApplyResult, AppError> {
        let mut result = ConfigurationApplyResult::default();
        let obj = match value {
            serde_json::Value::Object(obj) => obj,
            _ => return Err(AppError::bad_request("Provided json must be object")),
        };

        self.settings.send_modify(|settings| {
            for setting in settings.values_mut() {
                if let Some(val) = obj.get(&setting.key()).cloned() {
                    match setting.deserialize_json(val) {
                        Ok(_) if setting.require_restart() => result.require_restart = true,
                        Ok(_) => (),
                        Err(err) => {
                            tracing::warn!(
                                "Failed to deserialize json value for {}: {err}",
                                setting.type_name()
                            );
                            result.errors.push(ConfigurationApplyError {
                                key: setting.key(),
                                message: err.to_string(),
                            });
                        }
                    };
                }
            }
        });
        Ok(result)
    }

    pub fn apply_cli_value<T: ConfigValue>(&self, value: T) {
        self.settings.send_modify(|settings| {
            let setting = settings.get_mut(&TypeId::of::<T>()).unwrap();
            let setting = setting.cli_mut();
            let val = setting.downcast_mut().unwrap();
            *val = Some(value);
        });
    }

    pub fn reset_config_values(&self) {
        self.settings.send_modify(|settings| {
            for setting in settings.values_mut() {
                setting.reset_config_value();
            }
        });
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConfigFile;

impl ConfigFile {
    pub async fn open_and_read() -> anyhow::Result<toml::Table> {
        let path = &APP_RESOURCES.config_path;
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&contents)?)
    }

    pub async fn write_current() -> anyhow::Result<()> {
        let path = &APP_RESOURCES.config_path;
        let table = CONFIG.construct_table();
        tokio::fs::write(path, toml::to_string_pretty(&table)?).await?;
        Ok(())
    }
}

// Settings

/// The network port on which the server listens for incoming connections
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct Port(pub u16);

impl Default for Port {
    fn default() -> Self {
        Self(6767)
    }
}

impl ConfigValue for Port {
    const KEY: &'static str = "port";
    const REQUIRE_RESTART: bool = true;
}

/// Directories watched and scanned by the standalone subsystem
#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct StandaloneFolders(pub Vec<PathBuf>);

impl ConfigValue for StandaloneFolders {
    const KEY: &'static str = "standalone_folders";
}

impl StandaloneFolders {
    pub fn add(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        if !self.0.contains(&path) {
            self.0.push(path);
        }
    }

    pub fn existing(&self) -> Vec<&PathBuf> {
        self.0
            .iter()
            .filter(|path| {
                let exists = path.try_exists().unwrap_or(false);
                if !exists {
                    tracing::warn!(
                        "Failed to check existence of standalone directory: {}",
                        path.display()
                    );
                }
                exists
            })
            .collect()
    }
}

/// Worker count for the wanted scanner's file inspection pool
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct ScanWorkers(pub usize);

impl Default for ScanWorkers {
    fn default() -> Self {
        Self(4)
    }
}

impl ConfigValue for ScanWorkers {
    const KEY: &'static str = "scan_workers";
}

/// Number of wanted items processed concurrently by the searcher
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct SearchWorkers(pub usize);

impl Default for SearchWorkers {
    fn default() -> Self {
        Self(4)
    }
}

impl ConfigValue for SearchWorkers {
    const KEY: &'static str = "search_workers";
}

/// Items claimed per searcher cycle, per worker
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct SearchQueueDepth(pub usize);

impl Default for SearchQueueDepth {
    fn default() -> Self {
        Self(16)
    }
}

impl ConfigValue for SearchQueueDepth {
    const KEY: &'static str = "search_queue_depth";
}

/// Attempts before a wanted item is marked failed
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct MaxAttempts(pub u32);

impl Default for MaxAttempts {
    fn default() -> Self {
        Self(5)
    }
}

impl ConfigValue for MaxAttempts {
    const KEY: &'static str = "max_attempts";
}

/// A replacement subtitle must beat the existing score by this margin
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct UpgradeMargin(pub i64);

impl Default for UpgradeMargin {
    fn default() -> Self {
        Self(50)
    }
}

impl ConfigValue for UpgradeMargin {
    const KEY: &'static str = "upgrade_margin";
}

/// Every Nth scheduled scan cycle is a full scan instead of an incremental one
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct FullScanEvery(pub u32);

impl Default for FullScanEvery {
    fn default() -> Self {
        Self(6)
    }
}

impl ConfigValue for FullScanEvery {
    const KEY: &'static str = "full_scan_every";
}

/// Seconds the watcher waits after the last filesystem event for a path
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct WatcherDebounceSeconds(pub u64);

impl Default for WatcherDebounceSeconds {
    fn default() -> Self {
        Self(5)
    }
}

impl ConfigValue for WatcherDebounceSeconds {
    const KEY: &'static str = "watcher_debounce_seconds";
}

/// Deadline for every external collaborator call
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct CollaboratorTimeoutSeconds(pub u64);

impl Default for CollaboratorTimeoutSeconds {
    fn default() -> Self {
        Self(30)
    }
}

impl ConfigValue for CollaboratorTimeoutSeconds {
    const KEY: &'static str = "collaborator_timeout_seconds";
}

/// How long an opened provider circuit stays open
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct CircuitBreakerCooldownSeconds(pub u64);

impl Default for CircuitBreakerCooldownSeconds {
    fn default() -> Self {
        Self(300)
    }
}

impl ConfigValue for CircuitBreakerCooldownSeconds {
    const KEY: &'static str = "circuit_breaker_cooldown_seconds";
}

/// Providers consulted by the searcher; empty means all registered providers
#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct EnabledProviders(pub Vec<String>);

impl ConfigValue for EnabledProviders {
    const KEY: &'static str = "enabled_providers";
}

/// Additive per-provider score modifier, clamped to [-100, 100]
#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct ProviderScoreModifiers(pub HashMap<String, i64>);

impl ConfigValue for ProviderScoreModifiers {
    const KEY: &'static str = "provider_score_modifiers";
}

/// Extra filename regexes that classify a candidate as forced
#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct ForcedFilenamePatterns(pub Vec<String>);

impl ConfigValue for ForcedFilenamePatterns {
    const KEY: &'static str = "forced_filename_patterns";
}

/// Selected translation backend
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Serialize)]
pub struct TranslationBackendName(pub String);

impl Default for TranslationBackendName {
    fn default() -> Self {
        Self("openai".to_string())
    }
}

impl ConfigValue for TranslationBackendName {
    const KEY: &'static str = "translation_backend";
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Serialize)]
pub struct OpenAiBaseUrl(pub String);

impl Default for OpenAiBaseUrl {
    fn default() -> Self {
        Self("https://api.openai.com/v1".to_string())
    }
}

impl ConfigValue for OpenAiBaseUrl {
    const KEY: &'static str = "openai_base_url";
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Default, Serialize)]
pub struct OpenAiKey(pub Option<String>);

impl ConfigValue for OpenAiKey {
    const KEY: &'static str = "openai_key";
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Serialize)]
pub struct OpenAiModel(pub String);

impl Default for OpenAiModel {
    fn default() -> Self {
        Self("gpt-4o-mini".to_string())
    }
}

impl ConfigValue for OpenAiModel {
    const KEY: &'static str = "openai_model";
}

/// Lines per translation batch
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct TranslationBatchSize(pub usize);

impl Default for TranslationBatchSize {
    fn default() -> Self {
        Self(40)
    }
}

impl ConfigValue for TranslationBatchSize {
    const KEY: &'static str = "translation_batch_size";
}

/// Concurrent batches in flight against the translation backend
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct TranslationWorkers(pub usize);

impl Default for TranslationWorkers {
    fn default() -> Self {
        Self(2)
    }
}

impl ConfigValue for TranslationWorkers {
    const KEY: &'static str = "translation_workers";
}

/// Similarity threshold for fuzzy translation-memory lookups. 1.0 = exact only
#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
pub struct TmSimilarityThreshold(pub f64);

impl Default for TmSimilarityThreshold {
    fn default() -> Self {
        Self(1.0)
    }
}

impl ConfigValue for TmSimilarityThreshold {
    const KEY: &'static str = "tm_similarity_threshold";

    fn validate(&self) -> Result<(), ValidationError> {
        if self.0 < 0.0 || self.0 > 1.0 {
            return Err(ValidationError::Bounds);
        }
        Ok(())
    }
}

/// Term substitutions applied before translation
#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct Glossary(pub HashMap<String, String>);

impl ConfigValue for Glossary {
    const KEY: &'static str = "glossary";
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct MetadataCacheTtlSeconds(pub i64);

impl Default for MetadataCacheTtlSeconds {
    fn default() -> Self {
        Self(86_400)
    }
}

impl ConfigValue for MetadataCacheTtlSeconds {
    const KEY: &'static str = "metadata_cache_ttl_seconds";
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct HookTimeoutSeconds(pub u64);

impl Default for HookTimeoutSeconds {
    fn default() -> Self {
        Self(30)
    }
}

impl ConfigValue for HookTimeoutSeconds {
    const KEY: &'static str = "hook_timeout_seconds";
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct WebhookRetries(pub u32);

impl Default for WebhookRetries {
    fn default() -> Self {
        Self(3)
    }
}

impl ConfigValue for WebhookRetries {
    const KEY: &'static str = "webhook_retries";
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct DispatcherWorkers(pub usize);

impl Default for DispatcherWorkers {
    fn default() -> Self {
        Self(4)
    }
}

impl ConfigValue for DispatcherWorkers {
    const KEY: &'static str = "dispatcher_workers";
    const REQUIRE_RESTART: bool = true;
}

macro_rules! interval_setting {
    ($name:ident, $key:literal, $default:literal) => {
        #[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
        pub struct $name(pub u64);

        impl Default for $name {
            fn default() -> Self {
                Self($default)
            }
        }

        impl ConfigValue for $name {
            const KEY: &'static str = $key;
        }
    };
}

interval_setting!(ScanIntervalSeconds, "scan_interval_seconds", 3600);
interval_setting!(SearchIntervalSeconds, "search_interval_seconds", 900);
interval_setting!(HealthIntervalSeconds, "health_interval_seconds", 86400);
interval_setting!(DedupIntervalSeconds, "dedup_interval_seconds", 86400);
interval_setting!(CleanupIntervalSeconds, "cleanup_interval_seconds", 86400);
interval_setting!(BackupIntervalSeconds, "backup_interval_seconds", 604800);

/// Directories scanned by the deduplication engine; defaults to standalone folders
#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct DedupRoots(pub Vec<PathBuf>);

impl ConfigValue for DedupRoots {
    const KEY: &'static str = "dedup_roots";
}

/// Notification service endpoints keyed by the delivery implementation's
/// service name.
#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct NotificationServices(pub HashMap<String, String>);

impl ConfigValue for NotificationServices {
    const KEY: &'static str = "notification_services";
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Serialize)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

impl ConfigValue for LogLevel {
    const KEY: &'static str = "log_level";
    const REQUIRE_RESTART: bool = true;
}

#[derive(Debug, Clone, Serialize)]
pub struct AppResources {
    #[serde(skip)]
    pub start_time: SystemTime,
    pub database_path: PathBuf,
    #[serde(skip)]
    pub config_path: PathBuf,
    pub backup_path: PathBuf,
    pub log_path: PathBuf,
    pub app_version: &'static str,
}

pub static APP_RESOURCES: LazyLock<AppResources> = LazyLock::new(AppResources::new);

impl AppResources {
    pub const APP_NAME: &'static str = "sublarr";

    fn data_storage() -> PathBuf {
        if Self::is_prod() {
            dirs::data_local_dir()
                .expect("target to have data directory")
                .join(Self::APP_NAME)
        } else {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        }
    }

    pub fn is_prod() -> bool {
        !cfg!(debug_assertions)
    }

    pub fn default_config_path() -> PathBuf {
        if Self::is_prod() {
            dirs::config_local_dir()
                .expect("target supports config dir")
                .join(Self::APP_NAME)
        } else {
            Self::data_storage()
        }
        .join("configuration.toml")
    }

    fn database_directory() -> PathBuf {
        Self::data_storage().join("db")
    }

    fn database() -> PathBuf {
        Self::database_directory().join("sublarr.sqlite")
    }

    fn backups() -> PathBuf {
        Self::data_storage().join("backups")
    }

    pub fn log() -> PathBuf {
        Self::data_storage().join("log.log")
    }

    pub fn initiate() -> Result<(), std::io::Error> {
        use std::fs;
        fs::create_dir_all(Self::database_directory())?;
        fs::create_dir_all(Self::backups())?;
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::database())?;
        Ok(())
    }

    pub fn new() -> Self {
        let start_time = SystemTime::now();
        let config_path = Self::default_config_path();
        let database_path = Self::database();
        let backup_path = Self::backups();
        let log_path = Self::log();
        let app_version = std::env!("CARGO_PKG_VERSION");

        tracing::debug!(path = %config_path.display(), "Selected config path");
        tracing::debug!(path = %database_path.display(), "Selected database path");
        tracing::debug!(path = %backup_path.display(), "Selected backup path");

        Self {
            start_time,
            config_path,
            database_path,
            backup_path,
            log_path,
            app_version,
        }
    }
}

impl Default for AppResources {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {

    use super::{ConfigStore, MaxAttempts, Port};

    const TEST_TOML_CONFIG: &str = r#"
port = 8000
max_attempts = 9
    "#;

    #[test]
    fn setting_store() {
        let store = ConfigStore::construct();
        let mut port = Port::default();
        let stored_port: Port = store.get_value();
        assert_eq!(port, stored_port);
        port = Port(8000);
        store.update_value(port);
        let stored_port: Port = store.get_value();
        assert_eq!(port, stored_port);
    }

    #[test]
    fn apply_settings() {
        let store = ConfigStore::construct();
        let port: Port = store.get_value();
        let attempts: MaxAttempts = store.get_value();
        assert_eq!(port.0, Port::default().0);
        assert_eq!(attempts.0, MaxAttempts::default().0);
        let toml = toml::from_str(TEST_TOML_CONFIG).unwrap();
        store.apply_toml_settings(toml);
        let port: Port = store.get_value();
        let attempts: MaxAttempts = store.get_value();
        assert_eq!(port.0, 8000);
        assert_eq!(attempts.0, 9);
    }

    #[test]
    fn unset_setting() {
        let store = ConfigStore::construct();
        let port: Port = store.get_value();
        assert_eq!(port.0, Port::default().0);
        let config_set = serde_json::json!({ "port": 7355 });
        store.apply_json(config_set).unwrap();
        let port: Port = store.get_value();
        assert_eq!(port.0, 7355);
        let config_unset = serde_json::json!({"port": null });
        store.apply_json(config_unset).unwrap();
        let port: Port = store.get_value();
        assert_eq!(port.0, Port::default().0);
    }
}
