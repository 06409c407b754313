//! The settings document and where it lives
//!
//! Settings are a flat JSON object. Over time the credential fields have been
//! written under several spellings. Reads walk an ordered list of candidate
//! keys per field, with the standardized upper-snake key first. Writes always
//! use the standardized key and drop the older spellings.

use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs::OpenOptions;

use super::CredentialField;

/// An error reading or writing settings
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings could not be read or written
    #[error("settings i/o failed")]
    Io(#[from] io::Error),
    /// The settings are not valid JSON
    #[error("settings are not valid JSON")]
    Json(#[from] serde_json::Error),
    /// The settings are valid JSON but not an object
    #[error("settings must be a JSON object")]
    NotAnObject,
}

impl CredentialField {
    /// Candidate settings keys, in precedence order
    pub fn settings_keys(self) -> &'static [&'static str] {
        match self {
            CredentialField::ClientId => &[
                "PINGONE_CLIENT_ID",
                "apiClientId",
                "clientId",
                "client_id",
                "api-client-id",
                "client-id",
            ],
            CredentialField::ClientSecret => &[
                "PINGONE_CLIENT_SECRET",
                "apiSecret",
                "clientSecret",
                "client_secret",
                "api-secret",
                "client-secret",
            ],
            CredentialField::EnvironmentId => &[
                "PINGONE_ENVIRONMENT_ID",
                "environmentId",
                "environment_id",
                "environment-id",
            ],
            CredentialField::Region => &["PINGONE_REGION", "region"],
        }
    }

    /// The standardized settings key
    pub fn standard_key(self) -> &'static str {
        self.settings_keys()[0]
    }
}

/// A settings document
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    values: Map<String, Value>,
}

impl Settings {
    /// An empty settings document
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self, SettingsError> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            _ => Err(SettingsError::NotAnObject),
        }
    }

    /// Parses a JSON document
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Returns `true` if the document holds no keys at all
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The raw JSON object
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// The first non-blank string value among the field's candidate keys
    pub fn lookup(&self, field: CredentialField) -> Option<&str> {
        field
            .settings_keys()
            .iter()
            .filter_map(|key| self.values.get(*key))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|v| !v.is_empty())
    }

    /// Stores a field under its standardized key, dropping older spellings
    pub fn set(&mut self, field: CredentialField, value: impl Into<String>) {
        for key in &field.settings_keys()[1..] {
            self.values.remove(*key);
        }
        self.values
            .insert(field.standard_key().to_owned(), Value::String(value.into()));
    }

    /// A copy with every credential field moved to its standardized key
    ///
    /// Keys that are not credential fields are kept as they are.
    pub fn normalized(&self) -> Settings {
        let mut out = self.clone();
        for field in CredentialField::ALL {
            if let Some(value) = self.lookup(field) {
                out.set(field, value);
            }
        }
        out
    }

    /// Serializes the document as pretty-printed JSON
    pub fn to_json_pretty(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(&self.values)?)
    }
}

/// Somewhere settings are kept
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Loads the settings
    ///
    /// Returns `Ok(None)` when there are no settings at all.
    async fn load(&self) -> Result<Option<Settings>, SettingsError>;

    /// Replaces the stored settings
    async fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

#[async_trait]
impl<S: SettingsSource + ?Sized> SettingsSource for Arc<S> {
    async fn load(&self) -> Result<Option<Settings>, SettingsError> {
        (**self).load().await
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        (**self).save(settings).await
    }
}

/// Settings kept in a JSON file on the local filesystem
#[derive(Clone, Debug)]
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    /// Settings stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file's location
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl SettingsSource for FileSettings {
    async fn load(&self) -> Result<Option<Settings>, SettingsError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no settings file");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if data.trim().is_empty() {
            return Ok(None);
        }

        let settings = Settings::from_json(&data)?;
        Ok(Some(settings).filter(|s| !s.is_empty()))
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = settings.to_json_pretty()?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;

        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

/// Settings held in memory
///
/// Clones share the same document.
#[derive(Clone, Debug, Default)]
pub struct InMemorySettings {
    settings: Arc<Mutex<Option<Settings>>>,
}

impl InMemorySettings {
    /// An in-memory store starting with `settings`
    pub fn new(settings: Option<Settings>) -> Self {
        Self {
            settings: Arc::new(Mutex::new(settings)),
        }
    }

    /// The currently stored document
    pub fn current(&self) -> Option<Settings> {
        self.settings.lock().clone()
    }

    /// Replaces the stored document
    pub fn replace(&self, settings: Option<Settings>) {
        *self.settings.lock() = settings;
    }
}

#[async_trait]
impl SettingsSource for InMemorySettings {
    async fn load(&self) -> Result<Option<Settings>, SettingsError> {
        Ok(self.current().filter(|s| !s.is_empty()))
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        self.replace(Some(settings.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn standardized_key_wins_over_legacy_spellings() {
        let settings = Settings::from_value(json!({
            "client_id": "legacy",
            "PINGONE_CLIENT_ID": "standard",
            "apiClientId": "camel",
        }))
        .unwrap();

        assert_eq!(settings.lookup(CredentialField::ClientId), Some("standard"));
    }

    #[test]
    fn lookup_falls_through_blank_and_non_string_values() {
        let settings = Settings::from_value(json!({
            "PINGONE_ENVIRONMENT_ID": "   ",
            "environmentId": 42,
            "environment-id": "env-from-hyphenated",
        }))
        .unwrap();

        assert_eq!(
            settings.lookup(CredentialField::EnvironmentId),
            Some("env-from-hyphenated")
        );
        assert_eq!(settings.lookup(CredentialField::Region), None);
    }

    #[test]
    fn normalizing_moves_fields_to_standard_keys() {
        let settings = Settings::from_value(json!({
            "apiClientId": "client",
            "api-secret": "secret",
            "environment_id": "env",
            "region": "Europe",
            "rateLimit": 50,
        }))
        .unwrap();

        let normalized = settings.normalized();
        assert_eq!(
            normalized.as_map(),
            json!({
                "PINGONE_CLIENT_ID": "client",
                "PINGONE_CLIENT_SECRET": "secret",
                "PINGONE_ENVIRONMENT_ID": "env",
                "PINGONE_REGION": "Europe",
                "rateLimit": 50,
            })
            .as_object()
            .unwrap()
        );
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(matches!(
            Settings::from_json("[1, 2, 3]"),
            Err(SettingsError::NotAnObject)
        ));
        assert!(matches!(
            Settings::from_json("{ nope"),
            Err(SettingsError::Json(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_means_no_settings() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSettings::new(dir.path().join("settings.json"));
        assert!(source.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_object_means_no_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, "{}").await.unwrap();
        assert!(FileSettings::new(path).load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_round_trip_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSettings::new(dir.path().join("data").join("settings.json"));

        let mut settings = Settings::new();
        settings.set(CredentialField::ClientId, "client");
        source.save(&settings).await.unwrap();

        let loaded = source.load().await.unwrap().unwrap();
        assert_eq!(loaded.lookup(CredentialField::ClientId), Some("client"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saved_file_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        FileSettings::new(&path)
            .save(&Settings::from_value(json!({"a": "b"})).unwrap())
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
