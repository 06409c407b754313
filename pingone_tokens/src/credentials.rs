//! Credential resolution
//!
//! Credentials come from one of three places, tried in order:
//!
//! 1. an explicit [`CredentialOverride`] supplied by the caller,
//! 2. the process environment, when client id, secret and environment id
//!    are all set,
//! 3. the settings document, walking the historical key spellings of each
//!    field.
//!
//! Nothing is cached here. Every call re-reads live configuration so that
//! updated settings take effect without a restart.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crypto::{EncryptionError, SettingsCipher},
    region::RegionCode,
    ClientId, ClientSecret, EnvironmentId,
};

pub mod env;
pub mod settings;

pub use env::{Environment, ProcessEnvironment};
pub use settings::{FileSettings, InMemorySettings, Settings, SettingsError, SettingsSource};

const PLACEHOLDERS: &[&str] = &[
    "YOUR_CLIENT_ID_HERE",
    "YOUR_CLIENT_SECRET_HERE",
    "YOUR_ENVIRONMENT_ID_HERE",
    "your-client-id",
    "your-client-secret",
    "your-environment-id",
    "changeme",
];

/// Returns `true` for values that were obviously never filled in
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.starts_with("YOUR_") || PLACEHOLDERS.iter().any(|p| p.eq_ignore_ascii_case(value))
}

/// One of the logical credential fields
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialField {
    /// The worker application's client id
    ClientId,
    /// The worker application's client secret
    ClientSecret,
    /// The environment that owns the application
    EnvironmentId,
    /// The deployment region
    Region,
}

impl CredentialField {
    /// Every field, in display order
    pub const ALL: [CredentialField; 4] = [
        CredentialField::ClientId,
        CredentialField::ClientSecret,
        CredentialField::EnvironmentId,
        CredentialField::Region,
    ];

    /// The environment variable carrying this field
    pub const fn env_var(self) -> &'static str {
        match self {
            CredentialField::ClientId => "PINGONE_CLIENT_ID",
            CredentialField::ClientSecret => "PINGONE_CLIENT_SECRET",
            CredentialField::EnvironmentId => "PINGONE_ENVIRONMENT_ID",
            CredentialField::Region => "PINGONE_REGION",
        }
    }

    /// A short human-readable name
    pub const fn as_str(self) -> &'static str {
        match self {
            CredentialField::ClientId => "client id",
            CredentialField::ClientSecret => "client secret",
            CredentialField::EnvironmentId => "environment id",
            CredentialField::Region => "region",
        }
    }
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error resolving or storing credentials
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A required field is empty
    #[error("missing credentials: {0} is required")]
    Missing(CredentialField),
    /// A field still holds a template placeholder
    #[error("invalid credential format: {0} is a placeholder value")]
    Placeholder(CredentialField),
    /// The stored secret could not be decrypted
    #[error("decryption failed; check key configuration")]
    Decryption(#[source] EncryptionError),
    /// The secret could not be encrypted for storage
    #[error("unable to encrypt client secret for storage")]
    Encryption(#[source] EncryptionError),
    /// The settings could not be read or written
    #[error("unable to access settings")]
    Settings(#[from] SettingsError),
}

/// Effective credentials for one token exchange
#[derive(Clone, Debug)]
pub struct Credentials {
    /// The client id
    pub client_id: ClientId,
    /// The client secret, in plaintext
    pub client_secret: ClientSecret,
    /// The environment id
    pub environment_id: EnvironmentId,
    /// The deployment region
    pub region: RegionCode,
}

impl Credentials {
    /// Builds credentials from raw strings, validating every field
    ///
    /// A blank region resolves to the default region.
    pub fn from_parts(
        client_id: &str,
        client_secret: &str,
        environment_id: &str,
        region: &str,
    ) -> Result<Self, CredentialError> {
        let field = |field, value: &str| {
            let value = value.trim();
            if value.is_empty() {
                Err(CredentialError::Missing(field))
            } else if is_placeholder(value) {
                Err(CredentialError::Placeholder(field))
            } else {
                Ok(value.to_owned())
            }
        };

        let region = region.trim();
        let region = if region.is_empty() {
            RegionCode::default()
        } else {
            RegionCode::resolve(region)
        };

        Ok(Self {
            client_id: ClientId::new(field(CredentialField::ClientId, client_id)?),
            client_secret: ClientSecret::new(field(CredentialField::ClientSecret, client_secret)?),
            environment_id: EnvironmentId::new(field(
                CredentialField::EnvironmentId,
                environment_id,
            )?),
            region,
        })
    }

    /// Checks that every field is present and not a placeholder
    pub fn validate(&self) -> Result<(), CredentialError> {
        let fields = [
            (CredentialField::ClientId, self.client_id.as_str()),
            (CredentialField::ClientSecret, self.client_secret.as_str()),
            (CredentialField::EnvironmentId, self.environment_id.as_str()),
        ];

        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(CredentialError::Missing(field));
            }
            if is_placeholder(value) {
                return Err(CredentialError::Placeholder(field));
            }
        }

        Ok(())
    }
}

/// Credentials supplied explicitly by a caller, in plaintext
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialOverride {
    /// The client id
    #[serde(default, alias = "client_id")]
    pub client_id: String,
    /// The client secret
    #[serde(default, alias = "client_secret")]
    pub client_secret: String,
    /// The environment id
    #[serde(default, alias = "environment_id")]
    pub environment_id: String,
    /// The region, in any accepted spelling; blank means the default region
    #[serde(default)]
    pub region: String,
}

impl fmt::Debug for CredentialOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialOverride")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***CLIENT SECRET***")
            .field("environment_id", &self.environment_id)
            .field("region", &self.region)
            .finish()
    }
}

impl CredentialOverride {
    /// Validates the override and converts it into credentials
    pub fn to_credentials(&self) -> Result<Credentials, CredentialError> {
        Credentials::from_parts(
            &self.client_id,
            &self.client_secret,
            &self.environment_id,
            &self.region,
        )
    }
}

/// Where a set of credentials came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// Supplied explicitly by the caller
    Override,
    /// Read from the process environment
    Environment,
    /// Read from the settings document
    Settings,
}

/// A redacted description of the effective credentials
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    /// The client id
    pub client_id: String,
    /// The environment id
    pub environment_id: String,
    /// The canonical region
    pub region: RegionCode,
    /// Whether a client secret is present
    pub has_client_secret: bool,
    /// Whether the stored secret is encrypted at rest
    pub secret_encrypted: bool,
    /// Where the values came from
    pub source: CredentialSource,
}

/// Resolves credentials from the environment and the settings store
#[derive(Clone)]
pub struct CredentialStore {
    settings: Arc<dyn SettingsSource>,
    env: Arc<dyn Environment>,
    cipher: Arc<dyn SettingsCipher>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Constructs a store reading the given settings, environment and cipher
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        env: Arc<dyn Environment>,
        cipher: Arc<dyn SettingsCipher>,
    ) -> Self {
        Self {
            settings,
            env,
            cipher,
        }
    }

    /// The underlying settings source
    pub fn settings(&self) -> &Arc<dyn SettingsSource> {
        &self.settings
    }

    /// Resolves the effective credentials
    ///
    /// An explicit override is used verbatim, and is an error if invalid.
    /// Otherwise `Ok(None)` means no usable credentials are configured.
    #[tracing::instrument(level = "debug", skip_all, fields(has_override = explicit.is_some()))]
    pub async fn resolve(
        &self,
        explicit: Option<&CredentialOverride>,
    ) -> Result<Option<Credentials>, CredentialError> {
        if let Some(explicit) = explicit {
            return explicit.to_credentials().map(Some);
        }

        if let Some(creds) = self.from_env() {
            return Ok(Some(creds));
        }

        let settings = match self.settings.load().await? {
            Some(settings) => settings,
            None => {
                tracing::debug!("no settings available");
                return Ok(None);
            }
        };

        self.from_settings(&settings)
    }

    fn from_env(&self) -> Option<Credentials> {
        let vars = &*self.env;
        let client_id = env::non_empty(vars, CredentialField::ClientId.env_var())?;
        let client_secret = env::non_empty(vars, CredentialField::ClientSecret.env_var())?;
        let environment_id = env::non_empty(vars, CredentialField::EnvironmentId.env_var())?;
        let region = env::non_empty(vars, CredentialField::Region.env_var()).unwrap_or_default();

        match Credentials::from_parts(&client_id, &client_secret, &environment_id, &region) {
            Ok(creds) => {
                tracing::debug!(source = "environment", "resolved credentials");
                Some(creds)
            }
            Err(error) => {
                tracing::warn!(%error, "ignoring environment credentials");
                None
            }
        }
    }

    fn from_settings(&self, settings: &Settings) -> Result<Option<Credentials>, CredentialError> {
        let lookup = |field| settings.lookup(field).unwrap_or_default();

        let stored_secret = lookup(CredentialField::ClientSecret);
        let client_secret = if self.cipher.is_encrypted(stored_secret) {
            self.cipher
                .decrypt(stored_secret)
                .map_err(CredentialError::Decryption)?
        } else {
            stored_secret.to_owned()
        };

        match Credentials::from_parts(
            lookup(CredentialField::ClientId),
            &client_secret,
            lookup(CredentialField::EnvironmentId),
            lookup(CredentialField::Region),
        ) {
            Ok(creds) => {
                tracing::debug!(source = "settings", "resolved credentials");
                Ok(Some(creds))
            }
            Err(error) => {
                tracing::debug!(%error, "settings do not hold usable credentials");
                Ok(None)
            }
        }
    }

    /// Validates and persists credentials to the settings store
    ///
    /// The secret is stored encrypted and the region as its canonical code.
    /// Unrelated settings are kept.
    #[tracing::instrument(skip_all, fields(client_id = %credentials.client_id))]
    pub async fn save(&self, credentials: &CredentialOverride) -> Result<(), CredentialError> {
        let validated = credentials.to_credentials()?;

        let secret = self
            .cipher
            .encrypt(validated.client_secret.as_str())
            .map_err(CredentialError::Encryption)?;

        let mut settings = self.settings.load().await?.unwrap_or_default().normalized();
        settings.set(CredentialField::ClientId, validated.client_id.take());
        settings.set(CredentialField::ClientSecret, secret);
        settings.set(
            CredentialField::EnvironmentId,
            validated.environment_id.take(),
        );
        settings.set(CredentialField::Region, validated.region.as_str());

        self.settings.save(&settings).await?;
        Ok(())
    }

    /// Describes the effective credentials without revealing the secret
    pub async fn describe(&self) -> Result<Option<CredentialSummary>, CredentialError> {
        if let Some(creds) = self.from_env() {
            return Ok(Some(CredentialSummary {
                client_id: creds.client_id.take(),
                environment_id: creds.environment_id.take(),
                region: creds.region,
                has_client_secret: true,
                secret_encrypted: false,
                source: CredentialSource::Environment,
            }));
        }

        let settings = match self.settings.load().await? {
            Some(settings) => settings,
            None => return Ok(None),
        };

        let client_id = settings.lookup(CredentialField::ClientId);
        let environment_id = settings.lookup(CredentialField::EnvironmentId);
        let secret = settings.lookup(CredentialField::ClientSecret);

        if client_id.is_none() && environment_id.is_none() && secret.is_none() {
            return Ok(None);
        }

        Ok(Some(CredentialSummary {
            client_id: client_id.unwrap_or_default().to_owned(),
            environment_id: environment_id.unwrap_or_default().to_owned(),
            region: settings
                .lookup(CredentialField::Region)
                .map(RegionCode::resolve)
                .unwrap_or_default(),
            has_client_secret: secret.is_some(),
            secret_encrypted: secret.map_or(false, |s| self.cipher.is_encrypted(s)),
            source: CredentialSource::Settings,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use tracing_test::traced_test;

    use super::*;
    use crate::crypto::AesSettingsCipher;

    const PASSPHRASE: &str = "unit test passphrase";

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn store(settings: InMemorySettings, env: HashMap<String, String>) -> CredentialStore {
        CredentialStore::new(
            Arc::new(settings),
            Arc::new(env),
            Arc::new(AesSettingsCipher::from_passphrase(PASSPHRASE)),
        )
    }

    fn settings(value: serde_json::Value) -> InMemorySettings {
        InMemorySettings::new(Some(Settings::from_value(value).unwrap()))
    }

    fn full_env() -> HashMap<String, String> {
        env(&[
            ("PINGONE_CLIENT_ID", "env-client"),
            ("PINGONE_CLIENT_SECRET", "env-secret"),
            ("PINGONE_ENVIRONMENT_ID", "env-environment"),
            ("PINGONE_REGION", "Europe"),
        ])
    }

    #[test]
    fn placeholders_are_recognized() {
        assert!(is_placeholder("YOUR_CLIENT_ID_HERE"));
        assert!(is_placeholder("YOUR_ANYTHING"));
        assert!(is_placeholder("ChangeMe"));
        assert!(is_placeholder("your-environment-id"));
        assert!(!is_placeholder("3f1c2a4e-client"));
    }

    #[test]
    fn override_accepts_camel_and_snake_case() {
        let camel: CredentialOverride = serde_json::from_value(json!({
            "clientId": "a", "clientSecret": "b", "environmentId": "c", "region": "EU"
        }))
        .unwrap();
        let snake: CredentialOverride = serde_json::from_value(json!({
            "client_id": "a", "client_secret": "b", "environment_id": "c"
        }))
        .unwrap();

        assert_eq!(camel.to_credentials().unwrap().region, RegionCode::EU);
        assert_eq!(snake.to_credentials().unwrap().region, RegionCode::NA);
        assert_eq!(snake.client_secret, "b");
    }

    #[test]
    fn override_debug_hides_secret() {
        let o = CredentialOverride {
            client_secret: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{:?}", o).contains("hunter2"));
    }

    mod when_resolving {
        use super::*;

        #[tokio::test]
        async fn environment_wins_over_settings() {
            let store = store(
                settings(json!({
                    "PINGONE_CLIENT_ID": "settings-client",
                    "PINGONE_CLIENT_SECRET": "settings-secret",
                    "PINGONE_ENVIRONMENT_ID": "settings-environment",
                })),
                full_env(),
            );

            let creds = store.resolve(None).await.unwrap().unwrap();
            assert_eq!(creds.client_id.as_str(), "env-client");
            assert_eq!(creds.client_secret.as_str(), "env-secret");
            assert_eq!(creds.region, RegionCode::EU);
        }

        #[tokio::test]
        async fn partial_environment_falls_through_to_settings() {
            let store = store(
                settings(json!({
                    "apiClientId": "settings-client",
                    "apiSecret": "settings-secret",
                    "environmentId": "settings-environment",
                    "region": "Canada",
                })),
                env(&[("PINGONE_CLIENT_ID", "env-client")]),
            );

            let creds = store.resolve(None).await.unwrap().unwrap();
            assert_eq!(creds.client_id.as_str(), "settings-client");
            assert_eq!(creds.region, RegionCode::CA);
        }

        #[tokio::test]
        #[traced_test]
        async fn placeholder_environment_is_ignored_with_a_warning() {
            let mut vars = full_env();
            vars.insert("PINGONE_CLIENT_ID".to_owned(), "YOUR_CLIENT_ID_HERE".to_owned());
            let store = store(
                settings(json!({
                    "PINGONE_CLIENT_ID": "settings-client",
                    "PINGONE_CLIENT_SECRET": "settings-secret",
                    "PINGONE_ENVIRONMENT_ID": "settings-environment",
                })),
                vars,
            );

            let creds = store.resolve(None).await.unwrap().unwrap();
            assert_eq!(creds.client_id.as_str(), "settings-client");
            assert!(logs_contain("ignoring environment credentials"));
            assert!(logs_contain("placeholder"));
        }

        #[tokio::test]
        async fn encrypted_settings_secret_is_decrypted() {
            let encrypted = AesSettingsCipher::from_passphrase(PASSPHRASE)
                .encrypt("plaintext-secret")
                .unwrap();
            let store = store(
                settings(json!({
                    "PINGONE_CLIENT_ID": "client",
                    "PINGONE_CLIENT_SECRET": encrypted,
                    "PINGONE_ENVIRONMENT_ID": "environment",
                })),
                HashMap::new(),
            );

            let creds = store.resolve(None).await.unwrap().unwrap();
            assert_eq!(creds.client_secret.as_str(), "plaintext-secret");
        }

        #[tokio::test]
        async fn undecryptable_secret_is_an_error_not_ciphertext() {
            let encrypted = AesSettingsCipher::from_passphrase("some other key")
                .encrypt("plaintext-secret")
                .unwrap();
            let store = store(
                settings(json!({
                    "PINGONE_CLIENT_ID": "client",
                    "PINGONE_CLIENT_SECRET": encrypted,
                    "PINGONE_ENVIRONMENT_ID": "environment",
                })),
                HashMap::new(),
            );

            let err = store.resolve(None).await.unwrap_err();
            assert!(matches!(err, CredentialError::Decryption(_)));
            assert!(err.to_string().contains("decryption failed"));
        }

        #[tokio::test]
        async fn placeholders_in_settings_mean_no_credentials() {
            let store = store(
                settings(json!({
                    "PINGONE_CLIENT_ID": "YOUR_CLIENT_ID_HERE",
                    "PINGONE_CLIENT_SECRET": "secret",
                    "PINGONE_ENVIRONMENT_ID": "environment",
                })),
                HashMap::new(),
            );

            assert!(store.resolve(None).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn no_settings_means_no_credentials() {
            let store = store(InMemorySettings::default(), HashMap::new());
            assert!(store.resolve(None).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn invalid_override_is_an_error() {
            let store = store(InMemorySettings::default(), full_env());
            let explicit = CredentialOverride {
                client_id: "client".into(),
                client_secret: "".into(),
                environment_id: "env".into(),
                region: "".into(),
            };

            let err = store.resolve(Some(&explicit)).await.unwrap_err();
            assert!(matches!(
                err,
                CredentialError::Missing(CredentialField::ClientSecret)
            ));
        }

        #[tokio::test]
        async fn override_is_used_verbatim() {
            let store = store(InMemorySettings::default(), full_env());
            let explicit = CredentialOverride {
                client_id: "override-client".into(),
                client_secret: "enc:not-decrypted".into(),
                environment_id: "override-env".into(),
                region: "AU".into(),
            };

            let creds = store.resolve(Some(&explicit)).await.unwrap().unwrap();
            assert_eq!(creds.client_id.as_str(), "override-client");
            assert_eq!(creds.client_secret.as_str(), "enc:not-decrypted");
            assert_eq!(creds.region, RegionCode::AU);
        }
    }

    mod when_saving {
        use super::*;

        #[tokio::test]
        async fn secret_is_encrypted_and_keys_standardized() {
            let memory = settings(json!({
                "apiClientId": "old-client",
                "rateLimit": 50,
            }));
            let store = store(memory.clone(), HashMap::new());

            store
                .save(&CredentialOverride {
                    client_id: "client".into(),
                    client_secret: "secret".into(),
                    environment_id: "environment".into(),
                    region: "asia pacific".into(),
                })
                .await
                .unwrap();

            let saved = memory.current().unwrap();
            let map = saved.as_map();
            assert_eq!(map["PINGONE_CLIENT_ID"], "client");
            assert_eq!(map["PINGONE_REGION"], "AP");
            assert_eq!(map["rateLimit"], 50);
            assert!(!map.contains_key("apiClientId"));

            let stored_secret = map["PINGONE_CLIENT_SECRET"].as_str().unwrap();
            assert!(crate::crypto::is_encrypted(stored_secret));

            let creds = store.resolve(None).await.unwrap().unwrap();
            assert_eq!(creds.client_secret.as_str(), "secret");
        }

        #[tokio::test]
        async fn placeholders_are_refused() {
            let store = store(InMemorySettings::default(), HashMap::new());
            let err = store
                .save(&CredentialOverride {
                    client_id: "client".into(),
                    client_secret: "YOUR_CLIENT_SECRET_HERE".into(),
                    environment_id: "environment".into(),
                    region: String::new(),
                })
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                CredentialError::Placeholder(CredentialField::ClientSecret)
            ));
        }
    }

    mod when_describing {
        use super::*;

        #[tokio::test]
        async fn settings_summary_hides_the_secret() {
            let encrypted = AesSettingsCipher::from_passphrase(PASSPHRASE)
                .encrypt("plaintext-secret")
                .unwrap();
            let store = store(
                settings(json!({
                    "PINGONE_CLIENT_ID": "client",
                    "PINGONE_CLIENT_SECRET": encrypted,
                    "PINGONE_ENVIRONMENT_ID": "environment",
                    "PINGONE_REGION": "SG",
                })),
                HashMap::new(),
            );

            let summary = store.describe().await.unwrap().unwrap();
            assert_eq!(summary.client_id, "client");
            assert_eq!(summary.region, RegionCode::SG);
            assert!(summary.has_client_secret);
            assert!(summary.secret_encrypted);
            assert_eq!(summary.source, CredentialSource::Settings);

            let json = serde_json::to_value(&summary).unwrap();
            assert!(!json.to_string().contains("plaintext-secret"));
            assert_eq!(json["hasClientSecret"], true);
        }

        #[tokio::test]
        async fn environment_is_reported_as_source() {
            let store = store(InMemorySettings::default(), full_env());
            let summary = store.describe().await.unwrap().unwrap();
            assert_eq!(summary.source, CredentialSource::Environment);
        }

        #[tokio::test]
        async fn nothing_configured_means_nothing_described() {
            let store = store(InMemorySettings::default(), HashMap::new());
            assert!(store.describe().await.unwrap().is_none());
        }
    }
}
