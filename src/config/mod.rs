//! Layered configuration sources.
//!
//! Each [`ConfigKey`] is looked up in three layers, first non-blank value
//! wins:
//!
//! 1. explicit properties provided by code;
//! 2. the properties file named by `mail.smtp.properties` /
//!    `SMTP_PROPERTIES` when it loads, otherwise the ambient system
//!    properties;
//! 3. the key's environment variable.

mod properties;

pub use properties::Properties;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::context::ConfigWarning;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default client identifier sent with EHLO.
pub const DEFAULT_CLIENT_ID: &str = "localhost";

/// Logical configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// SMTP server host name.
    Host,
    /// SMTP server port.
    Port,
    /// Whether to authenticate.
    AuthFlag,
    /// Login user.
    User,
    /// Login password.
    Password,
    /// Whether to upgrade with STARTTLS.
    StartTlsFlag,
    /// Alternate environment spelling of the STARTTLS flag.
    StartTlsFlagAlt,
    /// Whether to log protocol traffic.
    DebugFlag,
    /// Location of a properties file.
    PropertiesPath,
}

impl ConfigKey {
    /// All keys, in resolution order.
    pub const ALL: [ConfigKey; 9] = [
        ConfigKey::Host,
        ConfigKey::Port,
        ConfigKey::AuthFlag,
        ConfigKey::User,
        ConfigKey::Password,
        ConfigKey::StartTlsFlag,
        ConfigKey::StartTlsFlagAlt,
        ConfigKey::DebugFlag,
        ConfigKey::PropertiesPath,
    ];

    /// Returns the property name, if the key has one.
    pub fn property_name(&self) -> Option<&'static str> {
        match self {
            ConfigKey::Host => Some("mail.smtp.host"),
            ConfigKey::Port => Some("mail.smtp.port"),
            ConfigKey::AuthFlag => Some("mail.smtp.auth"),
            ConfigKey::User => Some("mail.smtp.user"),
            ConfigKey::Password => Some("mail.smtp.password"),
            ConfigKey::StartTlsFlag => Some("mail.smtp.starttls.enable"),
            ConfigKey::StartTlsFlagAlt => None,
            ConfigKey::DebugFlag => Some("mail.smtp.debug"),
            ConfigKey::PropertiesPath => Some("mail.smtp.properties"),
        }
    }

    /// Returns the environment variable name, if the key has one.
    pub fn env_var(&self) -> Option<&'static str> {
        match self {
            ConfigKey::Host => Some("SMTP_HOST"),
            ConfigKey::Port => Some("SMTP_PORT"),
            ConfigKey::AuthFlag => None,
            ConfigKey::User => Some("SMTP_USER"),
            ConfigKey::Password => Some("SMTP_PASSWORD"),
            ConfigKey::StartTlsFlag => Some("SMTP_STARTTLS"),
            ConfigKey::StartTlsFlagAlt => Some("SMTP_START_TLS"),
            ConfigKey::DebugFlag => Some("SMTP_DEBUG"),
            ConfigKey::PropertiesPath => Some("SMTP_PROPERTIES"),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.property_name(), self.env_var()) {
            (Some(prop), Some(env)) => write!(f, "{} ({})", prop, env),
            (Some(prop), None) => write!(f, "{}", prop),
            (None, Some(env)) => write!(f, "{}", env),
            (None, None) => write!(f, "{:?}", self),
        }
    }
}

/// Read access to environment variables.
#[cfg_attr(test, mockall::automock)]
pub trait Environment: Send + Sync {
    /// Returns the variable's value, or `None` if unset.
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// In-memory environment.
#[derive(Debug, Clone, Default)]
pub struct MapEnvironment {
    vars: HashMap<String, String>,
}

impl MapEnvironment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Sets a variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }
}

impl Environment for MapEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnvironment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Which store backs the second layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOrigin {
    /// A properties file that loaded successfully.
    File(PathBuf),
    /// Ambient system properties.
    SystemProperties,
}

/// Layered configuration lookup.
pub struct ConfigSource {
    explicit: Properties,
    store: Properties,
    origin: StoreOrigin,
    environment: Arc<dyn Environment>,
    warnings: Vec<ConfigWarning>,
}

impl ConfigSource {
    /// Creates a new builder.
    pub fn builder() -> ConfigSourceBuilder {
        ConfigSourceBuilder::default()
    }

    /// Source backed by the process environment only.
    pub fn from_process() -> Self {
        Self::builder().environment(ProcessEnvironment).build()
    }

    /// Returns the first non-blank value for `key`.
    pub fn resolve(&self, key: ConfigKey) -> Option<String> {
        if let Some(name) = key.property_name() {
            if let Some(value) = non_blank(self.explicit.get(name)) {
                return Some(value.to_string());
            }
            if let Some(value) = non_blank(self.store.get(name)) {
                return Some(value.to_string());
            }
        }
        let env = key.env_var()?;
        self.environment
            .var(env)
            .filter(|value| !value.trim().is_empty())
    }

    /// Returns warnings raised while loading the properties file.
    pub fn warnings(&self) -> &[ConfigWarning] {
        &self.warnings
    }

    /// Returns which store backs the second layer.
    pub fn store_origin(&self) -> &StoreOrigin {
        &self.origin
    }
}

impl fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSource")
            .field("explicit_keys", &self.explicit.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("store_keys", &self.store.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("origin", &self.origin)
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Builder for [`ConfigSource`].
#[derive(Default)]
pub struct ConfigSourceBuilder {
    explicit: Properties,
    system_properties: Properties,
    environment: Option<Arc<dyn Environment>>,
}

impl ConfigSourceBuilder {
    /// Sets the code-provided properties.
    pub fn explicit(mut self, props: Properties) -> Self {
        self.explicit = props;
        self
    }

    /// Sets the ambient system properties.
    pub fn system_properties(mut self, props: Properties) -> Self {
        self.system_properties = props;
        self
    }

    /// Sets the environment.
    pub fn environment(mut self, env: impl Environment + 'static) -> Self {
        self.environment = Some(Arc::new(env));
        self
    }

    /// Sets a shared environment.
    pub fn shared_environment(mut self, env: Arc<dyn Environment>) -> Self {
        self.environment = Some(env);
        self
    }

    /// Builds the source, loading the properties file if one is named.
    ///
    /// A file that is missing or unreadable produces a warning and the
    /// ambient system properties are used instead.
    pub fn build(self) -> ConfigSource {
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(MapEnvironment::new()));

        let path = non_blank(
            ConfigKey::PropertiesPath
                .property_name()
                .and_then(|name| self.system_properties.get(name)),
        )
        .map(str::to_string)
        .or_else(|| {
            ConfigKey::PropertiesPath
                .env_var()
                .and_then(|name| environment.var(name))
                .filter(|v| !v.trim().is_empty())
        });

        let mut warnings = Vec::new();
        let (store, origin) = match path {
            Some(path) => match load_file(Path::new(path.trim())) {
                Ok(props) => {
                    tracing::debug!(path = %path, keys = props.len(), "Loaded SMTP properties file");
                    (props, StoreOrigin::File(PathBuf::from(path.trim())))
                }
                Err(warning) => {
                    warning.log();
                    warnings.push(warning);
                    (self.system_properties, StoreOrigin::SystemProperties)
                }
            },
            None => (self.system_properties, StoreOrigin::SystemProperties),
        };

        ConfigSource {
            explicit: self.explicit,
            store,
            origin,
            environment,
            warnings,
        }
    }
}

fn load_file(path: &Path) -> Result<Properties, ConfigWarning> {
    if !path.is_file() {
        return Err(ConfigWarning::PropertiesFileMissing {
            path: path.to_path_buf(),
        });
    }
    Properties::load(path).map_err(|e| ConfigWarning::PropertiesFileUnreadable {
        path: path.to_path_buf(),
        reason: e.message().to_string(),
    })
}
