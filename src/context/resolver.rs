//! Turns a [`ConfigSource`] into a [`ConnectionContext`].

use std::fmt;
use std::path::PathBuf;

use crate::config::{ConfigKey, ConfigSource};
use crate::errors::{SmtpError, SmtpResult};

use super::{ConnectionContext, STARTTLS_PORT};

/// Advisory condition found while resolving configuration.
///
/// Warnings never stop resolution. Each one is logged at `warn` level and
/// returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// User and password are set but the auth flag is `false`.
    CredentialsIgnored,
    /// The auth flag is neither `true` nor `false`; credentials are used.
    InvalidAuthFlag { value: String },
    /// A user is set without a password.
    PasswordMissing { user: String },
    /// The named properties file does not exist.
    PropertiesFileMissing { path: PathBuf },
    /// The named properties file could not be read or parsed.
    PropertiesFileUnreadable { path: PathBuf, reason: String },
}

impl ConfigWarning {
    /// Emits the warning through `tracing`.
    pub fn log(&self) {
        tracing::warn!(warning = ?self, "{}", self);
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::CredentialsIgnored => write!(
                f,
                "SMTP user and password are configured but {} is false; sending unauthenticated",
                ConfigKey::AuthFlag
            ),
            ConfigWarning::InvalidAuthFlag { value } => write!(
                f,
                "{} has unrecognized value \"{}\"; authenticating with the configured credentials",
                ConfigKey::AuthFlag,
                value
            ),
            ConfigWarning::PasswordMissing { user } => write!(
                f,
                "SMTP user \"{}\" is configured without a password; sending unauthenticated",
                user
            ),
            ConfigWarning::PropertiesFileMissing { path } => {
                write!(f, "SMTP properties file {} does not exist", path.display())
            }
            ConfigWarning::PropertiesFileUnreadable { path, reason } => write!(
                f,
                "SMTP properties file {} could not be loaded: {}",
                path.display(),
                reason
            ),
        }
    }
}

/// A resolved context with the warnings raised on the way.
#[derive(Debug)]
pub struct Resolution {
    pub context: ConnectionContext,
    pub warnings: Vec<ConfigWarning>,
}

/// Resolves connection contexts from layered configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextResolver;

impl ContextResolver {
    /// Resolves a context, discarding warnings after logging them.
    pub fn resolve(source: &ConfigSource) -> SmtpResult<ConnectionContext> {
        Self::resolve_with_warnings(source).map(|resolution| resolution.context)
    }

    /// Resolves a context and returns it with every warning raised,
    /// including those from loading the properties file.
    pub fn resolve_with_warnings(source: &ConfigSource) -> SmtpResult<Resolution> {
        let mut warnings = source.warnings().to_vec();

        let host = source
            .resolve(ConfigKey::Host)
            .ok_or_else(|| SmtpError::initialization("No SMTP Host Configured"))?;

        let auth_flag = source.resolve(ConfigKey::AuthFlag);
        let decision = decide_auth(
            auth_flag.as_deref(),
            source.resolve(ConfigKey::User),
            source.resolve(ConfigKey::Password),
        );
        if let Some(warning) = decision.warning {
            warning.log();
            warnings.push(warning);
        }

        let port = source
            .resolve(ConfigKey::Port)
            .map(|raw| parse_port(&raw))
            .transpose()?;

        // An explicit flag wins; otherwise only a configured 587 implies it.
        let use_starttls = match parse_flag(source, ConfigKey::StartTlsFlag)? {
            Some(flag) => flag,
            None => match parse_flag(source, ConfigKey::StartTlsFlagAlt)? {
                Some(flag) => flag,
                None => port == Some(STARTTLS_PORT),
            },
        };

        let debug = parse_flag(source, ConfigKey::DebugFlag)?.unwrap_or(false);

        let mut builder = ConnectionContext::builder()
            .host(host)
            .starttls(use_starttls)
            .debug(debug);
        if let Some(port) = port {
            builder = builder.port(port);
        }
        if let Some((user, password)) = decision.credentials {
            builder = builder.credentials(user, password);
        }
        let context = builder.build()?;

        tracing::debug!(
            host = %context.host(),
            port = context.port(),
            authenticated = context.credentials().is_some(),
            starttls = context.use_starttls(),
            warnings = warnings.len(),
            "Resolved SMTP connection context"
        );

        Ok(Resolution { context, warnings })
    }
}

struct AuthDecision {
    credentials: Option<(String, String)>,
    warning: Option<ConfigWarning>,
}

fn decide_auth(flag: Option<&str>, user: Option<String>, password: Option<String>) -> AuthDecision {
    let flag = flag.map(str::trim);
    let disabled = flag.is_some_and(|f| f.eq_ignore_ascii_case("false"));
    let enabled = flag.is_some_and(|f| f.eq_ignore_ascii_case("true"));

    match (user, password) {
        (Some(user), Some(password)) => {
            if disabled {
                AuthDecision {
                    credentials: None,
                    warning: Some(ConfigWarning::CredentialsIgnored),
                }
            } else if enabled || flag.is_none() {
                AuthDecision {
                    credentials: Some((user, password)),
                    warning: None,
                }
            } else {
                AuthDecision {
                    credentials: Some((user, password)),
                    warning: flag.map(|value| ConfigWarning::InvalidAuthFlag {
                        value: value.to_string(),
                    }),
                }
            }
        }
        (Some(user), None) if !disabled => AuthDecision {
            credentials: None,
            warning: Some(ConfigWarning::PasswordMissing { user }),
        },
        _ => AuthDecision {
            credentials: None,
            warning: None,
        },
    }
}

fn parse_port(raw: &str) -> SmtpResult<u16> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(SmtpError::invalid_value(
            ConfigKey::Port,
            raw,
            "an integer between 1 and 65535",
        )),
    }
}

fn parse_flag(source: &ConfigSource, key: ConfigKey) -> SmtpResult<Option<bool>> {
    let Some(raw) = source.resolve(key) else {
        return Ok(None);
    };
    let value = raw.trim();
    if value.eq_ignore_ascii_case("true") {
        Ok(Some(true))
    } else if value.eq_ignore_ascii_case("false") {
        Ok(Some(false))
    } else {
        Err(SmtpError::invalid_value(key, &raw, "true or false"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MapEnvironment, Properties};
    use crate::errors::SmtpErrorKind;
    use rstest::rstest;

    fn source(pairs: &[(&str, &str)]) -> ConfigSource {
        ConfigSource::builder()
            .explicit(pairs.iter().copied().collect::<Properties>())
            .build()
    }

    #[test]
    fn test_missing_host() {
        let err = ContextResolver::resolve(&source(&[])).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Initialization);
        assert_eq!(err.message(), "No SMTP Host Configured");
    }

    #[test]
    fn test_host_only_defaults() {
        let ctx = ContextResolver::resolve(&source(&[("mail.smtp.host", "mx.example.com")])).unwrap();
        assert_eq!(ctx.host(), "mx.example.com");
        assert_eq!(ctx.port(), 25);
        assert!(ctx.credentials().is_none());
        assert!(!ctx.use_starttls());
        assert!(!ctx.debug());
    }

    #[rstest]
    #[case::absent_flag(None, Some("u"), Some("p"), true, None)]
    #[case::true_flag(Some("true"), Some("u"), Some("p"), true, None)]
    #[case::true_flag_upper(Some("TRUE"), Some("u"), Some("p"), true, None)]
    #[case::false_flag(Some("false"), Some("u"), Some("p"), false, Some(ConfigWarning::CredentialsIgnored))]
    #[case::false_flag_no_credentials(Some("False"), None, None, false, None)]
    #[case::false_flag_user_only(Some("false"), Some("u"), None, false, None)]
    #[case::odd_flag(
        Some("yes"),
        Some("u"),
        Some("p"),
        true,
        Some(ConfigWarning::InvalidAuthFlag { value: "yes".to_string() })
    )]
    #[case::user_only(None, Some("u"), None, false, Some(ConfigWarning::PasswordMissing { user: "u".to_string() }))]
    #[case::true_flag_user_only(Some("true"), Some("u"), None, false, Some(ConfigWarning::PasswordMissing { user: "u".to_string() }))]
    #[case::password_only(None, None, Some("p"), false, None)]
    #[case::nothing(None, None, None, false, None)]
    fn test_auth_decision(
        #[case] flag: Option<&str>,
        #[case] user: Option<&str>,
        #[case] password: Option<&str>,
        #[case] authenticated: bool,
        #[case] warning: Option<ConfigWarning>,
    ) {
        let mut props = Properties::new().with("mail.smtp.host", "mx.example.com");
        if let Some(flag) = flag {
            props.set("mail.smtp.auth", flag);
        }
        if let Some(user) = user {
            props.set("mail.smtp.user", user);
        }
        if let Some(password) = password {
            props.set("mail.smtp.password", password);
        }
        let source = ConfigSource::builder().explicit(props).build();

        let resolution = ContextResolver::resolve_with_warnings(&source).unwrap();
        assert_eq!(resolution.context.credentials().is_some(), authenticated);
        assert_eq!(resolution.warnings, warning.into_iter().collect::<Vec<_>>());
    }

    #[rstest]
    #[case::no_port_no_auth(&[], 25, false)]
    #[case::no_port_auth(&[("mail.smtp.user", "u"), ("mail.smtp.password", "p")], 465, false)]
    #[case::no_port_auth_starttls(
        &[("mail.smtp.user", "u"), ("mail.smtp.password", "p"), ("mail.smtp.starttls.enable", "true")],
        587,
        true
    )]
    #[case::port_587_infers_starttls(&[("mail.smtp.port", "587")], 587, true)]
    #[case::port_465(&[("mail.smtp.port", "465")], 465, false)]
    #[case::port_2525(&[("mail.smtp.port", "2525")], 2525, false)]
    #[case::explicit_flag_beats_inference(
        &[("mail.smtp.port", "587"), ("mail.smtp.starttls.enable", "false")],
        587,
        false
    )]
    fn test_port_and_starttls(
        #[case] pairs: &[(&str, &str)],
        #[case] port: u16,
        #[case] starttls: bool,
    ) {
        let mut props = Properties::new().with("mail.smtp.host", "mx.example.com");
        for (key, value) in pairs {
            props.set(*key, *value);
        }
        let ctx = ContextResolver::resolve(&ConfigSource::builder().explicit(props).build()).unwrap();
        assert_eq!(ctx.port(), port);
        assert_eq!(ctx.use_starttls(), starttls);
    }

    #[test]
    fn test_alternate_starttls_variable() {
        let env = MapEnvironment::new()
            .with("SMTP_HOST", "mx.example.com")
            .with("SMTP_START_TLS", "true");
        let ctx = ContextResolver::resolve(&ConfigSource::builder().environment(env).build()).unwrap();
        assert!(ctx.use_starttls());

        let env = MapEnvironment::new()
            .with("SMTP_HOST", "mx.example.com")
            .with("SMTP_STARTTLS", "false")
            .with("SMTP_START_TLS", "not-checked");
        let ctx = ContextResolver::resolve(&ConfigSource::builder().environment(env).build()).unwrap();
        assert!(!ctx.use_starttls());
    }

    #[rstest]
    #[case("mail.smtp.port", "abc")]
    #[case("mail.smtp.port", "0")]
    #[case("mail.smtp.port", "70000")]
    #[case("mail.smtp.starttls.enable", "yes")]
    #[case("mail.smtp.debug", "1")]
    fn test_invalid_values_are_fatal(#[case] key: &str, #[case] value: &str) {
        let err = ContextResolver::resolve(&source(&[("mail.smtp.host", "h"), (key, value)])).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConfigurationInvalid);
        assert!(err.message().contains(key));
        assert!(err.message().contains(value));
    }

    #[test]
    fn test_debug_flag_case_insensitive() {
        let ctx = ContextResolver::resolve(&source(&[
            ("mail.smtp.host", "h"),
            ("mail.smtp.debug", "True"),
        ]))
        .unwrap();
        assert!(ctx.debug());
    }

    #[test]
    fn test_warnings_never_contain_password() {
        let resolution = ContextResolver::resolve_with_warnings(&source(&[
            ("mail.smtp.host", "h"),
            ("mail.smtp.auth", "false"),
            ("mail.smtp.user", "alice"),
            ("mail.smtp.password", "hunter2"),
        ]))
        .unwrap();
        let rendered: String = resolution.warnings.iter().map(|w| w.to_string()).collect();
        assert!(!rendered.is_empty());
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let source = source(&[
            ("mail.smtp.host", "h"),
            ("mail.smtp.user", "u"),
            ("mail.smtp.password", "p"),
            ("mail.smtp.port", "587"),
        ]);
        assert_eq!(
            ContextResolver::resolve(&source).unwrap(),
            ContextResolver::resolve(&source).unwrap()
        );
    }
}
