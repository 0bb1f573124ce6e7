//! Registry settings and credential resolution.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

/// Flat registry settings, keyed the way npmrc keys them
/// (`//registry.example/scope/:_authToken`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrySettings(BTreeMap<String, String>);

impl RegistrySettings {
    /// Create empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a setting.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RegistrySettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Authorization scheme for a registry request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Auth {
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// `Authorization: Basic <encoded>`, already base64 encoded.
    Basic(String),
    #[default]
    None,
}

impl Auth {
    /// Value of the `Authorization` header, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::Bearer(token) => Some(format!("Bearer {token}")),
            Self::Basic(encoded) => Some(format!("Basic {encoded}")),
            Self::None => None,
        }
    }
}

/// TLS client certificate and key files (PEM).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientCertificate {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Credentials to use when fetching a URL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub auth: Auth,
    pub tls: Option<ClientCertificate>,
}

impl Credentials {
    /// No authentication at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether neither an auth scheme nor a client certificate is set.
    pub fn is_none(&self) -> bool {
        self.auth == Auth::None && self.tls.is_none()
    }
}

/// Maps a registry URL to the credentials configured for it.
///
/// Settings are matched by longest path prefix: for
/// `https://reg.example/foo/-/foo-1.0.0.tgz` the prefixes
/// `//reg.example/foo/-/foo-1.0.0.tgz`, `//reg.example/foo/-/`, ...,
/// `//reg.example/foo/`, `//reg.example/foo`, `//reg.example/` are tried in
/// that order and the first one carrying an auth scheme or a certificate
/// pair wins.
#[derive(Clone, Debug, Default)]
pub struct CredentialResolver {
    settings: RegistrySettings,
}

impl CredentialResolver {
    pub fn new(settings: RegistrySettings) -> Self {
        Self { settings }
    }

    /// Resolve credentials for a URL.
    pub fn resolve(&self, url: &str) -> Credentials {
        let Ok(parsed) = Url::parse(url) else {
            return Credentials::none();
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return Credentials::none();
        }
        let Some(host) = parsed.host_str() else {
            return Credentials::none();
        };
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut registry = parsed.path();
        while !registry.is_empty() {
            let prefix = format!("//{host}{registry}:");
            if let Some(credentials) = self.lookup(&prefix) {
                tracing::debug!(%url, registry = %prefix.trim_end_matches(':'), "resolved registry credentials");
                return credentials;
            }
            registry = parent_prefix(registry);
        }

        Credentials::none()
    }

    fn lookup(&self, prefix: &str) -> Option<Credentials> {
        let get = |name: &str| self.settings.get(&format!("{prefix}{name}"));

        let auth = if let Some(token) = get("_authToken") {
            Auth::Bearer(token.to_string())
        } else if let Some(encoded) = get("_auth") {
            Auth::Basic(encoded.to_string())
        } else if let (Some(username), Some(password)) = (get("username"), get("_password")) {
            Auth::Basic(
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}")),
            )
        } else {
            Auth::None
        };

        let tls = match (get("certfile"), get("keyfile")) {
            (Some(cert_file), Some(key_file)) => Some(ClientCertificate {
                cert_file: PathBuf::from(cert_file),
                key_file: PathBuf::from(key_file),
            }),
            _ => None,
        };

        let credentials = Credentials { auth, tls };
        (!credentials.is_none()).then_some(credentials)
    }
}

/// Drop a trailing `/`, or else the trailing path segment.
fn parent_prefix(path: &str) -> &str {
    if let Some(stripped) = path.strip_suffix('/') {
        return stripped;
    }
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "",
    }
}
