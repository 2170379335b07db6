//! Datasource settings, as configured in Grafana's datasource editor.
//!
//! Grafana sends the raw `jsonData` and decrypted `secureJsonData` with every
//! request. The SDK deserializes them into [`TrinoJsonData`] and
//! [`TrinoSecureJsonData`]; [`DatasourceSettings::load`] then validates them and
//! produces the immutable snapshot used by a datasource instance.

use std::{collections::BTreeMap, collections::HashMap, fmt, time::Duration};

use grafana_plugin_sdk::backend::DataSourceInstanceSettings;
use serde::Deserialize;
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use tracing::info;
use url::Url;

use crate::error::ConfigError;

/// The user sent to Trino when basic auth is not configured.
pub const DEFAULT_USER: &str = "grafana";

const SOCKS_ENABLED_VAR: &str = "GF_SECURE_SOCKS_DATASOURCE_PROXY_SERVER_ENABLED";
const SOCKS_ADDRESS_VAR: &str = "GF_SECURE_SOCKS_DATASOURCE_PROXY_PROXY_ADDRESS";

/// Non-secret datasource settings, from the datasource's `jsonData`.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrinoJsonData {
    /// Run queries as the Grafana user making the request.
    pub enable_impersonation: bool,
    /// OAuth2 token endpoint used for the client credentials grant.
    pub token_url: String,
    /// OAuth2 client id.
    pub client_id: String,
    /// Fixed user to impersonate on every request authenticated with OAuth.
    pub impersonation_user: String,
    /// Client tags sent with every statement.
    pub client_tags: String,
    /// Catalog role mapping, as `catalog:role;catalog:role`.
    pub roles: String,
    /// Skip verification of the coordinator's TLS certificate.
    pub tls_skip_verify: bool,
    /// Authenticate to the coordinator with a TLS client certificate.
    pub tls_auth: bool,
    /// Verify the coordinator against a custom CA certificate.
    pub tls_auth_with_ca_cert: bool,
    /// Route traffic through Grafana's secure SOCKS proxy.
    pub enable_secure_socks_proxy: bool,
    /// HTTP timeout in seconds.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub timeout: Option<u64>,
    /// Everything else the datasource editor stores.
    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

/// Secret datasource settings, from the datasource's decrypted `secureJsonData`.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrinoSecureJsonData {
    /// Static bearer token sent to Trino.
    pub access_token: Option<String>,
    /// OAuth2 client secret.
    pub client_secret: Option<String>,
    /// Password for basic authentication.
    pub basic_auth_password: Option<String>,
    /// PEM encoded CA certificate.
    #[serde(rename = "tlsCACert")]
    pub tls_ca_cert: Option<String>,
    /// PEM encoded client certificate.
    pub tls_client_cert: Option<String>,
    /// PEM encoded client key.
    pub tls_client_key: Option<String>,
}

impl fmt::Debug for TrinoSecureJsonData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrinoSecureJsonData").finish_non_exhaustive()
    }
}

/// TLS material for connections to the coordinator and the identity provider.
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Accept any server certificate.
    pub skip_verify: bool,
    /// Extra root certificate, PEM encoded.
    pub ca_cert: Option<String>,
    /// Client certificate and key, PEM encoded.
    pub client_identity: Option<(String, String)>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("skip_verify", &self.skip_verify)
            .field("ca_cert", &self.ca_cert.is_some())
            .field("client_identity", &self.client_identity.is_some())
            .finish()
    }
}

/// Grafana's secure SOCKS proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyOptions {
    /// `host:port` of the proxy.
    pub address: String,
}

impl ProxyOptions {
    /// Read the proxy configuration Grafana exposes to plugins.
    ///
    /// Returns `Ok(None)` if Grafana has not enabled the proxy.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let enabled = lookup(SOCKS_ENABLED_VAR)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !enabled {
            return Ok(None);
        }
        match lookup(SOCKS_ADDRESS_VAR).filter(|a| !a.trim().is_empty()) {
            Some(address) => Ok(Some(Self {
                address: address.trim().to_string(),
            })),
            None => Err(ConfigError::Proxy(format!("{SOCKS_ADDRESS_VAR} is not set"))),
        }
    }
}

/// Settings for the OAuth2 client credentials grant.
#[derive(Clone)]
pub struct OAuthSettings {
    /// Token endpoint.
    pub token_url: String,
    /// Client id.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
}

impl fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// A validated snapshot of a datasource's configuration.
#[derive(Clone)]
pub struct DatasourceSettings {
    /// Coordinator URL, carrying the Trino user (and basic auth password, if any).
    pub url: Url,
    /// TLS options.
    pub tls: TlsOptions,
    /// Overall HTTP timeout.
    pub timeout: Option<Duration>,
    /// SOCKS proxy, if enabled both for this datasource and by Grafana.
    pub proxy: Option<ProxyOptions>,
    /// Impersonate the Grafana user making each request.
    pub enable_impersonation: bool,
    /// Static bearer token.
    pub access_token: Option<String>,
    /// Client credentials settings, if OAuth is configured.
    pub oauth: Option<OAuthSettings>,
    /// Fixed user sent alongside the OAuth token.
    pub impersonation_user: Option<String>,
    /// Client tags sent with every statement.
    pub client_tags: Option<String>,
    /// Catalog to role mapping.
    pub roles: BTreeMap<String, String>,
}

impl fmt::Debug for DatasourceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("redacted"));
        }
        f.debug_struct("DatasourceSettings")
            .field("url", &url.as_str())
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .field("proxy", &self.proxy)
            .field("enable_impersonation", &self.enable_impersonation)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("oauth", &self.oauth)
            .field("impersonation_user", &self.impersonation_user)
            .field("client_tags", &self.client_tags)
            .field("roles", &self.roles)
            .finish()
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn non_empty_secret(s: &Option<String>) -> Option<String> {
    s.as_deref().and_then(non_empty)
}

impl DatasourceSettings {
    /// Load settings from the instance settings Grafana sends with a request.
    pub fn from_instance(
        instance: &DataSourceInstanceSettings<TrinoJsonData, TrinoSecureJsonData>,
    ) -> Result<Self, ConfigError> {
        let basic_auth_user = instance
            .basic_auth_enabled
            .then_some(instance.basic_auth_user.as_str());
        Self::load(
            &instance.url,
            basic_auth_user,
            &instance.json_data,
            &instance.decrypted_secure_json_data,
            ProxyOptions::from_env()?,
        )
    }

    /// Validate the raw settings.
    ///
    /// `grafana_proxy` is the SOCKS proxy Grafana makes available; it is only used
    /// if the datasource opts in.
    pub fn load(
        url: &str,
        basic_auth_user: Option<&str>,
        json: &TrinoJsonData,
        secure: &TrinoSecureJsonData,
        grafana_proxy: Option<ProxyOptions>,
    ) -> Result<Self, ConfigError> {
        info!("Loading Trino data source settings");
        if json.other.keys().any(|k| k.starts_with("httpHeaderName")) {
            return Err(ConfigError::CustomHeaders);
        }

        let mut parsed = Url::parse(url.trim()).map_err(|source| ConfigError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        if !parsed.has_host() {
            return Err(ConfigError::UrlWithoutHost(url.to_string()));
        }
        let user = basic_auth_user
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        parsed
            .set_username(&user)
            .map_err(|()| ConfigError::UrlWithoutHost(url.to_string()))?;
        if basic_auth_user.is_some() {
            if let Some(password) = non_empty_secret(&secure.basic_auth_password) {
                parsed
                    .set_password(Some(&password))
                    .map_err(|()| ConfigError::UrlWithoutHost(url.to_string()))?;
            }
        }

        let access_token = non_empty_secret(&secure.access_token);
        let oauth = oauth_settings(json, secure, access_token.is_some())?;

        Ok(Self {
            url: parsed,
            tls: tls_options(json, secure)?,
            timeout: json.timeout.filter(|t| *t > 0).map(Duration::from_secs),
            proxy: grafana_proxy.filter(|_| json.enable_secure_socks_proxy),
            enable_impersonation: json.enable_impersonation,
            access_token,
            oauth,
            impersonation_user: non_empty(&json.impersonation_user),
            client_tags: non_empty(&json.client_tags),
            roles: parse_roles(&json.roles)?,
        })
    }

    /// The Trino user, taken from the URL.
    pub fn user(&self) -> &str {
        self.url.username()
    }
}

fn oauth_settings(
    json: &TrinoJsonData,
    secure: &TrinoSecureJsonData,
    has_access_token: bool,
) -> Result<Option<OAuthSettings>, ConfigError> {
    let token_url = non_empty(&json.token_url);
    let client_id = non_empty(&json.client_id);
    let client_secret = non_empty_secret(&secure.client_secret);
    if token_url.is_none() && client_id.is_none() && client_secret.is_none() {
        return Ok(None);
    }
    if has_access_token {
        return Err(ConfigError::AccessTokenWithOAuth);
    }
    match (token_url, client_id, client_secret) {
        (Some(token_url), Some(client_id), Some(client_secret)) => Ok(Some(OAuthSettings {
            token_url,
            client_id,
            client_secret,
        })),
        (token_url, client_id, client_secret) => {
            let missing = [
                (token_url.is_none(), "Token URL"),
                (client_id.is_none(), "Client id"),
                (client_secret.is_none(), "Client secret"),
            ]
            .into_iter()
            .filter_map(|(missing, name)| missing.then_some(name))
            .collect();
            Err(ConfigError::MissingOAuthParams(missing))
        }
    }
}

fn tls_options(
    json: &TrinoJsonData,
    secure: &TrinoSecureJsonData,
) -> Result<TlsOptions, ConfigError> {
    let ca_cert = if json.tls_auth_with_ca_cert {
        non_empty_secret(&secure.tls_ca_cert)
    } else {
        None
    };
    let client_identity = if json.tls_auth {
        match (
            non_empty_secret(&secure.tls_client_cert),
            non_empty_secret(&secure.tls_client_key),
        ) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (Some(_), None) => return Err(ConfigError::ClientCertWithoutKey),
            (None, _) => None,
        }
    } else {
        None
    };
    Ok(TlsOptions {
        skip_verify: json.tls_skip_verify,
        ca_cert,
        client_identity,
    })
}

/// Parse a role mapping of the form `catalog:role;catalog:role`.
///
/// Pairs are split on the first `:`. A pair without `:` is rejected; pairs with
/// an empty catalog or role are skipped.
pub fn parse_roles(roles: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut parsed = BTreeMap::new();
    if roles.trim().is_empty() {
        return Ok(parsed);
    }
    for pair in roles.split(';') {
        let (catalog, role) = pair
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidRole(pair.to_string()))?;
        let (catalog, role) = (catalog.trim(), role.trim());
        if !catalog.is_empty() && !role.is_empty() {
            parsed.insert(catalog.to_string(), role.to_string());
        }
    }
    Ok(parsed)
}
