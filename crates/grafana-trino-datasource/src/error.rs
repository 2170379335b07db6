//! Error kinds surfaced by the datasource.
//!
//! None of these are retried inside the plugin: configuration errors block the
//! datasource entirely, while token, connection and query errors fail the
//! individual request that hit them.

use thiserror::Error;

use crate::client::StatementError;

/// Errors returned by the Trino datasource.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The datasource is missing settings, or its settings contradict each other.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The OAuth2 client credentials exchange failed.
    #[error("error fetching OAuth token: {0}")]
    TokenExchange(#[from] TokenError),

    /// The Trino coordinator could not be reached.
    #[error("Failed to connect to database. Is the hostname and port correct? {source}")]
    Connection {
        /// The underlying HTTP error.
        source: reqwest::Error,
    },

    /// Trino rejected or failed the statement.
    #[error(transparent)]
    Query(#[from] StatementError),
}

impl Error {
    pub(crate) fn connection(source: reqwest::Error) -> Self {
        Self::Connection { source }
    }
}

/// Missing or contradictory datasource configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The request did not target a datasource instance.
    #[error("missing datasource instance settings")]
    MissingInstanceSettings,

    /// The datasource URL could not be parsed.
    #[error("invalid datasource URL {url:?}: {source}")]
    InvalidUrl {
        /// The configured URL.
        url: String,
        /// The parse failure.
        source: url::ParseError,
    },

    /// The datasource URL has no host to connect to.
    #[error("datasource URL {0:?} has no host")]
    UrlWithoutHost(String),

    /// Custom HTTP headers were configured; Trino headers are managed by the plugin.
    #[error("Custom headers are not supported and must be not set")]
    CustomHeaders,

    /// Some, but not all, of the OAuth settings were provided.
    #[error(
        "missing parameters for 'OAuth Trino Authentication': {}",
        .0.join(", ")
    )]
    MissingOAuthParams(Vec<&'static str>),

    /// A static access token was configured alongside OAuth.
    #[error("access token must not be set within 'OAuth Trino Authentication' settings")]
    AccessTokenWithOAuth,

    /// A TLS client certificate was configured without its key.
    #[error("client certificate was configured without a client key")]
    ClientCertWithoutKey,

    /// PEM material in the TLS settings could not be loaded.
    #[error("failed to load {what}: {source}")]
    InvalidCertificate {
        /// Which piece of TLS material failed.
        what: &'static str,
        /// The underlying error.
        source: reqwest::Error,
    },

    /// The secure SOCKS proxy could not be configured.
    #[error("failed to configure secure SOCKS proxy: {0}")]
    Proxy(String),

    /// A configured value cannot be sent as an HTTP header.
    #[error("{0} contains characters which are not allowed in an HTTP header")]
    InvalidHeaderValue(&'static str),

    /// A role mapping entry was not of the form `catalog:role`.
    #[error("Invalid role format. expected catalog:role, got '{0}'")]
    InvalidRole(String),

    /// Impersonation is enabled but Grafana did not send a user with the request.
    #[error("user can't be empty if impersonation is enabled")]
    MissingUser,
}

/// Failures of the OAuth2 client credentials exchange.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The token request could not be sent, or its body could not be read.
    #[error("failed to request the token response: {0}")]
    Request(#[from] reqwest::Error),

    /// The identity provider answered with something other than `200 OK`.
    #[error("Cannot obtain token from IDP. Status code={0}")]
    Status(http::StatusCode),

    /// The identity provider's response was not a token response.
    #[error("failed to decode the token response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The access token cannot be sent in an `Authorization` header.
    #[error("access token contains characters which are not allowed in an HTTP header")]
    InvalidHeader,
}
