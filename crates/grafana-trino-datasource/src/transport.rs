//! The HTTP transport used for every request to Trino and to the identity provider.

use std::fmt;

use http::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Certificate, Identity, Method, Proxy, Request, RequestBuilder, Response};
use tracing::debug;

use crate::{
    client::{StatementError, TRINO_CLIENT_TAGS_HEADER, TRINO_USER_HEADER},
    error::{ConfigError, Error, TokenError},
    settings::{DatasourceSettings, TlsOptions},
    token::{ClientCredentials, TokenCache},
};

/// Headers added to every request when OAuth is configured.
struct OAuthInjector {
    tokens: TokenCache<ClientCredentials>,
    impersonation_user: Option<HeaderValue>,
    client_tags: Option<HeaderValue>,
}

impl OAuthInjector {
    async fn inject(&self, request: &mut Request) -> Result<(), TokenError> {
        let token = self.tokens.token().await?;
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.access_token()))
            .map_err(|_| TokenError::InvalidHeader)?;
        bearer.set_sensitive(true);
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        if let Some(user) = &self.impersonation_user {
            headers.insert(TRINO_USER_HEADER, user.clone());
        }
        if let Some(tags) = &self.client_tags {
            headers.insert(TRINO_CLIENT_TAGS_HEADER, tags.clone());
        }
        Ok(())
    }
}

/// An HTTP client configured with the datasource's TLS, proxy and OAuth settings.
///
/// When OAuth is configured, each request sent through [`Transport::execute`]
/// carries a bearer token from the instance's [`TokenCache`], overriding any
/// `Authorization` header already on the request.
pub struct Transport {
    client: reqwest::Client,
    oauth: Option<OAuthInjector>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("oauth", &self.oauth.is_some())
            .finish_non_exhaustive()
    }
}

fn header_value(value: &Option<String>, what: &'static str) -> Result<Option<HeaderValue>, ConfigError> {
    value
        .as_deref()
        .map(HeaderValue::from_str)
        .transpose()
        .map_err(|_| ConfigError::InvalidHeaderValue(what))
}

fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &TlsOptions,
) -> Result<reqwest::ClientBuilder, ConfigError> {
    if tls.skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(ca_cert) = &tls.ca_cert {
        let cert = Certificate::from_pem(ca_cert.as_bytes()).map_err(|source| {
            ConfigError::InvalidCertificate {
                what: "CA certificate",
                source,
            }
        })?;
        builder = builder.add_root_certificate(cert);
    }
    if let Some((cert, key)) = &tls.client_identity {
        let pem = [cert.as_bytes(), b"\n", key.as_bytes()].concat();
        let identity =
            Identity::from_pem(&pem).map_err(|source| ConfigError::InvalidCertificate {
                what: "client certificate",
                source,
            })?;
        builder = builder.identity(identity);
    }
    Ok(builder)
}

impl Transport {
    /// Build the transport for a datasource.
    pub fn new(settings: &DatasourceSettings) -> Result<Self, ConfigError> {
        let mut builder = apply_tls(reqwest::Client::builder(), &settings.tls)?;
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = &settings.proxy {
            let proxy = Proxy::all(format!("socks5h://{}", proxy.address))
                .map_err(|e| ConfigError::Proxy(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|source| ConfigError::InvalidCertificate {
                what: "TLS settings",
                source,
            })?;

        let oauth = settings
            .oauth
            .as_ref()
            .map(|oauth| {
                debug!(token_url = %oauth.token_url, "Using OAuth client credentials");
                Ok::<_, ConfigError>(OAuthInjector {
                    tokens: TokenCache::new(ClientCredentials::new(
                        client.clone(),
                        &oauth.token_url,
                        &oauth.client_id,
                        &oauth.client_secret,
                    )),
                    impersonation_user: header_value(
                        &settings.impersonation_user,
                        "impersonation user",
                    )?,
                    client_tags: header_value(&settings.client_tags, "client tags")?,
                })
            })
            .transpose()?;
        Ok(Self { client, oauth })
    }

    /// Start building a request.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Send a request, authenticating it first if OAuth is configured.
    ///
    /// A failure to connect is reported as [`Error::Connection`]; other
    /// transport failures are query errors.
    pub async fn execute(&self, mut request: Request) -> Result<Response, Error> {
        if let Some(oauth) = &self.oauth {
            oauth.inject(&mut request).await?;
        }
        self.client.execute(request).await.map_err(|e| {
            if e.is_connect() {
                Error::connection(e)
            } else {
                StatementError::Http(e).into()
            }
        })
    }

    /// Whether requests are authenticated with OAuth client credentials.
    pub fn uses_oauth(&self) -> bool {
        self.oauth.is_some()
    }
}
