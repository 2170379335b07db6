//! A minimal client for Trino's REST statement protocol.
//!
//! A statement is submitted with `POST /v1/statement`; the coordinator answers
//! with a page of results and, while the statement is still running, a
//! `nextUri` to poll for the next page.

use std::{fmt, sync::Arc};

use grafana_plugin_sdk::backend::async_trait;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Request};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::debug;
use url::Url;

use crate::{
    context::QueryArg,
    convert::ConvertError,
    error::{ConfigError, Error},
    macros::MacroError,
    settings::DatasourceSettings,
    transport::Transport,
};

/// The header naming the user a statement runs as.
pub const TRINO_USER_HEADER: &str = "X-Trino-User";
/// The header carrying client tags.
pub const TRINO_CLIENT_TAGS_HEADER: &str = "X-Trino-Client-Tags";
/// The header identifying the client application.
pub const TRINO_SOURCE_HEADER: &str = "X-Trino-Source";
/// The header setting a catalog role.
pub const TRINO_ROLE_HEADER: &str = "X-Trino-Role";

const SOURCE: &str = "grafana";

/// Failures while running a statement.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StatementError {
    /// The HTTP exchange with the coordinator failed.
    #[error("error communicating with Trino: {0}")]
    Http(#[source] reqwest::Error),

    /// The coordinator answered with an unexpected HTTP status.
    #[error("Trino returned status {status}: {body}")]
    Status {
        /// The HTTP status.
        status: http::StatusCode,
        /// The response body.
        body: String,
    },

    /// Trino reported that the statement failed.
    #[error("{error_name}: {message}")]
    Trino {
        /// Trino's description of the failure.
        message: String,
        /// Trino's name for the failure, e.g. `SYNTAX_ERROR`.
        error_name: String,
    },

    /// The coordinator's response could not be decoded.
    #[error("failed to decode Trino response: {0}")]
    Decode(#[from] serde_json::Error),

    /// A statement argument cannot be sent as an HTTP header.
    #[error("{0} contains characters which are not allowed in an HTTP header")]
    InvalidArgument(&'static str),

    /// The coordinator returned a `nextUri` that is not a URL.
    #[error("invalid nextUri {0:?}")]
    InvalidNextUri(String),

    /// A macro in the statement could not be expanded.
    #[error(transparent)]
    Macro(#[from] MacroError),

    /// A time series was requested but the result has no time column.
    #[error("time series requires time column")]
    MissingTimeColumn,

    /// The result could not be converted into a frame.
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

/// A result column, as reported by Trino.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Column {
    /// The column name.
    pub name: String,
    /// Trino's type name, e.g. `varchar(10)` or `timestamp(3) with time zone`.
    #[serde(rename = "type")]
    pub type_name: String,
}

impl Column {
    /// Create a column.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// The complete result of a statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    /// The result columns.
    pub columns: Vec<Column>,
    /// The rows, one JSON value per column.
    pub rows: Vec<Vec<Value>>,
}

/// Something that runs SQL statements and returns their rows.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Run `sql`, sending `args` with the statement.
    async fn query(&self, sql: &str, args: &[QueryArg]) -> Result<QueryResult, Error>;
}

#[async_trait]
impl<T: RowSource + ?Sized> RowSource for Arc<T> {
    async fn query(&self, sql: &str, args: &[QueryArg]) -> Result<QueryResult, Error> {
        (**self).query(sql, args).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrinoError {
    message: String,
    #[serde(default)]
    error_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementPage {
    next_uri: Option<String>,
    columns: Option<Vec<Column>>,
    data: Option<Vec<Vec<Value>>>,
    error: Option<TrinoError>,
}

/// Runs statements against a Trino coordinator.
pub struct TrinoClient {
    transport: Arc<Transport>,
    statement_url: Url,
    user: String,
    password: Option<String>,
    access_token: Option<String>,
    roles: Vec<HeaderValue>,
}

impl fmt::Debug for TrinoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrinoClient")
            .field("statement_url", &self.statement_url.as_str())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

fn header(value: &str, what: &'static str) -> Result<HeaderValue, StatementError> {
    HeaderValue::from_str(value).map_err(|_| StatementError::InvalidArgument(what))
}

fn bearer(token: &str, what: &'static str) -> Result<HeaderValue, StatementError> {
    let mut value = header(&format!("Bearer {token}"), what)?;
    value.set_sensitive(true);
    Ok(value)
}

impl TrinoClient {
    /// Create a client for the coordinator at `settings.url`.
    pub fn new(settings: &DatasourceSettings, transport: Arc<Transport>) -> Result<Self, ConfigError> {
        let mut base = settings.url.clone();
        // Credentials travel in headers, never in the URL.
        let _ = base.set_username("");
        let _ = base.set_password(None);
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let statement_url = base
            .join("v1/statement")
            .map_err(|source| ConfigError::InvalidUrl {
                url: base.to_string(),
                source,
            })?;
        let roles = settings
            .roles
            .iter()
            .map(|(catalog, role)| {
                HeaderValue::from_str(&format!("{catalog}=ROLE{{{role}}}"))
                    .map_err(|_| ConfigError::InvalidRole(format!("{catalog}:{role}")))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            transport,
            statement_url,
            user: settings.user().to_string(),
            password: settings.url.password().map(str::to_string),
            access_token: settings.access_token.clone(),
            roles,
        })
    }

    fn headers(&self, args: &[QueryArg]) -> Result<HeaderMap, StatementError> {
        let mut headers = HeaderMap::new();
        headers.insert(TRINO_USER_HEADER, header(&self.user, "user")?);
        headers.insert(TRINO_SOURCE_HEADER, HeaderValue::from_static(SOURCE));
        for role in &self.roles {
            headers.append(TRINO_ROLE_HEADER, role.clone());
        }
        if let Some(token) = &self.access_token {
            headers.insert(AUTHORIZATION, bearer(token, "access token")?);
        }
        for arg in args {
            match arg {
                QueryArg::AccessToken(token) => {
                    headers.insert(AUTHORIZATION, bearer(token, "forwarded access token")?);
                }
                QueryArg::User(_) | QueryArg::ClientTags(_) => {
                    headers.insert(arg.name(), header(arg.value(), arg.name())?);
                }
            }
        }
        Ok(headers)
    }

    fn build(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<String>,
    ) -> Result<Request, StatementError> {
        let mut builder = self.transport.request(method, url).headers(headers.clone());
        // A bearer token, static or forwarded, takes precedence over basic auth.
        if let Some(password) = self.password.as_ref().filter(|_| !headers.contains_key(AUTHORIZATION)) {
            builder = builder.basic_auth(&self.user, Some(password));
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        builder.build().map_err(StatementError::Http)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<String>,
    ) -> Result<StatementPage, Error> {
        let request = self.build(method, url, headers, body)?;
        let response = self.transport.execute(request).await?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(StatementError::Http)?;
        if !status.is_success() {
            return Err(StatementError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }
            .into());
        }
        let page: StatementPage = serde_json::from_slice(&bytes).map_err(StatementError::from)?;
        if let Some(error) = page.error {
            return Err(StatementError::Trino {
                message: error.message,
                error_name: error.error_name,
            }
            .into());
        }
        Ok(page)
    }
}

#[async_trait]
impl RowSource for TrinoClient {
    async fn query(&self, sql: &str, args: &[QueryArg]) -> Result<QueryResult, Error> {
        let headers = self.headers(args)?;
        debug!(statement = %sql, "Submitting statement");
        let mut page = self
            .send(
                Method::POST,
                self.statement_url.as_str(),
                &headers,
                Some(sql.to_string()),
            )
            .await?;
        let mut result = QueryResult::default();
        let mut cancel = CancelOnDrop {
            client: self,
            headers: &headers,
            next_uri: None,
        };
        loop {
            if let Some(columns) = page.columns.take() {
                result.columns = columns;
            }
            if let Some(data) = page.data.take() {
                result.rows.extend(data);
            }
            let Some(next) = page.next_uri.take() else {
                break;
            };
            let next = Url::parse(&next).map_err(|_| StatementError::InvalidNextUri(next.clone()))?;
            debug!(next_uri = %next, rows = result.rows.len(), "Polling statement");
            cancel.next_uri = Some(next.clone());
            page = self.send(Method::GET, next.as_str(), &headers, None).await?;
        }
        cancel.next_uri = None;
        Ok(result)
    }
}

/// Cancels a running statement if polling stops before the last page.
///
/// Armed with the statement's current `nextUri`; dropping it while armed sends
/// a `DELETE` to that URI in the background, as Trino clients do to abandon a
/// query. Failures are only logged.
struct CancelOnDrop<'a> {
    client: &'a TrinoClient,
    headers: &'a HeaderMap,
    next_uri: Option<Url>,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        let Some(uri) = self.next_uri.take() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let request = match self
            .client
            .build(Method::DELETE, uri.as_str(), self.headers, None)
        {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Could not build statement cancellation");
                return;
            }
        };
        debug!(next_uri = %uri, "Cancelling abandoned statement");
        let transport = Arc::clone(&self.client.transport);
        runtime.spawn(async move {
            if let Err(e) = transport.execute(request).await {
                debug!(error = %e, "Statement cancellation failed");
            }
        });
    }
}
