//! The resource service, used by the query editor to explore the catalog.
//!
//! Handled paths, all `GET`, all answering with a JSON array of names:
//!
//! - `/catalogs`
//! - `/schemas?catalog=...`
//! - `/tables?catalog=...&schema=...`
//! - `/columns?catalog=...&schema=...&table=...`
//!
//! Statements run with the same identity rules as data queries.

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::stream;
use grafana_plugin_sdk::backend;
use http::{header::AUTHORIZATION, Method, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::{ConfigError, Error, TrinoPlugin};

/// Errors returned from resource calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// No resource lives at the requested path.
    #[error("Path not found")]
    NotFound,

    /// Resources are read-only.
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// A required query parameter was missing or empty.
    #[error("missing query parameter {0:?}")]
    MissingParameter(&'static str),

    /// Listing the resource failed.
    #[error(transparent)]
    Datasource(#[from] Error),

    /// The response could not be built.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// The response body could not be encoded.
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<ConfigError> for ResourceError {
    fn from(other: ConfigError) -> Self {
        Self::Datasource(other.into())
    }
}

#[derive(Debug, Serialize)]
struct JsonError {
    error: String,
}

impl backend::ErrIntoHttpResponse for ResourceError {
    fn into_http_response(self) -> Result<Response<Bytes>, Box<dyn std::error::Error>> {
        let status = match &self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingParameter(_) | Self::Datasource(Error::Config(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Datasource(Error::TokenExchange(_)) => StatusCode::UNAUTHORIZED,
            Self::Datasource(Error::Connection { .. }) => StatusCode::BAD_GATEWAY,
            Self::Datasource(Error::Query(_)) | Self::Http(_) | Self::Encode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Ok(Response::builder().status(status).body(Bytes::from(
            serde_json::to_vec(&JsonError {
                error: self.to_string(),
            })?,
        ))?)
    }
}

/// A parsed resource request.
#[derive(Debug, PartialEq, Eq)]
enum Resource {
    Catalogs,
    Schemas {
        catalog: String,
    },
    Tables {
        catalog: String,
        schema: String,
    },
    Columns {
        catalog: String,
        schema: String,
        table: String,
    },
}

impl Resource {
    fn parse(path: &str, query: Option<&str>) -> Result<Self, ResourceError> {
        let params: HashMap<String, String> = url::form_urlencoded::parse(
            query.unwrap_or_default().as_bytes(),
        )
        .into_owned()
        .collect();
        let param = |name: &'static str| {
            params
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or(ResourceError::MissingParameter(name))
        };
        Ok(match path.trim_end_matches('/') {
            "/catalogs" => Self::Catalogs,
            "/schemas" => Self::Schemas {
                catalog: param("catalog")?,
            },
            "/tables" => Self::Tables {
                catalog: param("catalog")?,
                schema: param("schema")?,
            },
            "/columns" => Self::Columns {
                catalog: param("catalog")?,
                schema: param("schema")?,
                table: param("table")?,
            },
            _ => return Err(ResourceError::NotFound),
        })
    }
}

#[backend::async_trait]
impl backend::ResourceService for TrinoPlugin {
    type Error = ResourceError;
    type InitialResponse = Response<Bytes>;
    type Stream = backend::BoxResourceStream<Self::Error>;

    async fn call_resource(
        &self,
        request: backend::CallResourceRequest<Self>,
    ) -> Result<(Self::InitialResponse, Self::Stream), Self::Error> {
        let uri = request.request.uri();
        let resource = Resource::parse(uri.path(), uri.query())?;
        if request.request.method() != Method::GET {
            return Err(ResourceError::MethodNotAllowed);
        }

        let datasource = self
            .datasource(request.plugin_context.instance_settings.as_ref())
            .await?;
        let user = request.plugin_context.user.as_ref().map(|u| u.login.as_str());
        let authorization = request
            .request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let ctx = datasource.request_context(user, authorization)?;

        let names = match &resource {
            Resource::Catalogs => datasource.catalogs(&ctx).await,
            Resource::Schemas { catalog } => datasource.schemas(&ctx, catalog).await,
            Resource::Tables { catalog, schema } => datasource.tables(&ctx, catalog, schema).await,
            Resource::Columns {
                catalog,
                schema,
                table,
            } => datasource.columns(&ctx, catalog, schema, table).await,
        }?;

        let body = serde_json::to_vec(&names)?;
        let response = Response::builder()
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(body))?;
        Ok((response, Box::pin(stream::empty())))
    }
}

#[cfg(test)]
mod test {
    use grafana_plugin_sdk::backend::ErrIntoHttpResponse;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_paths() {
        assert_eq!(Resource::parse("/catalogs", None).unwrap(), Resource::Catalogs);
        assert_eq!(
            Resource::parse("/schemas", Some("catalog=hive")).unwrap(),
            Resource::Schemas {
                catalog: "hive".to_string()
            }
        );
        assert_eq!(
            Resource::parse("/columns/", Some("catalog=hive&schema=web&table=page%20views"))
                .unwrap(),
            Resource::Columns {
                catalog: "hive".to_string(),
                schema: "web".to_string(),
                table: "page views".to_string(),
            }
        );
    }

    #[test]
    fn rejects_bad_requests() {
        assert!(matches!(
            Resource::parse("/relations", None),
            Err(ResourceError::NotFound)
        ));
        assert!(matches!(
            Resource::parse("/tables", Some("catalog=hive")),
            Err(ResourceError::MissingParameter("schema"))
        ));
        assert!(matches!(
            Resource::parse("/schemas", Some("catalog=")),
            Err(ResourceError::MissingParameter("catalog"))
        ));
    }

    #[test]
    fn error_statuses() {
        let response = ResourceError::MissingParameter("catalog")
            .into_http_response()
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "missing query parameter \"catalog\"");

        let response = ResourceError::from(ConfigError::MissingUser)
            .into_http_response()
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ResourceError::NotFound.into_http_response().unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let encode = serde_json::from_str::<Vec<String>>("x").unwrap_err();
        let response = ResourceError::from(encode).into_http_response().unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to encode response"));
    }
}
