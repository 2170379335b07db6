//! The data service, which runs panel queries.

use std::sync::Arc;

use futures_util::stream::FuturesOrdered;
use grafana_plugin_sdk::backend::{self, DataQueryStatus, ErrorSource};
use thiserror::Error;
use tracing::debug;

use crate::{
    client::StatementError, context, convert::ConvertError, query::TrinoQuery, Error,
    TrinoInstanceSettings, TrinoPlugin,
};

/// An error returned for a single query.
///
/// Other queries in the same request are unaffected.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct QueryError {
    ref_id: String,
    source: Error,
}

impl QueryError {
    /// The underlying error.
    pub fn error(&self) -> &Error {
        &self.source
    }
}

impl backend::DataQueryError for QueryError {
    fn ref_id(self) -> String {
        self.ref_id
    }

    fn status(&self) -> DataQueryStatus {
        match &self.source {
            Error::Config(_) => DataQueryStatus::BadRequest,
            Error::TokenExchange(_) => DataQueryStatus::Unauthorized,
            Error::Connection { .. } => DataQueryStatus::BadGateway,
            Error::Query(_) => DataQueryStatus::Internal,
        }
    }

    fn source(&self) -> ErrorSource {
        match &self.source {
            Error::Config(_) => ErrorSource::Plugin,
            Error::TokenExchange(_) | Error::Connection { .. } | Error::Query(_) => {
                ErrorSource::Downstream
            }
        }
    }
}

impl TrinoPlugin {
    #[tracing::instrument(skip_all, fields(ref_id = %query.ref_id))]
    async fn run_query(
        &self,
        settings: Option<&TrinoInstanceSettings>,
        user: Option<&str>,
        authorization: Option<&str>,
        query: backend::DataQuery<TrinoQuery>,
    ) -> Result<backend::DataResponse, QueryError> {
        let ref_id = query.ref_id.clone();
        let error = |source: Error| QueryError {
            ref_id: ref_id.clone(),
            source,
        };
        let datasource = self
            .datasource(settings)
            .await
            .map_err(|e| error(e.into()))?;
        // Fails before any SQL runs if impersonation has no user to impersonate.
        let ctx = datasource
            .request_context(user, authorization)
            .map_err(|e| error(e.into()))?;
        debug!(user = ?ctx.user(), format = ?query.query.format, "Running query");
        let frame = datasource
            .query(
                &ctx,
                &ref_id,
                &query.query,
                query.time_range.from,
                query.time_range.to,
            )
            .await
            .map_err(error)?;
        let checked = frame
            .check()
            .map_err(|e| error(StatementError::from(ConvertError::from(e)).into()))?;
        Ok(backend::DataResponse::new(ref_id.clone(), vec![checked]))
    }
}

#[backend::async_trait]
impl backend::DataService for TrinoPlugin {
    type Query = TrinoQuery;
    type QueryError = QueryError;
    type Stream = backend::BoxDataResponseStream<Self::QueryError>;

    async fn query_data(&self, request: backend::QueryDataRequest<Self::Query, Self>) -> Self::Stream {
        let user = request.plugin_context.user.as_ref().map(|u| u.login.clone());
        let authorization = context::authorization_header(&request.headers).map(str::to_string);
        let settings = Arc::new(request.plugin_context.instance_settings);
        let plugin = self.clone();
        Box::pin(
            request
                .queries
                .into_iter()
                .map(move |query| {
                    let plugin = plugin.clone();
                    let settings = Arc::clone(&settings);
                    let user = user.clone();
                    let authorization = authorization.clone();
                    async move {
                        plugin
                            .run_query(
                                (*settings).as_ref(),
                                user.as_deref(),
                                authorization.as_deref(),
                                query,
                            )
                            .await
                    }
                })
                .collect::<FuturesOrdered<_>>(),
        )
    }
}
