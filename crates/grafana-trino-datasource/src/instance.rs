//! Datasource instances and the cache that keeps them alive between requests.
//!
//! Grafana sends the full instance settings with every request. Building a
//! [`Datasource`] means building an HTTP client and a token cache, so instances
//! are kept per datasource uid and only rebuilt when Grafana reports that the
//! settings changed.

use std::{collections::HashMap, sync::Arc};

use chrono::prelude::*;
use grafana_plugin_sdk::data::{Frame, Metadata};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    client::{QueryResult, RowSource, StatementError, TrinoClient},
    context::RequestContext,
    convert::{Converters, FieldKind},
    error::{ConfigError, Error},
    macros,
    query::{Format, TrinoQuery},
    settings::DatasourceSettings,
    transport::Transport,
};

/// Quote an identifier for use in a statement.
fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// One configured Trino datasource.
pub struct Datasource {
    settings: DatasourceSettings,
    rows: Arc<dyn RowSource>,
    converters: Converters,
}

impl std::fmt::Debug for Datasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datasource")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Datasource {
    /// Connect a datasource to the coordinator named in its settings.
    pub fn new(settings: DatasourceSettings) -> Result<Self, ConfigError> {
        let transport = Arc::new(Transport::new(&settings)?);
        let client = TrinoClient::new(&settings, transport)?;
        Ok(Self::with_row_source(settings, Arc::new(client)))
    }

    /// Create a datasource which runs its statements on `rows`.
    pub fn with_row_source(settings: DatasourceSettings, rows: Arc<dyn RowSource>) -> Self {
        Self {
            settings,
            rows,
            converters: Converters::default(),
        }
    }

    /// Extract the identity signals of a request made to this datasource.
    pub fn request_context(
        &self,
        user_login: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<RequestContext, ConfigError> {
        RequestContext::from_request(&self.settings, user_login, authorization)
    }

    /// Run a statement on behalf of a request.
    pub async fn run(&self, ctx: &RequestContext, sql: &str) -> Result<QueryResult, Error> {
        self.rows.query(sql, &ctx.query_args()).await
    }

    /// Run a panel query over the time range `from`..`to`, returning a frame.
    pub async fn query(
        &self,
        ctx: &RequestContext,
        ref_id: &str,
        query: &TrinoQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Frame, Error> {
        let sql = macros::expand(&query.raw_sql, from, to).map_err(StatementError::from)?;
        let result = self.run(ctx, &sql).await?;
        if query.format == Format::TimeSeries
            && !result
                .columns
                .iter()
                .any(|c| self.converters.kind_for(&c.type_name) == FieldKind::Time)
        {
            return Err(StatementError::MissingTimeColumn.into());
        }
        let frame = match query.format {
            Format::TimeSeries => self.converters.to_wide_frame(ref_id, &result),
            Format::Table | Format::Logs => self.converters.to_frame(ref_id, &result),
        }
        .map_err(StatementError::from)?;
        let mut meta = Metadata::default();
        meta.executed_query_string = Some(sql);
        meta.preferred_visualisation = Some(query.format.visualisation());
        Ok(frame.with_metadata(meta))
    }

    /// Check that the coordinator answers queries.
    pub async fn check_health(&self) -> Result<(), Error> {
        self.run(&RequestContext::default(), "SELECT 1").await?;
        Ok(())
    }

    async fn first_column(&self, ctx: &RequestContext, sql: &str) -> Result<Vec<String>, Error> {
        let result = self.run(ctx, sql).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(serde_json::Value::String(s)) => Some(s),
                _ => None,
            })
            .collect())
    }

    /// List the catalogs visible to the request's user.
    pub async fn catalogs(&self, ctx: &RequestContext) -> Result<Vec<String>, Error> {
        self.first_column(ctx, "SHOW CATALOGS").await
    }

    /// List the schemas in a catalog.
    pub async fn schemas(&self, ctx: &RequestContext, catalog: &str) -> Result<Vec<String>, Error> {
        self.first_column(ctx, &format!("SHOW SCHEMAS FROM {}", quote(catalog)))
            .await
    }

    /// List the tables in a schema.
    pub async fn tables(
        &self,
        ctx: &RequestContext,
        catalog: &str,
        schema: &str,
    ) -> Result<Vec<String>, Error> {
        self.first_column(
            ctx,
            &format!("SHOW TABLES FROM {}.{}", quote(catalog), quote(schema)),
        )
        .await
    }

    /// List the columns of a table.
    pub async fn columns(
        &self,
        ctx: &RequestContext,
        catalog: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<String>, Error> {
        self.first_column(
            ctx,
            &format!(
                "SHOW COLUMNS FROM {}.{}.{}",
                quote(catalog),
                quote(schema),
                quote(table)
            ),
        )
        .await
    }
}

/// Keeps one [`Datasource`] per datasource uid.
#[derive(Debug, Default)]
pub struct InstanceManager {
    instances: RwLock<HashMap<String, (DateTime<Utc>, Arc<Datasource>)>>,
}

impl InstanceManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the instance for `uid`, building it with `build` if there is none
    /// or if the cached one predates `updated`.
    ///
    /// Build failures are returned to the caller and not cached.
    pub async fn get_or_build(
        &self,
        uid: &str,
        updated: DateTime<Utc>,
        build: impl FnOnce() -> Result<Datasource, ConfigError>,
    ) -> Result<Arc<Datasource>, ConfigError> {
        if let Some((at, ds)) = self.instances.read().await.get(uid) {
            if *at == updated {
                return Ok(Arc::clone(ds));
            }
        }
        let mut instances = self.instances.write().await;
        // Another request may have rebuilt the instance while we waited.
        if let Some((at, ds)) = instances.get(uid) {
            if *at == updated {
                return Ok(Arc::clone(ds));
            }
            debug!(uid, "Datasource settings changed; rebuilding instance");
        }
        let ds = Arc::new(build()?);
        info!(uid, "Created Trino datasource instance");
        instances.insert(uid.to_string(), (updated, Arc::clone(&ds)));
        Ok(ds)
    }

    /// The number of live instances.
    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Whether no instance has been built yet.
    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}
