/*! A Grafana backend datasource plugin for [Trino].

The plugin answers three kinds of calls from Grafana:

- data queries, which run SQL (with Grafana's time macros expanded) and return
  the result as a [`Frame`][grafana_plugin_sdk::data::Frame];
- health checks, which run `SELECT 1` against the configured coordinator;
- resource calls under `/catalogs`, `/schemas`, `/tables` and `/columns`, used
  by the query editor to explore the catalog.

Each configured datasource becomes a [`Datasource`] instance, holding an HTTP
[`Transport`][transport::Transport] and, when OAuth is configured, a
[`TokenCache`][token::TokenCache] shared by every request made through that
instance. Per-request identity (impersonated user, forwarded access token and
client tags) travels in a [`RequestContext`][context::RequestContext] and is
sent with each statement, never stored on the instance.

[Trino]: https://trino.io
*/
#![deny(missing_docs)]

use std::sync::Arc;

use grafana_plugin_sdk::{backend::DataSourceInstanceSettings, prelude::*};

pub mod client;
pub mod context;
pub mod convert;
mod data;
mod diagnostics;
pub mod error;
pub mod instance;
pub mod macros;
pub mod query;
mod resource;
pub mod settings;
pub mod token;
pub mod transport;

pub use data::QueryError;
pub use error::{ConfigError, Error, TokenError};
pub use instance::{Datasource, InstanceManager};
pub use resource::ResourceError;
pub use settings::{DatasourceSettings, TrinoJsonData, TrinoSecureJsonData};

/// Instance settings as Grafana sends them to this plugin.
pub type TrinoInstanceSettings = DataSourceInstanceSettings<TrinoJsonData, TrinoSecureJsonData>;

/// The Trino datasource plugin.
#[derive(Clone, Debug, Default, GrafanaPlugin)]
#[grafana_plugin(
    plugin_type = "datasource",
    json_data = "TrinoJsonData",
    secure_json_data = "TrinoSecureJsonData"
)]
pub struct TrinoPlugin {
    instances: Arc<InstanceManager>,
}

impl TrinoPlugin {
    /// Create a plugin with no datasource instances.
    pub fn new() -> Self {
        Self::default()
    }

    /// The datasource instance a request was made to.
    ///
    /// Instances are built on first use and rebuilt whenever Grafana reports
    /// that their settings changed.
    pub async fn datasource(
        &self,
        settings: Option<&TrinoInstanceSettings>,
    ) -> Result<Arc<Datasource>, ConfigError> {
        let settings = settings.ok_or(ConfigError::MissingInstanceSettings)?;
        self.instances
            .get_or_build(&settings.uid, settings.updated, || {
                Datasource::new(DatasourceSettings::from_instance(settings)?)
            })
            .await
    }
}
