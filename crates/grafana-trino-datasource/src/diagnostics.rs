//! Health checks and metrics.

use grafana_plugin_sdk::backend;
use tracing::warn;

use crate::TrinoPlugin;

#[backend::async_trait]
impl backend::DiagnosticsService for TrinoPlugin {
    type CheckHealthError = std::convert::Infallible;

    async fn check_health(
        &self,
        request: backend::CheckHealthRequest<Self>,
    ) -> Result<backend::CheckHealthResponse, Self::CheckHealthError> {
        let settings = request.plugin_context.instance_settings.as_ref();
        let result = match self.datasource(settings).await {
            Ok(datasource) => datasource.check_health().await,
            Err(e) => Err(e.into()),
        };
        Ok(match result {
            Ok(()) => backend::CheckHealthResponse::ok("Data source is working".to_string()),
            Err(e) => {
                warn!(error = %e, "Health check failed");
                backend::CheckHealthResponse::error(e.to_string())
            }
        })
    }

    type CollectMetricsError = std::convert::Infallible;

    async fn collect_metrics(
        &self,
        _request: backend::CollectMetricsRequest<Self>,
    ) -> Result<backend::CollectMetricsResponse, Self::CollectMetricsError> {
        Ok(backend::CollectMetricsResponse::new(None))
    }
}
