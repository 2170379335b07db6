use grafana_trino::TrinoPlugin;

#[grafana_plugin_sdk::main(services(data, diagnostics, resource), init_subscriber = true)]
async fn plugin() -> TrinoPlugin {
    TrinoPlugin::new()
}
