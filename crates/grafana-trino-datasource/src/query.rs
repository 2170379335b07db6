//! The query model sent by the datasource's query editor.

use grafana_plugin_sdk::data::VisType;
use serde::{de, Deserialize, Deserializer};

/// How the result of a query should be presented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// A time series; the result must contain a time column.
    TimeSeries,
    /// A table.
    #[default]
    Table,
    /// Log lines.
    Logs,
}

impl Format {
    /// The visualisation Grafana should prefer for this format.
    pub fn visualisation(self) -> VisType {
        match self {
            Self::TimeSeries => VisType::Graph,
            Self::Table => VisType::Table,
            Self::Logs => VisType::Logs,
        }
    }
}

// The editor stores the format as a number; older dashboards used names.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawFormat {
    Number(u8),
    Name(String),
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawFormat::deserialize(deserializer)? {
            RawFormat::Number(0) => Ok(Self::TimeSeries),
            RawFormat::Number(1) => Ok(Self::Table),
            RawFormat::Number(2) => Ok(Self::Logs),
            RawFormat::Number(n) => Err(de::Error::custom(format!("unknown format {n}"))),
            RawFormat::Name(name) => match name.as_str() {
                "time_series" | "timeseries" => Ok(Self::TimeSeries),
                "table" => Ok(Self::Table),
                "logs" => Ok(Self::Logs),
                other => Err(de::Error::unknown_variant(
                    other,
                    &["time_series", "table", "logs"],
                )),
            },
        }
    }
}

/// A single query from a panel.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrinoQuery {
    /// The SQL to run, possibly containing macros.
    #[serde(rename = "rawSQL")]
    pub raw_sql: String,
    /// How to present the result.
    pub format: Format,
}
