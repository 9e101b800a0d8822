// =============================================================================
// Report Schema — UI contract served at /reports/schema
// =============================================================================
//
// The webapp renders whatever this schema declares, so it is validated at
// startup: a malformed column or widget aborts boot instead of crashing the
// frontend at render time. The default schema is generated from the
// contract's aggregation windows.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::contract::ChallengeContract;
use crate::types::JsonMap;

const COLUMN_TYPES: &[&str] = &["MODEL", "VALUE", "USERNAME", "CHART"];
const WIDGET_TYPES: &[&str] = &["CHART", "IFRAME"];

/// One leaderboard column as the frontend expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportLeaderboardColumn {
    pub id: u32,
    #[serde(rename = "type")]
    pub column_type: String,
    pub property: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub tooltip: Option<String>,
    #[serde(rename = "nativeConfiguration", default)]
    pub native_configuration: Option<Value>,
    #[serde(default)]
    pub order: u32,
}

/// One metrics widget (chart or iframe).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetricWidget {
    pub id: u32,
    #[serde(rename = "type")]
    pub widget_type: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub tooltip: Option<String>,
    #[serde(default)]
    pub order: u32,
    #[serde(rename = "endpointUrl")]
    pub endpoint_url: String,
    #[serde(rename = "nativeConfiguration", default)]
    pub native_configuration: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSchema {
    pub schema_version: String,
    pub leaderboard_columns: Vec<ReportLeaderboardColumn>,
    pub metrics_widgets: Vec<ReportMetricWidget>,
}

impl ReportSchema {
    /// Validate the frontend contract. Called once at startup; an error here
    /// is fatal.
    pub fn validate(&self) -> Result<(), String> {
        for column in &self.leaderboard_columns {
            if !COLUMN_TYPES.contains(&column.column_type.as_str()) {
                return Err(format!(
                    "leaderboard column {}: invalid type {:?} (expected one of {:?})",
                    column.id, column.column_type, COLUMN_TYPES
                ));
            }
            if column.property.is_empty() {
                return Err(format!("leaderboard column {}: empty property", column.id));
            }
            if column.display_name.is_empty() {
                return Err(format!("leaderboard column {}: empty displayName", column.id));
            }
        }
        for widget in &self.metrics_widgets {
            if !WIDGET_TYPES.contains(&widget.widget_type.as_str()) {
                return Err(format!(
                    "metrics widget {}: invalid type {:?} (expected one of {:?})",
                    widget.id, widget.widget_type, WIDGET_TYPES
                ));
            }
            if widget.endpoint_url.is_empty() {
                return Err(format!("metrics widget {}: empty endpointUrl", widget.id));
            }
            if widget.display_name.is_empty() {
                return Err(format!("metrics widget {}: empty displayName", widget.id));
            }
        }
        Ok(())
    }
}

/// Generate the default schema from the contract's aggregation windows: one
/// VALUE column per window plus the standard chart widgets.
pub fn auto_report_schema(contract: &ChallengeContract) -> ReportSchema {
    let mut columns = vec![ReportLeaderboardColumn {
        id: 1,
        column_type: "MODEL".into(),
        property: "model_id".into(),
        format: None,
        display_name: "Model".into(),
        tooltip: None,
        native_configuration: Some(json!({"type": "model", "statusProperty": "status"})),
        order: 0,
    }];
    for (i, window) in contract.aggregation.windows.iter().enumerate() {
        columns.push(ReportLeaderboardColumn {
            id: (i + 2) as u32,
            column_type: "VALUE".into(),
            property: window.name.clone(),
            format: Some("decimal-2".into()),
            display_name: title_case(&window.name),
            tooltip: Some(format!("Rolling score over {}h", window.hours)),
            native_configuration: None,
            order: ((i + 1) * 10) as u32,
        });
    }

    let series: Vec<Value> = contract
        .aggregation
        .windows
        .iter()
        .map(|w| json!({"name": w.name, "label": title_case(&w.name)}))
        .collect();

    let metrics_widgets = vec![
        ReportMetricWidget {
            id: 1,
            widget_type: "CHART".into(),
            display_name: "Score Metrics".into(),
            tooltip: None,
            order: 10,
            endpoint_url: "/reports/models/global".into(),
            native_configuration: Some(json!({
                "type": "line",
                "xAxis": {"name": "performed_at"},
                "yAxis": {"series": series, "format": "decimal-2"},
                "displayEvolution": false,
            })),
        },
        ReportMetricWidget {
            id: 2,
            widget_type: "CHART".into(),
            display_name: "Rolling score by parameters".into(),
            tooltip: None,
            order: 20,
            endpoint_url: "/reports/models/params".into(),
            native_configuration: Some(json!({
                "type": "line",
                "xAxis": {"name": "performed_at"},
                "yAxis": {"series": series, "format": "decimal-2"},
                "filterConfig": [
                    {"type": "select", "label": "Subject", "property": "subject", "autoSelectFirst": true},
                    {"type": "select", "label": "Horizon", "property": "horizon", "autoSelectFirst": true},
                ],
                "groupByProperty": "param",
                "displayEvolution": false,
            })),
        },
        ReportMetricWidget {
            id: 3,
            widget_type: "CHART".into(),
            display_name: "Predictions".into(),
            tooltip: None,
            order: 30,
            endpoint_url: "/reports/predictions".into(),
            native_configuration: Some(json!({
                "type": "line",
                "xAxis": {"name": "performed_at"},
                "yAxis": {"series": [{"name": "score_value"}], "format": "decimal-2"},
                "alertConfig": {"reasonField": "score_failed_reason", "field": "score_success"},
                "displayEvolution": false,
            })),
        },
    ];

    ReportSchema {
        schema_version: "1".into(),
        leaderboard_columns: columns,
        metrics_widgets,
    }
}

/// Flatten a windowed metrics map into `score_<window>` columns.
pub fn flatten_metrics(metrics: &JsonMap) -> JsonMap {
    let mut out = JsonMap::new();
    for (key, value) in metrics {
        out.insert(format!("score_{key}"), value.clone());
    }
    out
}

fn title_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Tests
// =============================================================================
