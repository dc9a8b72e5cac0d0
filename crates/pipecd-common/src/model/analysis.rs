use serde::{Deserialize, Serialize};

/// Last successful analysis of an application
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisResult {
    /// Unix seconds when the successful analysis started
    pub start_time: i64,
}

/// Saved query window of an analysis so a resumed stage can reuse it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisMetadata {
    pub deployment_id: String,
    pub start_time: i64,
}
