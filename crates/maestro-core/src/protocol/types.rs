//! Envelope payload types.
//!
//! Each wire `phase` maps onto one variant of [`PhaseData`]. Fields are
//! defaulted so that a structurally sound but incomplete payload still
//! decodes; missing required content is reported by the validators instead.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Decoded envelope payload, keyed by the wire `phase` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "data", rename_all = "snake_case")]
pub enum PhaseData {
    Analysis(AnalysisData),
    TaskList(TaskListData),
    Progress(ProgressData),
    Completion(CompletionData),
    Aggregation(AggregationData),
    Verification(VerificationData),
}

impl PhaseData {
    /// Wire name of this payload's phase.
    pub const fn phase_name(&self) -> &'static str {
        match self {
            Self::Analysis(_) => "analysis",
            Self::TaskList(_) => "task_list",
            Self::Progress(_) => "progress",
            Self::Completion(_) => "completion",
            Self::Aggregation(_) => "aggregation",
            Self::Verification(_) => "verification",
        }
    }
}

/// Wire phase names accepted by the decoder.
pub const KNOWN_PHASES: &[&str] = &[
    "analysis",
    "task_list",
    "progress",
    "completion",
    "aggregation",
    "verification",
];

/// Estimated difficulty reported by the analysis phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisData {
    pub summary: String,
    #[serde(alias = "recommendedTaskCount", alias = "recommended_splits")]
    pub recommended_task_count: Option<u32>,
    #[serde(alias = "keyFiles")]
    pub key_files: Vec<String>,
    #[serde(deserialize_with = "lenient_complexity")]
    pub complexity: Complexity,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskListData {
    pub tasks: Vec<TaskSpec>,
    #[serde(alias = "parallelizableGroups")]
    pub parallelizable_groups: Option<Vec<Vec<String>>>,
}

/// One planned task as emitted by the planning agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    pub description: String,
    pub scope: Vec<String>,
    pub priority: Option<i32>,
    #[serde(alias = "depends_on", alias = "dependsOn")]
    pub dependencies: Vec<String>,
    #[serde(alias = "estimatedTokens")]
    pub estimated_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressData {
    pub progress: Option<f64>,
    #[serde(alias = "currentAction", alias = "current_step")]
    pub current_action: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionData {
    pub success: bool,
    pub summary: String,
    pub output: Option<String>,
    #[serde(alias = "files_modified", alias = "outputFiles", alias = "filesModified")]
    pub output_files: Vec<String>,
    pub error: Option<String>,
}

impl Default for CompletionData {
    fn default() -> Self {
        Self {
            success: true,
            summary: String::new(),
            output: None,
            output_files: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationData {
    pub summary: String,
    pub conflicts: Vec<String>,
    #[serde(alias = "mergedOutput", alias = "merged_output")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationData {
    pub passed: bool,
    pub summary: String,
    pub issues: Vec<String>,
}

/// Outcome of scanning one piece of text for an envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    /// Both markers were present.
    pub found: bool,
    /// Declared `phase`, when the payload was JSON with a string `phase`.
    pub phase: Option<String>,
    /// Decoded payload; `None` when decoding failed.
    pub data: Option<PhaseData>,
    /// The raw JSON between the markers (kept for diagnostics).
    pub raw: Option<String>,
    /// Decode failure, if any.
    pub error: Option<String>,
    /// Per-phase validation violations.
    pub violations: Vec<String>,
    pub text_before: String,
    pub text_after: String,
}

impl ParsedResponse {
    pub(crate) fn not_found(text: &str) -> Self {
        Self {
            text_before: text.to_string(),
            ..Self::default()
        }
    }

    /// Found, decoded and free of violations.
    pub fn is_valid(&self) -> bool {
        self.found && self.data.is_some() && self.error.is_none() && self.violations.is_empty()
    }

    /// Found but not decodable.
    pub fn is_invalid(&self) -> bool {
        self.found && self.data.is_none()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn lenient_complexity<'de, D>(deserializer: D) -> Result<Complexity, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value.as_str().map(str::to_ascii_lowercase).as_deref() {
        Some("low" | "simple" | "easy") => Complexity::Low,
        Some("high" | "complex" | "hard") => Complexity::High,
        _ => Complexity::Medium,
    })
}
