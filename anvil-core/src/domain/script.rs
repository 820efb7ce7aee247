//! Training program inputs
//!
//! A job either brings its own program or asks the orchestrator to
//! synthesize one from a dataset schema, an algorithm and a cleaning
//! configuration.

use serde::{Deserialize, Serialize};

/// Where the training program comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptSource {
    /// User-authored program, used verbatim
    Source(String),
    Synthesize(SynthesisSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisSpec {
    pub schema: DatasetSchema,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub cleaning: CleaningConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSchema {
    pub columns: Vec<ColumnSpec>,
    pub target: String,
}

impl DatasetSchema {
    pub fn target_column(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == self.target)
    }

    /// Feature columns of one kind, excluding the target
    pub fn features_of(&self, kind: ColumnKind) -> impl Iterator<Item = &ColumnSpec> {
        self.columns
            .iter()
            .filter(move |c| c.kind == kind && c.name != self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Numeric,
    Categorical,
    Boolean,
    Text,
    Datetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RandomForest,
    GradientBoosting,
    LogisticRegression,
    LinearRegression,
    NeuralNetwork,
}

impl Algorithm {
    pub fn supports(self, task: TaskKind) -> bool {
        !matches!(
            (self, task),
            (Algorithm::LogisticRegression, TaskKind::Regression)
                | (Algorithm::LinearRegression, TaskKind::Classification)
        )
    }
}

/// Classification vs. regression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Classification,
    Regression,
}

impl TaskKind {
    /// Derives the kind from a free-form task type string
    pub fn from_task_type(task_type: &str) -> Self {
        let task = task_type.to_ascii_lowercase();
        if task.contains("regress") || task.contains("forecast") {
            TaskKind::Regression
        } else {
            TaskKind::Classification
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericNullStrategy {
    Drop,
    Mean,
    #[default]
    Median,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalNullStrategy {
    Drop,
    #[default]
    Mode,
    /// Replace with the literal category "missing"
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleaningConfig {
    #[serde(default)]
    pub numeric_nulls: NumericNullStrategy,
    #[serde(default)]
    pub categorical_nulls: CategoricalNullStrategy,
    /// IQR multiplier for clipping numeric outliers; `None` disables clipping
    #[serde(default)]
    pub clip_outliers: Option<f64>,
    #[serde(default = "default_true")]
    pub drop_duplicates: bool,
    #[serde(default)]
    pub drop_columns: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            numeric_nulls: NumericNullStrategy::default(),
            categorical_nulls: CategoricalNullStrategy::default(),
            clip_outliers: None,
            drop_duplicates: true,
            drop_columns: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_from_task_type() {
        assert_eq!(TaskKind::from_task_type("Regression"), TaskKind::Regression);
        assert_eq!(TaskKind::from_task_type("sales_forecast"), TaskKind::Regression);
        assert_eq!(TaskKind::from_task_type("binary_classification"), TaskKind::Classification);
        assert_eq!(TaskKind::from_task_type("cnn"), TaskKind::Classification);
    }

    #[test]
    fn test_algorithm_task_compatibility() {
        assert!(!Algorithm::LogisticRegression.supports(TaskKind::Regression));
        assert!(!Algorithm::LinearRegression.supports(TaskKind::Classification));
        assert!(Algorithm::RandomForest.supports(TaskKind::Regression));
        assert!(Algorithm::NeuralNetwork.supports(TaskKind::Classification));
    }

    #[test]
    fn test_script_source_wire_format() {
        let user: ScriptSource = serde_json::from_str(r#"{"source":"print('hi')"}"#).unwrap();
        assert_eq!(user, ScriptSource::Source("print('hi')".to_string()));

        let synth: ScriptSource = serde_json::from_str(
            r#"{"synthesize":{"schema":{"columns":[{"name":"y","kind":"categorical"}],"target":"y"},"algorithm":"random_forest"}}"#,
        )
        .unwrap();
        match synth {
            ScriptSource::Synthesize(spec) => {
                assert_eq!(spec.algorithm, Algorithm::RandomForest);
                assert!(spec.cleaning.drop_duplicates);
                assert_eq!(spec.cleaning.numeric_nulls, NumericNullStrategy::Median);
            }
            other => panic!("unexpected source: {:?}", other),
        }
    }
}
