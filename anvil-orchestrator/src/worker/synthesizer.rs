//! Script Synthesizer
//!
//! Turns a dataset schema, an algorithm and a cleaning configuration into a
//! self-contained Python training program, or passes a user-authored program
//! through untouched.
//!
//! Hyperparameters are never baked into the generated text: the program reads
//! `EPOCHS`, `BATCH_SIZE`, `LEARNING_RATE` and `N_ESTIMATORS` from its
//! environment and falls back to per-algorithm defaults.

use anvil_core::domain::estimate::DEFAULT_EPOCHS;
use anvil_core::domain::script::{
    Algorithm, CategoricalNullStrategy, CleaningConfig, ColumnKind, NumericNullStrategy,
    ScriptSource, SynthesisSpec, TaskKind,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    #[error("training script is empty")]
    EmptySource,

    #[error("target column '{0}' is not part of the dataset schema")]
    MissingTarget(String),

    #[error("target column '{0}' is listed in dropColumns")]
    TargetDropped(String),

    #[error("{algorithm} does not support {task} tasks")]
    UnsupportedAlgorithm { algorithm: &'static str, task: &'static str },

    #[error("schema has no usable feature columns")]
    NoFeatures,
}

/// Resolves the program a job will run
pub fn resolve(source: &ScriptSource, task_type: &str) -> Result<String, SynthesisError> {
    match source {
        ScriptSource::Source(program) if program.trim().is_empty() => Err(SynthesisError::EmptySource),
        ScriptSource::Source(program) => Ok(program.clone()),
        ScriptSource::Synthesize(spec) => synthesize(spec, TaskKind::from_task_type(task_type)),
    }
}

/// Generates a training program for `task`
pub fn synthesize(spec: &SynthesisSpec, task: TaskKind) -> Result<String, SynthesisError> {
    let schema = &spec.schema;
    let cleaning = &spec.cleaning;

    if schema.target_column().is_none() {
        return Err(SynthesisError::MissingTarget(schema.target.clone()));
    }
    if cleaning.drop_columns.contains(&schema.target) {
        return Err(SynthesisError::TargetDropped(schema.target.clone()));
    }
    if !spec.algorithm.supports(task) {
        return Err(SynthesisError::UnsupportedAlgorithm {
            algorithm: algorithm_name(spec.algorithm),
            task: task_name(task),
        });
    }

    let kept = |kind: ColumnKind| -> Vec<&str> {
        schema
            .features_of(kind)
            .map(|c| c.name.as_str())
            .filter(|name| !cleaning.drop_columns.iter().any(|d| d == name))
            .collect()
    };
    let numeric = kept(ColumnKind::Numeric);
    let datetime = kept(ColumnKind::Datetime);
    let mut categorical = kept(ColumnKind::Categorical);
    categorical.extend(kept(ColumnKind::Boolean));

    if numeric.is_empty() && datetime.is_empty() && categorical.is_empty() {
        return Err(SynthesisError::NoFeatures);
    }

    let mut py = String::new();
    py.push_str(&header(spec, task));
    py.push_str(&settings(spec, &numeric, &datetime, &categorical));
    py.push_str(LOAD);
    py.push_str(&preprocess(cleaning));
    py.push_str(&build_model(spec.algorithm, task));
    py.push_str(&train(task));
    py.push_str(&main_block(task));
    Ok(py)
}

fn algorithm_name(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::RandomForest => "random_forest",
        Algorithm::GradientBoosting => "gradient_boosting",
        Algorithm::LogisticRegression => "logistic_regression",
        Algorithm::LinearRegression => "linear_regression",
        Algorithm::NeuralNetwork => "neural_network",
    }
}

fn task_name(task: TaskKind) -> &'static str {
    match task {
        TaskKind::Classification => "classification",
        TaskKind::Regression => "regression",
    }
}

/// Python string literal; JSON string syntax is a subset of Python's
fn py_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn py_list(items: &[&str]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| py_str(s)).collect();
    format!("[{}]", quoted.join(", "))
}

fn py_bool(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

fn header(spec: &SynthesisSpec, task: TaskKind) -> String {
    let (model_import, metric_import) = match (spec.algorithm, task) {
        (Algorithm::RandomForest, TaskKind::Classification) => {
            ("from sklearn.ensemble import RandomForestClassifier", CLASSIFICATION_METRICS)
        }
        (Algorithm::RandomForest, TaskKind::Regression) => {
            ("from sklearn.ensemble import RandomForestRegressor", REGRESSION_METRICS)
        }
        (Algorithm::GradientBoosting, TaskKind::Classification) => (
            "from sklearn.ensemble import GradientBoostingClassifier",
            CLASSIFICATION_METRICS,
        ),
        (Algorithm::GradientBoosting, TaskKind::Regression) => {
            ("from sklearn.ensemble import GradientBoostingRegressor", REGRESSION_METRICS)
        }
        (Algorithm::LogisticRegression, _) => (
            "from sklearn.linear_model import LogisticRegression",
            CLASSIFICATION_METRICS,
        ),
        (Algorithm::LinearRegression, _) => {
            ("from sklearn.linear_model import LinearRegression", REGRESSION_METRICS)
        }
        (Algorithm::NeuralNetwork, TaskKind::Classification) => {
            ("from sklearn.neural_network import MLPClassifier", CLASSIFICATION_METRICS)
        }
        (Algorithm::NeuralNetwork, TaskKind::Regression) => {
            ("from sklearn.neural_network import MLPRegressor", REGRESSION_METRICS)
        }
    };
    let label_import = match task {
        TaskKind::Classification => "from sklearn.preprocessing import LabelEncoder\n",
        TaskKind::Regression => "",
    };

    format!(
        r#"#!/usr/bin/env python3
"""Generated {algorithm} {task} program for target {target}."""
import glob
import json
import os
import sys

import joblib
import numpy as np
import pandas as pd
from sklearn.compose import ColumnTransformer
from sklearn.impute import SimpleImputer
from sklearn.model_selection import train_test_split
from sklearn.pipeline import Pipeline
from sklearn.preprocessing import OneHotEncoder, StandardScaler
{label_import}{metric_import}
{model_import}

"#,
        algorithm = algorithm_name(spec.algorithm),
        task = task_name(task),
        target = py_str(&spec.schema.target),
    )
}

const CLASSIFICATION_METRICS: &str =
    "from sklearn.metrics import accuracy_score, f1_score, precision_score, recall_score";
const REGRESSION_METRICS: &str =
    "from sklearn.metrics import mean_absolute_error, mean_squared_error, r2_score";

fn settings(spec: &SynthesisSpec, numeric: &[&str], datetime: &[&str], categorical: &[&str]) -> String {
    let learning_rate = match spec.algorithm {
        Algorithm::NeuralNetwork => "0.001",
        _ => "0.1",
    };

    format!(
        r#"DATASET_PATH = os.environ.get("DATASET_PATH", "dataset")
OUTPUT_DIR = os.environ.get("OUTPUT_DIR", "output")

EPOCHS = int(os.environ.get("EPOCHS", "{epochs}"))
BATCH_SIZE = int(os.environ.get("BATCH_SIZE", "32"))
LEARNING_RATE = float(os.environ.get("LEARNING_RATE", "{learning_rate}"))
N_ESTIMATORS = int(os.environ.get("N_ESTIMATORS", "100"))

TARGET = {target}
NUMERIC_FEATURES = {numeric}
DATETIME_FEATURES = {datetime}
CATEGORICAL_FEATURES = {categorical}
DROP_COLUMNS = {drop}

"#,
        epochs = DEFAULT_EPOCHS,
        learning_rate = learning_rate,
        target = py_str(&spec.schema.target),
        numeric = py_list(numeric),
        datetime = py_list(datetime),
        categorical = py_list(categorical),
        drop = py_list(
            &spec
                .cleaning
                .drop_columns
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
        ),
    )
}

const LOAD: &str = r#"def load():
    path = DATASET_PATH
    if os.path.isdir(path):
        candidates = sorted(
            glob.glob(os.path.join(path, "**", "*.csv"), recursive=True)
            + glob.glob(os.path.join(path, "**", "*.parquet"), recursive=True)
        )
        if not candidates:
            print(f"No .csv or .parquet file found under {path}", file=sys.stderr)
            sys.exit(1)
        path = candidates[0]
    if path.endswith(".parquet"):
        df = pd.read_parquet(path)
    else:
        df = pd.read_csv(path)
    print(f"Loaded {len(df)} rows and {len(df.columns)} columns from {path}")
    return df


"#;

fn preprocess(cleaning: &CleaningConfig) -> String {
    let numeric_nulls = match cleaning.numeric_nulls {
        NumericNullStrategy::Drop => {
            "    df = df.dropna(subset=[c for c in NUMERIC_FEATURES + DATETIME_FEATURES if c in df.columns])\n"
                .to_string()
        }
        NumericNullStrategy::Mean => fill_numeric("df[col].mean()"),
        NumericNullStrategy::Median => fill_numeric("df[col].median()"),
        NumericNullStrategy::Zero => fill_numeric("0"),
    };
    let categorical_nulls = match cleaning.categorical_nulls {
        CategoricalNullStrategy::Drop => {
            "    df = df.dropna(subset=[c for c in CATEGORICAL_FEATURES if c in df.columns])\n".to_string()
        }
        CategoricalNullStrategy::Mode => r#"    for col in CATEGORICAL_FEATURES:
        if col in df.columns:
            mode = df[col].mode()
            if not mode.empty:
                df[col] = df[col].fillna(mode.iloc[0])
"#
        .to_string(),
        CategoricalNullStrategy::Constant => r#"    for col in CATEGORICAL_FEATURES:
        if col in df.columns:
            df[col] = df[col].fillna("missing")
"#
        .to_string(),
    };
    let clip = match cleaning.clip_outliers {
        Some(k) => format!(
            r#"    for col in NUMERIC_FEATURES:
        if col in df.columns:
            q1, q3 = df[col].quantile(0.25), df[col].quantile(0.75)
            iqr = q3 - q1
            df[col] = df[col].clip(q1 - {k} * iqr, q3 + {k} * iqr)
"#,
            k = k
        ),
        None => String::new(),
    };
    let dedupe = if cleaning.drop_duplicates {
        "    before = len(df)\n    df = df.drop_duplicates()\n    print(f\"Dropped {before - len(df)} duplicate rows\")\n"
    } else {
        ""
    };

    format!(
        r#"def preprocess(df):
    df = df.drop(columns=[c for c in DROP_COLUMNS if c in df.columns])
    if TARGET not in df.columns:
        print(f"Target column {{TARGET}} not found in dataset", file=sys.stderr)
        sys.exit(1)
    df = df.dropna(subset=[TARGET])
{dedupe}    for col in DATETIME_FEATURES:
        if col in df.columns:
            parsed = pd.to_datetime(df[col], errors="coerce")
            df[col] = (parsed - pd.Timestamp("1970-01-01")) / pd.Timedelta(seconds=1)
    for col in NUMERIC_FEATURES:
        if col in df.columns:
            df[col] = pd.to_numeric(df[col], errors="coerce")
{numeric_nulls}{categorical_nulls}{clip}    for col in CATEGORICAL_FEATURES:
        if col in df.columns:
            df[col] = df[col].astype(str)
    print(f"{{len(df)}} rows after cleaning")
    return df


"#,
        dedupe = dedupe,
        numeric_nulls = numeric_nulls,
        categorical_nulls = categorical_nulls,
        clip = clip,
    )
}

fn fill_numeric(value: &str) -> String {
    format!(
        r#"    for col in NUMERIC_FEATURES + DATETIME_FEATURES:
        if col in df.columns:
            df[col] = df[col].fillna({})
"#,
        value
    )
}

fn build_model(algorithm: Algorithm, task: TaskKind) -> String {
    let constructor = match (algorithm, task) {
        (Algorithm::RandomForest, TaskKind::Classification) => {
            "RandomForestClassifier(n_estimators=N_ESTIMATORS, random_state=42, n_jobs=-1)"
        }
        (Algorithm::RandomForest, TaskKind::Regression) => {
            "RandomForestRegressor(n_estimators=N_ESTIMATORS, random_state=42, n_jobs=-1)"
        }
        (Algorithm::GradientBoosting, TaskKind::Classification) => {
            "GradientBoostingClassifier(n_estimators=N_ESTIMATORS, learning_rate=LEARNING_RATE, random_state=42)"
        }
        (Algorithm::GradientBoosting, TaskKind::Regression) => {
            "GradientBoostingRegressor(n_estimators=N_ESTIMATORS, learning_rate=LEARNING_RATE, random_state=42)"
        }
        (Algorithm::LogisticRegression, _) => "LogisticRegression(max_iter=1000)",
        (Algorithm::LinearRegression, _) => "LinearRegression()",
        (Algorithm::NeuralNetwork, TaskKind::Classification) => {
            "MLPClassifier(hidden_layer_sizes=(128, 64), max_iter=EPOCHS, batch_size=BATCH_SIZE, learning_rate_init=LEARNING_RATE, random_state=42)"
        }
        (Algorithm::NeuralNetwork, TaskKind::Regression) => {
            "MLPRegressor(hidden_layer_sizes=(128, 64), max_iter=EPOCHS, batch_size=BATCH_SIZE, learning_rate_init=LEARNING_RATE, random_state=42)"
        }
    };

    format!("def build_model():\n    return {}\n\n\n", constructor)
}

fn train(task: TaskKind) -> String {
    let (encode, metrics) = match task {
        TaskKind::Classification => (
            "    encoder = LabelEncoder()\n    y = encoder.fit_transform(y.astype(str))\n",
            r#"    metrics = {
        "accuracy": float(accuracy_score(y_test, predictions)),
        "f1": float(f1_score(y_test, predictions, average="weighted", zero_division=0)),
        "precision": float(precision_score(y_test, predictions, average="weighted", zero_division=0)),
        "recall": float(recall_score(y_test, predictions, average="weighted", zero_division=0)),
        "classes": int(len(encoder.classes_)),
    }
"#,
        ),
        TaskKind::Regression => (
            "    y = pd.to_numeric(y, errors=\"coerce\")\n    mask = y.notna()\n    X, y = X[mask], y[mask]\n",
            r#"    metrics = {
        "r2": float(r2_score(y_test, predictions)),
        "mae": float(mean_absolute_error(y_test, predictions)),
        "rmse": float(np.sqrt(mean_squared_error(y_test, predictions))),
    }
"#,
        ),
    };

    format!(
        r#"def train(df):
    numeric = [c for c in NUMERIC_FEATURES + DATETIME_FEATURES if c in df.columns]
    categorical = [c for c in CATEGORICAL_FEATURES if c in df.columns]
    X = df[numeric + categorical]
    y = df[TARGET]
{encode}
    X_train, X_test, y_train, y_test = train_test_split(X, y, test_size=0.2, random_state=42)

    preprocessor = ColumnTransformer(
        [
            ("num", Pipeline([("impute", SimpleImputer(strategy="median")), ("scale", StandardScaler())]), numeric),
            ("cat", Pipeline([("impute", SimpleImputer(strategy="most_frequent")), ("encode", OneHotEncoder(handle_unknown="ignore"))]), categorical),
        ]
    )
    model = Pipeline([("preprocess", preprocessor), ("model", build_model())])
    model.fit(X_train, y_train)
    predictions = model.predict(X_test)

{metrics}    metrics["train_rows"] = int(len(X_train))
    metrics["test_rows"] = int(len(X_test))
    return model, metrics


"#,
        encode = encode,
        metrics = metrics,
    )
}

fn main_block(task: TaskKind) -> String {
    let headline = match task {
        TaskKind::Classification => r#"    print(f"accuracy: {metrics['accuracy']:.4f}")"#,
        TaskKind::Regression => r#"    print(f"r2: {metrics['r2']:.4f}")"#,
    };

    format!(
        r#"def main():
    os.makedirs(OUTPUT_DIR, exist_ok=True)
    print("phase: load")
    df = load()
    print("phase: preprocess")
    df = preprocess(df)
    if len(df) < 2:
        print("Not enough rows left after cleaning", file=sys.stderr)
        sys.exit(1)
    print("phase: train")
    model, metrics = train(df)

    joblib.dump(model, os.path.join(OUTPUT_DIR, "model.joblib"))
    with open(os.path.join(OUTPUT_DIR, "metrics.json"), "w") as f:
        json.dump(metrics, f, indent=2)
{headline}


if __name__ == "__main__":
    main()
"#,
        headline = headline
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::domain::script::{ColumnSpec, DatasetSchema};

    fn spec(algorithm: Algorithm) -> SynthesisSpec {
        SynthesisSpec {
            schema: DatasetSchema {
                columns: vec![
                    ColumnSpec { name: "age".to_string(), kind: ColumnKind::Numeric },
                    ColumnSpec { name: "city".to_string(), kind: ColumnKind::Categorical },
                    ColumnSpec { name: "notes".to_string(), kind: ColumnKind::Text },
                    ColumnSpec { name: "churned".to_string(), kind: ColumnKind::Boolean },
                ],
                target: "churned".to_string(),
            },
            algorithm,
            cleaning: CleaningConfig::default(),
        }
    }

    #[test]
    fn test_user_source_passes_through() {
        let source = ScriptSource::Source("print('hello')\n".to_string());
        assert_eq!(resolve(&source, "classification").unwrap(), "print('hello')\n");
    }

    #[test]
    fn test_empty_user_source_is_rejected() {
        let source = ScriptSource::Source("  \n".to_string());
        assert_eq!(resolve(&source, "classification"), Err(SynthesisError::EmptySource));
    }

    #[test]
    fn test_classification_program() {
        let program = synthesize(&spec(Algorithm::RandomForest), TaskKind::Classification).unwrap();

        assert!(program.contains("RandomForestClassifier(n_estimators=N_ESTIMATORS"));
        assert!(program.contains("LabelEncoder"));
        assert!(program.contains(r#"print(f"accuracy: {metrics['accuracy']:.4f}")"#));
        assert!(program.contains(r#"TARGET = "churned""#));
        assert!(program.contains(r#"NUMERIC_FEATURES = ["age"]"#));
        // Text columns are not features; the target is never a feature
        assert!(program.contains(r#"CATEGORICAL_FEATURES = ["city"]"#));
        assert!(program.contains("def load():"));
        assert!(program.contains("def preprocess(df):"));
        assert!(program.contains("def train(df):"));
    }

    #[test]
    fn test_regression_program() {
        let mut spec = spec(Algorithm::GradientBoosting);
        spec.schema.target = "age".to_string();
        let program = synthesize(&spec, TaskKind::Regression).unwrap();

        assert!(program.contains("GradientBoostingRegressor"));
        assert!(program.contains("r2_score"));
        assert!(!program.contains("LabelEncoder"));
        assert!(program.contains(r#"print(f"r2: {metrics['r2']:.4f}")"#));
    }

    #[test]
    fn test_hyperparameters_come_from_environment() {
        let program = synthesize(&spec(Algorithm::NeuralNetwork), TaskKind::Classification).unwrap();

        assert!(program.contains(r#"EPOCHS = int(os.environ.get("EPOCHS", "10"))"#));
        assert!(program.contains(r#"LEARNING_RATE = float(os.environ.get("LEARNING_RATE", "0.001"))"#));
        assert!(program.contains("max_iter=EPOCHS, batch_size=BATCH_SIZE"));
    }

    #[test]
    fn test_cleaning_options() {
        let mut spec = spec(Algorithm::RandomForest);
        spec.cleaning = CleaningConfig {
            numeric_nulls: NumericNullStrategy::Zero,
            categorical_nulls: CategoricalNullStrategy::Constant,
            clip_outliers: Some(1.5),
            drop_duplicates: false,
            drop_columns: vec!["notes".to_string()],
        };
        let program = synthesize(&spec, TaskKind::Classification).unwrap();

        assert!(program.contains("df[col].fillna(0)"));
        assert!(program.contains(r#"df[col].fillna("missing")"#));
        assert!(program.contains("q1 - 1.5 * iqr"));
        assert!(!program.contains("drop_duplicates()"));
        assert!(program.contains(r#"DROP_COLUMNS = ["notes"]"#));
    }

    #[test]
    fn test_column_names_are_quoted() {
        let mut spec = spec(Algorithm::RandomForest);
        spec.schema.columns[0].name = r#"weird "name""#.to_string();
        let program = synthesize(&spec, TaskKind::Classification).unwrap();
        assert!(program.contains(r#"NUMERIC_FEATURES = ["weird \"name\""]"#));
    }

    #[test]
    fn test_invalid_specs() {
        let mut missing = spec(Algorithm::RandomForest);
        missing.schema.target = "nope".to_string();
        assert_eq!(
            synthesize(&missing, TaskKind::Classification),
            Err(SynthesisError::MissingTarget("nope".to_string()))
        );

        let mut dropped = spec(Algorithm::RandomForest);
        dropped.cleaning.drop_columns = vec!["churned".to_string()];
        assert!(matches!(
            synthesize(&dropped, TaskKind::Classification),
            Err(SynthesisError::TargetDropped(_))
        ));

        assert!(matches!(
            synthesize(&spec(Algorithm::LinearRegression), TaskKind::Classification),
            Err(SynthesisError::UnsupportedAlgorithm { .. })
        ));

        let mut featureless = spec(Algorithm::RandomForest);
        featureless.cleaning.drop_columns = vec!["age".to_string(), "city".to_string()];
        assert_eq!(
            synthesize(&featureless, TaskKind::Classification),
            Err(SynthesisError::NoFeatures)
        );
    }

    #[test]
    fn test_task_type_selects_kind() {
        let source = ScriptSource::Synthesize(spec(Algorithm::RandomForest));
        let mut regression = spec(Algorithm::RandomForest);
        regression.schema.target = "age".to_string();

        assert!(resolve(&source, "binary_classification").unwrap().contains("RandomForestClassifier"));
        assert!(resolve(&ScriptSource::Synthesize(regression), "Regression")
            .unwrap()
            .contains("RandomForestRegressor"));
    }
}
