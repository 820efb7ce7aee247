//! Worker Bootstrap Generator
//!
//! The program the instance runs at boot. It is built as an ordered list of
//! named phases, each with its commands, the worker phase it reports and a
//! failure policy, and only then serialized to a bash startup script.
//!
//! Whatever happens after dependency installation, a single cleanup handler
//! uploads artifacts, writes exactly one terminal status document and
//! deletes the instance as its very last action. Before installation a
//! smaller exit handler does the same minus the uploads, so an instance
//! never outlives its job.

use anvil_core::domain::status::WorkerPhase;
use uuid::Uuid;

const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance";
const VENV: &str = "/opt/anvil/venv";
const CPU_PACKAGES: &str = "numpy pandas scikit-learn joblib pyarrow";
const GPU_PACKAGES: &str = "torch torchvision";

/// Inputs of one bootstrap program
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    pub job_id: Uuid,
    pub script_uri: String,
    pub dataset_uri: String,
    pub status_uri: String,
    /// Prefix artifacts are uploaded under; ends with `/`
    pub output_uri: String,
    /// Hyperparameter overrides, only for explicitly set values
    pub env: Vec<(&'static str, String)>,
    pub gpu: bool,
}

/// What a failing phase does to the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnFailure {
    /// Record the message and exit; cleanup writes the failed status
    Abort { error: &'static str },
    /// Keep going; the exit code decides the terminal status
    RecordExitCode,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: &'static str,
    /// Status written before the phase runs
    pub reports: Option<WorkerPhase>,
    pub commands: Vec<String>,
    pub on_failure: OnFailure,
    /// Installs the full cleanup handler once the phase succeeds
    pub registers_cleanup: bool,
}

/// Steps of the exit handler, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    UploadArtifacts,
    WriteTerminalStatus,
    SelfDelete,
}

#[derive(Debug, Clone)]
pub struct BootstrapProgram {
    ctx: BootstrapContext,
    phases: Vec<Phase>,
    cleanup: Vec<CleanupStep>,
}

impl BootstrapProgram {
    pub fn new(ctx: BootstrapContext) -> Self {
        let phases = vec![
            Phase {
                name: "install_dependencies",
                reports: None,
                commands: install_commands(ctx.gpu),
                on_failure: OnFailure::Abort {
                    error: "DependencyInstallError: failed to install runtime dependencies",
                },
                registers_cleanup: true,
            },
            Phase {
                name: "announce",
                reports: Some(WorkerPhase::Installing),
                commands: Vec::new(),
                on_failure: OnFailure::Ignore,
                registers_cleanup: false,
            },
            Phase {
                name: "fetch_script",
                reports: Some(WorkerPhase::DownloadingScript),
                commands: vec![r#"fetch "$SCRIPT_URI" "$WORK_DIR/train.py""#.to_string()],
                on_failure: OnFailure::Abort {
                    error: "DownloadError: could not fetch the training script",
                },
                registers_cleanup: false,
            },
            Phase {
                name: "fetch_dataset",
                reports: Some(WorkerPhase::DownloadingDataset),
                commands: dataset_commands(),
                on_failure: OnFailure::Abort {
                    error: "DownloadError: could not fetch the dataset",
                },
                registers_cleanup: false,
            },
            Phase {
                name: "train",
                reports: Some(WorkerPhase::Training),
                commands: train_commands(&ctx.env),
                on_failure: OnFailure::RecordExitCode,
                registers_cleanup: false,
            },
            Phase {
                name: "extract_metrics",
                reports: None,
                commands: vec![EXTRACT_METRICS.to_string()],
                on_failure: OnFailure::Ignore,
                registers_cleanup: false,
            },
        ];

        Self {
            ctx,
            phases,
            cleanup: vec![
                CleanupStep::UploadArtifacts,
                CleanupStep::WriteTerminalStatus,
                CleanupStep::SelfDelete,
            ],
        }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn cleanup_steps(&self) -> &[CleanupStep] {
        &self.cleanup
    }

    /// Serializes the program to a bash startup script
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "#!/bin/bash\n# anvil worker bootstrap for job {}\nset -uo pipefail\n\n",
            self.ctx.job_id
        ));
        out.push_str(&format!("JOB_ID={}\n", sh_quote(&self.ctx.job_id.to_string())));
        out.push_str(&format!("SCRIPT_URI={}\n", sh_quote(&self.ctx.script_uri)));
        out.push_str(&format!("DATASET_URI={}\n", sh_quote(&self.ctx.dataset_uri)));
        out.push_str(&format!("STATUS_URI={}\n", sh_quote(&self.ctx.status_uri)));
        out.push_str(&format!("OUTPUT_URI={}\n", sh_quote(&self.ctx.output_uri)));
        out.push_str(&format!("CURRENT_PHASE={}\n", WorkerPhase::Installing.as_str()));
        out.push_str(PRELUDE);
        out.push_str(&self_delete_function());
        out.push_str(EARLY_CLEANUP);
        out.push_str(&self.render_cleanup());

        out.push_str("\ntrap 'exit 143' TERM INT\ntrap early_cleanup EXIT\n\n");

        for phase in &self.phases {
            out.push_str(&render_phase(phase));
        }

        out.push_str("exit 0\n");
        out
    }

    fn render_cleanup(&self) -> String {
        let mut body = String::from(
            "cleanup() {\n  local code=$?\n  if [ \"$CLEANUP_DONE\" = \"1\" ]; then return; fi\n  CLEANUP_DONE=1\n  set +e\n",
        );
        for step in &self.cleanup {
            body.push_str(match step {
                CleanupStep::UploadArtifacts => UPLOAD_ARTIFACTS,
                CleanupStep::WriteTerminalStatus => WRITE_TERMINAL_STATUS,
                CleanupStep::SelfDelete => "  self_delete\n",
            });
        }
        body.push_str("}\n");
        body
    }
}

fn render_phase(phase: &Phase) -> String {
    let mut out = format!("# phase: {}\n", phase.name);
    // Phases that report nothing keep the last reported phase for failures
    if let Some(reported) = phase.reports {
        out.push_str(&format!(
            "CURRENT_PHASE={phase}\nreport {phase}\n",
            phase = reported.as_str()
        ));
    }

    if !phase.commands.is_empty() {
        out.push_str(&format!("phase_{}() {{\n", phase.name));
        for command in &phase.commands {
            out.push_str(&format!("  {} || return $?\n", command));
        }
        out.push_str("}\n");

        match &phase.on_failure {
            OnFailure::Abort { error } => out.push_str(&format!(
                "if ! phase_{}; then fail {}; fi\n",
                phase.name,
                sh_quote(error)
            )),
            OnFailure::RecordExitCode => out.push_str(&format!(
                "phase_{name}\nTRAINING_EXIT=$?\nif [ \"$TRAINING_EXIT\" != \"0\" ]; then\n  FAILURE_MESSAGE=\"ExecutionError: training program exited with code $TRAINING_EXIT\"\nfi\n",
                name = phase.name
            )),
            OnFailure::Ignore => out.push_str(&format!("phase_{} || true\n", phase.name)),
        }
    }

    if phase.registers_cleanup {
        out.push_str("trap cleanup EXIT\n");
    }
    out.push('\n');
    out
}

fn install_commands(gpu: bool) -> Vec<String> {
    let mut commands = vec![
        "export DEBIAN_FRONTEND=noninteractive".to_string(),
        "apt-get update -qq".to_string(),
        "apt-get install -y -qq python3-venv python3-pip curl unzip".to_string(),
        format!("python3 -m venv {}", VENV),
        format!("{}/bin/pip install --quiet --upgrade pip", VENV),
        format!("{}/bin/pip install --quiet {}", VENV, CPU_PACKAGES),
    ];
    if gpu {
        commands.push(
            "for _ in $(seq 1 60); do nvidia-smi >/dev/null 2>&1 && break; sleep 10; done".to_string(),
        );
        commands.push("nvidia-smi".to_string());
        commands.push(format!("{}/bin/pip install --quiet {}", VENV, GPU_PACKAGES));
    }
    commands
}

fn dataset_commands() -> Vec<String> {
    vec![
        r#"mkdir -p "$DATASET_DIR""#.to_string(),
        r#"case "${DATASET_URI%%\?*}" in
    *.zip) fetch "$DATASET_URI" "$WORK_DIR/dataset.zip" && unzip -q -o "$WORK_DIR/dataset.zip" -d "$DATASET_DIR" ;;
    *.tar.gz|*.tgz) fetch "$DATASET_URI" "$WORK_DIR/dataset.tar.gz" && tar -xzf "$WORK_DIR/dataset.tar.gz" -C "$DATASET_DIR" ;;
    *) fetch "$DATASET_URI" "$DATASET_DIR/$(basename "${DATASET_URI%%\?*}")" ;;
  esac"#
            .to_string(),
    ]
}

fn train_commands(env: &[(&'static str, String)]) -> Vec<String> {
    let mut commands = vec![
        r#"cd "$WORK_DIR""#.to_string(),
        r#"export DATASET_PATH="$DATASET_DIR""#.to_string(),
        r#"export OUTPUT_DIR="$OUTPUT_DIR""#.to_string(),
    ];
    for (key, value) in env {
        commands.push(format!("export {}={}", key, sh_quote(value)));
    }
    commands.push(format!(r#"{}/bin/python train.py > "$LOG_FILE" 2>&1"#, VENV));
    commands
}

/// Single-quotes a value for bash
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

const PRELUDE: &str = r#"
WORK_DIR="/opt/anvil/job"
DATASET_DIR="$WORK_DIR/dataset"
OUTPUT_DIR="$WORK_DIR/output"
LOG_FILE="$WORK_DIR/training.log"
FAILURE_MESSAGE=""
TRAINING_EXIT=""
CLEANUP_DONE=0

mkdir -p "$WORK_DIR" "$DATASET_DIR" "$OUTPUT_DIR"

json_escape() {
  local s="$1"
  s="${s//\\/\\\\}"
  s="${s//\"/\\\"}"
  s="${s//$'\n'/\\n}"
  s="${s//$'\r'/}"
  s="${s//$'\t'/\\t}"
  printf '"%s"' "$s"
}

write_status() {
  local status="$1" phase="$2" error="${3:-}" body
  body="{\"status\":$(json_escape "$status"),\"phase\":$(json_escape "$phase")"
  if [ "$status" != "running" ]; then
    body="$body,\"completedAt\":\"$(date -u +%Y-%m-%dT%H:%M:%SZ)\""
  fi
  if [ -n "$error" ]; then
    body="$body,\"error\":$(json_escape "$error")"
  fi
  printf '%s}' "$body" > "$WORK_DIR/status.json"
  gsutil -q -h "Content-Type:application/json" cp "$WORK_DIR/status.json" "$STATUS_URI" \
    || echo "warning: could not write status to $STATUS_URI" >&2
}

report() {
  write_status running "$1"
}

fail() {
  FAILURE_MESSAGE="$1"
  exit 1
}

fetch() {
  case "$1" in
    gs://*) gsutil -q cp "$1" "$2" ;;
    http://*|https://*) curl -fsSL --retry 3 -o "$2" "$1" ;;
    *) cp "$1" "$2" ;;
  esac
}

"#;

const EARLY_CLEANUP: &str = r#"early_cleanup() {
  local code=$?
  if [ "$CLEANUP_DONE" = "1" ]; then return; fi
  CLEANUP_DONE=1
  set +e
  write_status failed "$CURRENT_PHASE" "${FAILURE_MESSAGE:-Bootstrap exited with code $code during $CURRENT_PHASE}"
  self_delete
}

"#;

/// Deletes the instance through the API, powering off if that fails
fn self_delete_function() -> String {
    format!(
        r#"self_delete() {{
  local name zone
  name=$(curl -fs -H "Metadata-Flavor: Google" "{metadata}/name")
  zone=$(curl -fs -H "Metadata-Flavor: Google" "{metadata}/zone")
  zone="${{zone##*/}}"
  if [ -n "$name" ] && [ -n "$zone" ] \
    && gcloud compute instances delete "$name" --zone "$zone" --quiet; then
    return 0
  fi
  shutdown -h now
}}

"#,
        metadata = METADATA_URL
    )
}

const UPLOAD_ARTIFACTS: &str = r#"  if [ -z "$FAILURE_MESSAGE" ] && [ "$code" = "0" ]; then
    report uploading_artifacts
  fi
  if [ -f "$LOG_FILE" ]; then
    gsutil -q cp "$LOG_FILE" "${OUTPUT_URI}training.log" || echo "warning: log upload failed" >&2
  fi
  if [ -n "$(ls -A "$OUTPUT_DIR" 2>/dev/null)" ]; then
    gsutil -q -m cp -r "$OUTPUT_DIR"/* "$OUTPUT_URI" || echo "warning: artifact upload failed" >&2
  fi
"#;

const WRITE_TERMINAL_STATUS: &str = r#"  if [ -z "$FAILURE_MESSAGE" ] && [ "$code" != "0" ]; then
    FAILURE_MESSAGE="Bootstrap exited with code $code during $CURRENT_PHASE"
  fi
  if [ -z "$FAILURE_MESSAGE" ] && [ "$TRAINING_EXIT" = "0" ]; then
    write_status completed completed
  else
    write_status failed "$CURRENT_PHASE" "${FAILURE_MESSAGE:-ExecutionError: training did not run}"
  fi
"#;

const EXTRACT_METRICS: &str = r#"if [ ! -f "$OUTPUT_DIR/metrics.json" ] && [ -f "$LOG_FILE" ]; then
    acc=$(grep -Eio 'accuracy[[:space:]]*[:=][[:space:]]*[0-9]*\.?[0-9]+' "$LOG_FILE" | tail -n1 | grep -Eo '[0-9]*\.?[0-9]+$')
    r2=$(grep -Eio '(^|[^a-z0-9_])r2[[:space:]]*[:=][[:space:]]*-?[0-9]*\.?[0-9]+' "$LOG_FILE" | tail -n1 | grep -Eo -e '-?[0-9]*\.?[0-9]+$')
    metrics=""
    if [ -n "$acc" ]; then
      acc=$(LC_ALL=C printf '%.10g' "$acc")
      metrics="\"accuracy\": $acc"
    fi
    if [ -n "$r2" ]; then
      r2=$(LC_ALL=C printf '%.10g' "$r2")
      if [ -n "$metrics" ]; then metrics="$metrics, "; fi
      metrics="$metrics\"r2\": $r2"
    fi
    if [ -n "$metrics" ]; then printf '{%s}\n' "$metrics" > "$OUTPUT_DIR/metrics.json"; fi
  fi"#;

/// Renders the bootstrap for a context
pub fn render(ctx: BootstrapContext) -> String {
    BootstrapProgram::new(ctx).render()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(env: Vec<(&'static str, String)>, gpu: bool) -> BootstrapContext {
        BootstrapContext {
            job_id: Uuid::nil(),
            script_uri: "gs://bucket/jobs/p/j/script.py".to_string(),
            dataset_uri: "gs://bucket/datasets/data.tar.gz".to_string(),
            status_uri: "gs://bucket/jobs/p/j/status.json".to_string(),
            output_uri: "gs://bucket/jobs/p/j/output/".to_string(),
            env,
            gpu,
        }
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack
            .find(needle)
            .unwrap_or_else(|| panic!("missing {:?}", needle))
    }

    #[test]
    fn test_phase_order() {
        let program = BootstrapProgram::new(ctx(Vec::new(), false));
        let names: Vec<&str> = program.phases().iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "install_dependencies",
                "announce",
                "fetch_script",
                "fetch_dataset",
                "train",
                "extract_metrics"
            ]
        );
        assert!(program.phases()[0].registers_cleanup);
        assert_eq!(program.phases()[1].reports, Some(WorkerPhase::Installing));
        assert_eq!(program.phases()[4].on_failure, OnFailure::RecordExitCode);
    }

    #[test]
    fn test_cleanup_self_deletes_last() {
        let program = BootstrapProgram::new(ctx(Vec::new(), false));
        assert_eq!(program.cleanup_steps().last(), Some(&CleanupStep::SelfDelete));

        let script = render(ctx(Vec::new(), false));
        let cleanup = &script[position(&script, "\ncleanup() {")..];
        let cleanup = &cleanup[..position(cleanup, "\n}\n")];
        assert!(cleanup.trim_end().ends_with("self_delete"));
        assert!(position(cleanup, "gsutil -q -m cp -r") < position(cleanup, "write_status completed"));
    }

    #[test]
    fn test_traps_bracket_installation() {
        let script = render(ctx(Vec::new(), false));

        let early = position(&script, "trap early_cleanup EXIT");
        let install = position(&script, "if ! phase_install_dependencies");
        let full = position(&script, "trap cleanup EXIT");
        let installing = position(&script, "report installing");
        let fetch = position(&script, "report downloading_script");

        assert!(early < install);
        assert!(install < full);
        assert!(full < installing);
        assert!(installing < fetch);
    }

    #[test]
    fn test_cleanup_runs_once() {
        let script = render(ctx(Vec::new(), false));
        assert!(script.contains("trap 'exit 143' TERM INT"));
        assert_eq!(script.matches(r#"if [ "$CLEANUP_DONE" = "1" ]; then return; fi"#).count(), 2);
    }

    #[test]
    fn test_only_set_hyperparameters_are_exported() {
        let script = render(ctx(vec![("EPOCHS", "20".to_string())], false));
        assert!(script.contains("export EPOCHS='20' || return $?"));
        assert!(!script.contains("export BATCH_SIZE"));
        assert!(!script.contains("export LEARNING_RATE"));
        assert!(!script.contains("export N_ESTIMATORS"));
    }

    #[test]
    fn test_training_output_is_captured() {
        let script = render(ctx(Vec::new(), false));
        assert!(script.contains(r#"/opt/anvil/venv/bin/python train.py > "$LOG_FILE" 2>&1"#));
        assert!(script.contains("TRAINING_EXIT=$?"));
    }

    #[test]
    fn test_gpu_waits_for_driver() {
        let cpu = render(ctx(Vec::new(), false));
        let gpu = render(ctx(Vec::new(), true));
        assert!(!cpu.contains("nvidia-smi"));
        assert!(gpu.contains("nvidia-smi"));
        assert!(gpu.contains("torch"));
    }

    #[test]
    fn test_failures_carry_worker_phase_names() {
        let script = render(ctx(Vec::new(), false));
        assert!(script.contains("CURRENT_PHASE=installing\n"));
        assert!(script.contains("CURRENT_PHASE=downloading_script\nreport downloading_script\n"));
        assert!(script.contains("CURRENT_PHASE=training\nreport training\n"));

        let program = BootstrapProgram::new(ctx(Vec::new(), false));
        for phase in program.phases() {
            assert!(!script.contains(&format!("CURRENT_PHASE={}\n", phase.name)));
        }

        // Metric extraction runs after training and must not relabel it
        let training = position(&script, "CURRENT_PHASE=training");
        assert!(!script[training + 1..].contains("CURRENT_PHASE="));
    }

    #[test]
    fn test_metric_extraction_writes_valid_json() {
        let dir = std::env::temp_dir().join(format!("anvil-metrics-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = dir.join("training.log");
        std::fs::write(&log, "epoch 1\naccuracy=.5\nvalidation r2: -.3\n").unwrap();

        let status = std::process::Command::new("bash")
            .arg("-c")
            .arg(EXTRACT_METRICS)
            .env("LOG_FILE", &log)
            .env("OUTPUT_DIR", &dir)
            .status()
            .unwrap();
        assert!(status.success());

        let written = std::fs::read(dir.join("metrics.json")).unwrap();
        std::fs::remove_dir_all(&dir).ok();
        let metrics: serde_json::Value = serde_json::from_slice(&written).unwrap();
        assert_eq!(metrics["accuracy"], serde_json::json!(0.5));
        assert_eq!(metrics["r2"], serde_json::json!(-0.3));
    }

    #[test]
    fn test_values_are_shell_quoted() {
        let mut context = ctx(Vec::new(), false);
        context.dataset_uri = "https://example.com/it's.csv".to_string();
        let script = render(context);
        assert!(script.contains(r#"DATASET_URI='https://example.com/it'\''s.csv'"#));
        assert!(script.contains(&format!("{}/name", METADATA_URL)));
    }
}
