//! Suite driver: runs a list of scripts and writes the results summary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::SuiteError;
use crate::logging::LogFile;
use crate::plugins::PluginRegistry;
use crate::scheduler::{ScriptOutcome, TestRunner};
use crate::script::Script;
use crate::status::{InstructionStatus, ScriptStatus, Status, StatusReporter, TestStatus};

pub const RUN_LOG_FILE: &str = "CTF_Log_File.log";
pub const SUMMARY_FILE: &str = "results_summary.txt";
pub const SUMMARY_JSON_FILE: &str = "results_summary.json";

const SUMMARY_HEADER: &str = "Status | Time (s) | Verification Number | Requirement Verified | Test Run | Test Passed | Test Failed | Test Error | Script";

/// Expand files and directories into a sorted list of `*.json` scripts.
pub fn collect_scripts(paths: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    let mut scripts = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            collect_dir(path, &mut found)?;
            found.sort();
            scripts.extend(found);
        } else {
            scripts.push(path.clone());
        }
    }
    Ok(scripts)
}

fn collect_dir(dir: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_dir(&path, found)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            found.push(path);
        }
    }
    Ok(())
}

fn script_status(script: &Script) -> ScriptStatus {
    ScriptStatus {
        path: script.path.display().to_string(),
        status: Status::Waiting,
        tests: script
            .tests
            .iter()
            .map(|test| TestStatus {
                test_number: test.case_number.clone(),
                status: Status::Waiting,
                instructions: test
                    .instructions
                    .iter()
                    .map(|instruction| InstructionStatus {
                        instruction: instruction.kind.clone(),
                        status: if instruction.disabled {
                            Status::Disabled
                        } else {
                            Status::Waiting
                        },
                        details: String::new(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Ver_Num")]
    verification_number: &'a str,
    #[serde(rename = "Req_Num")]
    requirements: String,
    #[serde(rename = "Test_Run")]
    run: usize,
    #[serde(rename = "Test_Passed")]
    passed: usize,
    #[serde(rename = "Test_Failed")]
    failed: usize,
    #[serde(rename = "Test_Error")]
    errors: usize,
    #[serde(rename = "Script")]
    script: &'a str,
}

impl<'a> From<&'a ScriptOutcome> for SummaryRow<'a> {
    fn from(outcome: &'a ScriptOutcome) -> Self {
        Self {
            status: outcome.status.title(),
            time: format!("{:.2}", outcome.elapsed),
            verification_number: &outcome.verification_number,
            requirements: outcome.requirements.join(", "),
            run: outcome.num_run(),
            passed: outcome.num_passed(),
            failed: outcome.num_failed(),
            errors: outcome.num_error(),
            script: &outcome.script,
        }
    }
}

#[derive(Debug, Serialize)]
struct SummaryJson<'a> {
    #[serde(rename = "Test_Results")]
    results: Vec<SummaryRow<'a>>,
}

/// Plain-text summary table, one row per script.
pub fn format_summary(results: &[ScriptOutcome]) -> String {
    let mut text = String::from(SUMMARY_HEADER);
    text.push('\n');
    for outcome in results {
        let row = SummaryRow::from(outcome);
        text.push_str(&format!(
            "{:<6} | {:<8} | {:<19} | {:<20} | {:<8} | {:<11} | {:<11} | {:<10} | {}\n",
            row.status,
            row.time,
            row.verification_number,
            row.requirements,
            row.run,
            row.passed,
            row.failed,
            row.errors,
            row.script
        ));
    }
    text
}

/// Write `results_summary.txt` and, when asked, `results_summary.json` into `dir`.
pub fn write_summary(dir: &Path, results: &[ScriptOutcome], json: bool) -> Result<(), SuiteError> {
    fs::write(dir.join(SUMMARY_FILE), format_summary(results))?;
    if json {
        let summary = SummaryJson {
            results: results.iter().map(SummaryRow::from).collect(),
        };
        fs::write(
            dir.join(SUMMARY_JSON_FILE),
            serde_json::to_string_pretty(&summary)?,
        )?;
    }
    Ok(())
}

/// Results of a whole run.
#[derive(Debug, Clone)]
pub struct SuiteSummary {
    pub run_dir: PathBuf,
    pub results: Vec<ScriptOutcome>,
}

impl SuiteSummary {
    pub fn passed(&self) -> bool {
        self.results.iter().all(ScriptOutcome::passed)
    }
}

fn create_dir(path: &Path) -> Result<(), SuiteError> {
    fs::create_dir_all(path).map_err(|source| SuiteError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Owns the plugins and status reporting for one run.
#[derive(Debug)]
pub struct SuiteRunner {
    config: Arc<Config>,
    registry: PluginRegistry,
    status: StatusReporter,
    log_file: Option<LogFile>,
}

impl SuiteRunner {
    pub fn new(config: Arc<Config>, status: StatusReporter) -> Self {
        Self {
            registry: PluginRegistry::new(Arc::clone(&config)),
            config,
            status,
            log_file: None,
        }
    }

    /// Tee the run log and each script's log to files under the run directory.
    pub fn with_log_file(mut self, log_file: LogFile) -> Self {
        self.log_file = Some(log_file);
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PluginRegistry {
        &mut self.registry
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    fn switch_log(&self, path: &Path) {
        if let Some(log_file) = &self.log_file {
            if let Err(e) = log_file.switch(path) {
                warn!("Unable to write log file {}: {}", path.display(), e);
            }
        }
    }

    /// Create `Run_<timestamp>/logs` under the results directory.
    pub fn prepare_run_dir(&self) -> Result<PathBuf, SuiteError> {
        let stamp = chrono::Local::now().format("%m_%d_%Y_%H_%M_%S");
        let run_dir = self
            .config
            .logging
            .results_output_dir
            .join(format!("Run_{}", stamp));
        create_dir(&run_dir.join("logs"))?;
        Ok(run_dir)
    }

    /// Load and run every script, then write the summary.
    pub async fn run(&mut self, paths: &[PathBuf]) -> Result<SuiteSummary, SuiteError> {
        let run_dir = self.prepare_run_dir()?;
        let run_log = run_dir.join(RUN_LOG_FILE);
        self.switch_log(&run_log);
        info!("CTF run directory: {}", run_dir.display());

        let scripts: Vec<Result<Script, String>> = paths
            .iter()
            .map(|path| {
                Script::load(path).map_err(|e| {
                    error!("Failed to load script {}: {}", path.display(), e);
                    path.file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string())
                })
            })
            .collect();

        self.status.begin_suite(scripts.iter().map(|script| match script {
            Ok(script) => script_status(script),
            Err(name) => ScriptStatus {
                path: name.clone(),
                status: Status::Error,
                tests: Vec::new(),
            },
        }));
        self.registry.initialize();

        let mut results = Vec::with_capacity(scripts.len());
        let count = scripts.len();
        for (index, script) in scripts.iter().enumerate() {
            let outcome = match script {
                Ok(script) => self.run_script(index, script, &run_dir).await?,
                Err(name) => ScriptOutcome::error(name.clone()),
            };
            self.status.script(index, outcome.status);
            results.push(outcome);

            if index + 1 < count && self.config.core.delay_between_scripts > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(self.config.core.delay_between_scripts)).await;
            }
        }

        self.registry.shutdown().await;
        let summary = SuiteSummary { run_dir, results };
        self.status.end_suite(Status::from_result(summary.passed()));
        write_summary(&summary.run_dir, &summary.results, self.config.logging.json_results)?;
        info!("Results written to {}", summary.run_dir.join(SUMMARY_FILE).display());
        Ok(summary)
    }

    async fn run_script(
        &mut self,
        index: usize,
        script: &Script,
        run_dir: &Path,
    ) -> Result<ScriptOutcome, SuiteError> {
        let stamp = chrono::Utc::now().timestamp();
        let log_dir = run_dir.join("logs").join(format!("{}_{}", script.stem(), stamp));
        create_dir(&log_dir)?;
        self.switch_log(&log_dir.join(format!("{}.log", script.stem())));
        self.status.script(index, Status::Active);
        info!("Running script {}", script.path.display());

        let mut ctx = ExecutionContext::new();
        ctx.script_log_dir = Some(log_dir);
        let outcome = TestRunner::new(&mut self.registry, &self.config.core, &mut self.status)
            .run_script(script, &mut ctx)
            .await;

        if self.config.core.reset_plugins_between_scripts {
            self.registry.shutdown().await;
            self.registry.initialize();
        }
        self.switch_log(&run_dir.join(RUN_LOG_FILE));
        Ok(outcome)
    }
}
