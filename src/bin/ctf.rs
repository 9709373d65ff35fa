use clap::{App, Arg, ArgMatches};
use colored::*;
use ctf::config::Config;
use ctf::logging::{self, LogFile};
use ctf::plugins::PluginRegistry;
use ctf::status::{Status, StatusReporter};
use ctf::suite::{collect_scripts, SuiteRunner, SuiteSummary};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const DEFAULT_CONFIG: &str = "configs/default_config.toml";

const EXIT_PASSED: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    let matches = App::new("ctf")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("🛰️  CCSDS flight software test framework")
        .arg(
            Arg::with_name("scripts")
                .help("Test scripts, or directories of *.json scripts")
                .multiple(true)
                .index(1),
        )
        .arg(
            Arg::with_name("config_file")
                .long("config_file")
                .value_name("FILE")
                .help("Configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .value_name("PORT")
                .help("UDP port on 127.0.0.1 that receives JSON status updates")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("pluginInfo")
                .long("pluginInfo")
                .value_name("DIR")
                .help("Write a JSON description of every plugin into DIR and exit")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("script_dir")
                .long("script_dir")
                .value_name("DIR")
                .help("Directory of test scripts to run")
                .takes_value(true),
        )
        .get_matches();

    std::process::exit(run(&matches).await);
}

async fn run(matches: &ArgMatches<'_>) -> i32 {
    let config_path = Path::new(matches.value_of("config_file").unwrap_or(DEFAULT_CONFIG));
    let config = match Config::from_file(config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
            return EXIT_ERROR;
        }
    };

    let log_file = LogFile::new();
    if let Err(e) = logging::init(&config.logging.log_level, log_file.clone()) {
        eprintln!("{} Failed to initialize logging: {}", "⚠️".yellow(), e);
    }

    if let Some(dir) = matches.value_of("pluginInfo") {
        return match PluginRegistry::new(config).write_plugin_info(Path::new(dir)) {
            Ok(()) => {
                println!("{} Plugin info written to {}", "✅".green(), dir.bright_white());
                EXIT_PASSED
            }
            Err(e) => {
                eprintln!("{} Failed to write plugin info: {}", "❌".red(), e);
                EXIT_ERROR
            }
        };
    }

    let mut inputs: Vec<PathBuf> = matches
        .values_of("scripts")
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default();
    if let Some(dir) = matches.value_of("script_dir") {
        inputs.push(PathBuf::from(dir));
    }
    let scripts = match collect_scripts(&inputs) {
        Ok(scripts) => scripts,
        Err(e) => {
            eprintln!("{} Failed to read scripts: {}", "❌".red(), e);
            return EXIT_ERROR;
        }
    };
    if scripts.is_empty() {
        eprintln!("{} {}", "❌".red(), "No test scripts given".bright_red());
        return EXIT_ERROR;
    }

    let status = match matches.value_of("port").and_then(|port| port.parse::<u16>().ok()) {
        Some(port) => StatusReporter::bind(port).await.unwrap_or_else(|e| {
            warn!("Status updates disabled: {}", e);
            StatusReporter::disabled()
        }),
        None => StatusReporter::disabled(),
    };

    let mut runner = SuiteRunner::new(config, status).with_log_file(log_file);
    match runner.run(&scripts).await {
        Ok(summary) => {
            print_summary(&summary);
            if summary.passed() {
                EXIT_PASSED
            } else {
                EXIT_FAILED
            }
        }
        Err(e) => {
            eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
            EXIT_ERROR
        }
    }
}

fn print_summary(summary: &SuiteSummary) {
    println!();
    println!("{}", "📋 Test Results".bright_white().bold());
    println!("{}", "═".repeat(60).bright_blue());
    for outcome in &summary.results {
        let status = match outcome.status {
            Status::Passed => "PASS".green(),
            Status::Failed | Status::Aborted => "FAIL".red(),
            _ => "ERROR".yellow(),
        };
        println!(
            "  {:<5} {:<40} {:>3}/{:<3} passed  {:>7.2}s",
            status,
            outcome.script.bright_white(),
            outcome.num_passed(),
            outcome.num_run(),
            outcome.elapsed
        );
    }
    println!("{}", "═".repeat(60).bright_blue());
    println!("  Results: {}", summary.run_dir.display().to_string().bright_cyan());
    if summary.passed() {
        println!("{} {}", "✅".green(), "All scripts passed".bright_green());
    } else {
        println!("{} {}", "❌".red(), "Some scripts failed".bright_red());
    }
}
