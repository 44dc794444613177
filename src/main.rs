//! Portability CLI Entry Point
//!
//! Registers environments, submits tests and queries them. Also hosts
//! the `run-instance` command a single-node instance executes.
//!
//! # Usage
//!
//! ```bash
//! # Register environments
//! portability env add local --schema single-node
//! portability env add platform --schema job-graph --set project_id=project-123 \
//!     --header "Authorization=Bearer $TOKEN"
//! portability env list
//!
//! # Submit a workflow to two environments
//! portability test submit hello.wdl --params inputs.json --env ENV_A --env ENV_B
//!
//! # Query it
//! portability test status TEST_ID
//! portability test logs TEST_ID
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use colored::{ColoredString, Colorize};
use log::{error, info};

use portability::backend::single_node::{
    InstanceContext, InstanceRequest, InstanceRunner, ProcessCompute,
};
use portability::localize::{Fetcher, HttpFetcher};
use portability::model::WorkflowDependency;
use portability::storage::{
    FsKeyValueStore, FsObjectStore, KeyValueStore, NewEnvironment, ObjectStore,
    TableEnvironmentRegistry,
};
use portability::{
    load_config, Backends, CanonicalState, ErrorEnvelope, PortabilityError, ServiceConfig,
    SubmissionRequest, TestCoordinator, WorkflowRequest, APP_NAME, VERSION,
};

/// Default configuration file used when none is specified.
const DEFAULT_CONFIG: &str = "portability.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, PartialEq)]
struct Config {
    config_path: PathBuf,
    data_dir: Option<PathBuf>,
    verbose: bool,
    command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG),
            data_dir: None,
            verbose: false,
            command: Vec::new(),
        }
    }
}

impl Config {
    /// Global arguments a child instance needs to see the same stores.
    fn forwarded_args(&self, data_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            self.config_path.to_string_lossy().into_owned(),
            "--data-dir".to_string(),
            data_dir.to_string_lossy().into_owned(),
        ];
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args
    }
}

/// Positional values and `--name value` options of one command.
#[derive(Debug, Default)]
struct CommandArgs {
    positional: Vec<String>,
    options: Vec<(String, String)>,
}

impl CommandArgs {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            if let Some(name) = arg.strip_prefix("--") {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("--{} requires a value", name))?;
                parsed.options.push((name.to_string(), value.clone()));
            } else {
                parsed.positional.push(arg.clone());
            }
            i += 1;
        }
        Ok(parsed)
    }

    fn all(&self, name: &str) -> Vec<&str> {
        self.options
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn one(&self, name: &str) -> Option<&str> {
        self.all(name).last().copied()
    }

    fn required(&self, name: &str) -> Result<&str, String> {
        self.one(name).ok_or_else(|| format!("--{} is required", name))
    }

    fn positional(&self, index: usize, what: &str) -> Result<&str, String> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| format!("missing {}", what))
    }

    /// `KEY=VALUE` pairs given through a repeatable option.
    fn pairs(&self, name: &str) -> Result<HashMap<String, String>, String> {
        self.all(name)
            .into_iter()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .ok_or_else(|| format!("--{} expects KEY=VALUE, got '{}'", name, pair))
            })
            .collect()
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .target(env_logger::Target::Stderr)
        .init();
}

/// Prints usage information.
fn print_usage() {
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow portability testing across execution backends");
    println!();
    println!("Usage: portability [OPTIONS] <COMMAND>");
    println!();
    println!("Commands:");
    println!("  env add NAME --schema SCHEMA [--base-url URL] [--header K=V]... [--set K=V]...");
    println!("  env list");
    println!("  test submit DESCRIPTOR --params FILE|JSON --env ID... [--dependency FILE]...");
    println!("  test status TEST_ID");
    println!("  test logs TEST_ID");
    println!("  run-instance RUN_ID --instance-id ID --timeout-secs N");
    println!();
    println!("Schemas: wes, single-node, job-graph");
    println!();
    println!("Options:");
    println!("  --config PATH       Configuration file (default: {})", DEFAULT_CONFIG);
    println!("  --data-dir PATH     Override the data directory");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

/// Parses command-line arguments into a Config struct.
///
/// Global options may appear anywhere; everything else belongs to the
/// command.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a path argument".to_string());
                }
                config.config_path = PathBuf::from(&args[i]);
            }
            "--data-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("--data-dir requires a path argument".to_string());
                }
                config.data_dir = Some(PathBuf::from(&args[i]));
            }
            _ => config.command.push(arg.clone()),
        }
        i += 1;
    }

    if config.command.is_empty() {
        return Err("no command given".to_string());
    }
    Ok(config)
}

/// Shared stores and collaborators, all rooted in the data directory.
struct Services {
    config: ServiceConfig,
    store: Arc<dyn KeyValueStore>,
    objects: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn Fetcher>,
    compute: Arc<ProcessCompute>,
}

impl Services {
    fn open(cli: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = load_config(&cli.config_path)?;
        if let Some(dir) = &cli.data_dir {
            config.data_dir = dir.clone();
        }
        info!("Data directory: {}", config.data_dir.display());

        let compute = ProcessCompute::current(
            cli.forwarded_args(&config.data_dir),
            config.data_dir.join("instances"),
        )?;

        Ok(Self {
            store: Arc::new(FsKeyValueStore::new(&config.data_dir)),
            objects: Arc::new(FsObjectStore::new(&config.data_dir)),
            fetcher: Arc::new(HttpFetcher::new()),
            compute: Arc::new(compute),
            config,
        })
    }

    fn coordinator(&self) -> TestCoordinator {
        let backends = Backends::new(
            self.config.clone(),
            self.store.clone(),
            self.objects.clone(),
            self.fetcher.clone(),
            self.compute.clone(),
        );
        TestCoordinator::new(
            Arc::new(TableEnvironmentRegistry::new(self.store.clone())),
            self.store.clone(),
            Arc::new(backends),
            self.config.adapter_timeout(),
        )
    }
}

fn paint(state: CanonicalState) -> ColoredString {
    let text = state.as_str();
    match state {
        CanonicalState::Complete => text.green(),
        CanonicalState::ExecutorError | CanonicalState::SystemError => text.red(),
        CanonicalState::Canceled | CanonicalState::Paused => text.yellow(),
        _ => text.cyan(),
    }
}

/// Reads a file argument, or takes the argument itself when no such
/// file exists.
fn file_or_literal(value: &str) -> Result<String, Box<dyn std::error::Error>> {
    let path = Path::new(value);
    if path.is_file() {
        Ok(fs::read_to_string(path)?)
    } else {
        Ok(value.to_string())
    }
}

async fn env_command(services: &Services, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = services.coordinator();
    let sub = args.first().map(String::as_str).unwrap_or_default();
    let parsed = CommandArgs::parse(args.get(1..).unwrap_or_default())?;

    match sub {
        "add" => {
            let environment = coordinator
                .register_environment(NewEnvironment {
                    name: parsed.positional(0, "environment name")?.to_string(),
                    schema: parsed.required("schema")?.to_string(),
                    base_url: parsed.one("base-url").unwrap_or_default().to_string(),
                    headers: parsed.pairs("header")?,
                    key_values: parsed.pairs("set")?,
                })
                .await?;
            println!("{}", environment.environment_id);
        }
        "list" => {
            for environment in coordinator.list_environments().await? {
                println!(
                    "{}  {:<12} {:<24} {}",
                    environment.environment_id,
                    environment.schema,
                    environment.name,
                    environment.base_url
                );
            }
        }
        other => return Err(format!("unknown env command '{}'", other).into()),
    }
    Ok(())
}

async fn test_command(services: &Services, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = services.coordinator();
    let sub = args.first().map(String::as_str).unwrap_or_default();
    let parsed = CommandArgs::parse(args.get(1..).unwrap_or_default())?;

    match sub {
        "submit" => {
            let descriptor = fs::read_to_string(parsed.positional(0, "workflow descriptor")?)?;
            let params = match parsed.one("params") {
                Some(value) => file_or_literal(value)?,
                None => String::new(),
            };

            let mut workflow = WorkflowRequest::new(descriptor, params);
            for path in parsed.all("dependency") {
                let name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string());
                workflow.workflow_dependencies.push(WorkflowDependency {
                    name,
                    code: fs::read_to_string(path)?,
                });
            }

            let target_environments = parsed.all("env").into_iter().map(String::from).collect();
            let test_id = coordinator
                .submit_test(SubmissionRequest {
                    workflow,
                    target_environments,
                })
                .await?;
            println!("{}", test_id);
        }
        "status" => {
            let status = coordinator
                .get_test_status(parsed.positional(0, "test id")?)
                .await?;
            println!("{}", paint(status.state).bold());
            for result in &status.environment_states {
                println!(
                    "  {}  {:<16} {}",
                    result.environment_id,
                    paint(result.state),
                    result
                        .workflow_id
                        .as_deref()
                        .or(result.message.as_deref())
                        .unwrap_or_default()
                );
            }
        }
        "logs" => {
            let logs = coordinator
                .get_test_log(parsed.positional(0, "test id")?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&logs)?);
        }
        other => return Err(format!("unknown test command '{}'", other).into()),
    }
    Ok(())
}

/// Body of a single-node instance: runs the workflow, then records the
/// outcome and releases the instance.
async fn run_instance(services: &Services, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = CommandArgs::parse(args)?;
    let run_id = parsed.positional(0, "run id")?.to_string();
    let instance_id = parsed.required("instance-id")?.to_string();
    let timeout_secs: u64 = parsed
        .required("timeout-secs")?
        .parse()
        .map_err(|_| "--timeout-secs must be a number of seconds")?;

    let single_node = services.config.single_node.clone();
    let request = InstanceRequest {
        run_id: run_id.clone(),
        instance_type: single_node.instance_type.clone(),
        volume_size_gb: single_node.volume_size_gb,
        timeout: std::time::Duration::from_secs(timeout_secs),
    };
    let context = InstanceContext {
        config: single_node,
        store: services.store.clone(),
        objects: services.objects.clone(),
        fetcher: services.fetcher.clone(),
    };

    info!("Instance {} running {}", instance_id, run_id);
    let state = InstanceRunner::new(context, request, instance_id, services.compute.clone())
        .run()
        .await?;
    info!("Run {} finished: {}", run_id, state);
    Ok(())
}

/// Main application entry point.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    let services = Services::open(&config)?;
    let (command, rest) = config
        .command
        .split_first()
        .ok_or("no command given")?;

    match command.as_str() {
        "env" => env_command(&services, rest).await,
        "test" => test_command(&services, rest).await,
        "run-instance" => run_instance(&services, rest).await,
        other => Err(format!("unknown command '{}'", other).into()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<PortabilityError>() {
                Some(err) => {
                    error!("{}", err);
                    let envelope = ErrorEnvelope::from(err);
                    match serde_json::to_string_pretty(&envelope) {
                        Ok(json) => eprintln!("{}", json),
                        Err(_) => eprintln!("Error: {}", err),
                    }
                }
                None => {
                    eprintln!();
                    eprintln!("Error: {}", e);
                }
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        std::iter::once("portability")
            .chain(line.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_global_options_anywhere() {
        let config = parse_arguments(&args("test status t1 --data-dir /tmp/p --verbose")).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/p")));
        assert!(config.verbose);
        assert_eq!(config.command, vec!["test", "status", "t1"]);
        assert_eq!(config.config_path, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn test_parse_requires_command() {
        assert!(parse_arguments(&args("--verbose")).is_err());
        assert!(parse_arguments(&args("--config")).is_err());
    }

    #[test]
    fn test_command_args() {
        let raw: Vec<String> = "wf.wdl --env a --env b --params {} --set project_id=p-1"
            .split_whitespace()
            .map(String::from)
            .collect();
        let parsed = CommandArgs::parse(&raw).unwrap();
        assert_eq!(parsed.positional(0, "descriptor").unwrap(), "wf.wdl");
        assert_eq!(parsed.all("env"), vec!["a", "b"]);
        assert_eq!(parsed.one("params"), Some("{}"));
        assert_eq!(parsed.pairs("set").unwrap()["project_id"], "p-1");
        assert!(parsed.required("schema").is_err());

        let dangling: Vec<String> = vec!["--env".to_string()];
        assert!(CommandArgs::parse(&dangling).is_err());
    }

    #[test]
    fn test_forwarded_args_point_child_at_same_stores() {
        let config = Config {
            verbose: true,
            ..Default::default()
        };
        let forwarded = config.forwarded_args(Path::new("/data"));
        assert_eq!(
            forwarded,
            vec!["--config", DEFAULT_CONFIG, "--data-dir", "/data", "--verbose"]
        );
    }
}
