//! rucio-workflow: make a catalog aware of files already on storage.
//!
//! The workflow creates an open dataset, registers replicas for existing
//! physical files, attaches them to the dataset and closes it, tolerating
//! the benign races a shared catalog produces along the way.
//!
//! # Modules
//!
//! - [`did`]: Data identifiers and scope resolution
//! - [`validation`]: Input validators and the settings report
//! - [`files`]: File records and replica registration
//! - [`dataset`]: Dataset lifecycle operations
//! - [`workflow`]: The four-step orchestrator and its result
//! - [`catalog`]: The catalog contract and its backends
//! - [`config`]: Runtime settings
//! - [`error`]: Error types

pub mod catalog;
pub mod config;
pub mod dataset;
pub mod did;
pub mod error;
pub mod files;
pub mod validation;
pub mod workflow;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use walkdir::WalkDir;

use catalog::memory::InMemoryCatalog;
use catalog::{Catalog, Metadata};
use config::{validate_settings, CatalogSettings, Overrides, Settings};
use dataset::DatasetService;
use did::Did;
use files::{FileRecord, FileService, FileSpec};
use workflow::{FileInput, WorkflowOrchestrator, WorkflowRequest};

pub use error::WorkflowError;

/// The rucio-workflow CLI application.
#[derive(Parser)]
#[command(name = "rucio-workflow")]
#[command(version, author, about)]
#[command(propagate_version = true)]
struct Cli {
    /// YAML settings file.
    #[arg(long, global = true, env = "RUCIO_WORKFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Work against an empty in-memory catalog instead of the server.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Settings that can come from flags or the environment.
#[derive(clap::Args)]
struct SettingsArgs {
    /// Catalog server URL.
    #[arg(long, global = true, env = "RUCIO_RUCIO_HOST")]
    rucio_host: Option<String>,

    /// Authentication server URL.
    #[arg(long, global = true, env = "RUCIO_AUTH_HOST")]
    auth_host: Option<String>,

    #[arg(long, global = true, env = "RUCIO_AUTH_TYPE")]
    auth_type: Option<String>,

    #[arg(long, global = true, env = "RUCIO_ACCOUNT")]
    account: Option<String>,

    #[arg(long, global = true, env = "RUCIO_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Request timeout in seconds.
    #[arg(long, global = true, env = "RUCIO_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    #[arg(long, global = true, env = "RUCIO_MAX_RETRIES")]
    max_retries: Option<u32>,

    #[arg(long, global = true, env = "RUCIO_DEFAULT_RSE")]
    default_rse: Option<String>,

    #[arg(long, global = true, env = "RUCIO_DEFAULT_SCOPE")]
    default_scope: Option<String>,

    /// Replicas per registration call.
    #[arg(long = "default-batch-size", global = true, env = "RUCIO_BATCH_SIZE")]
    batch_size: Option<usize>,

    #[arg(
        long,
        global = true,
        env = "RUCIO_ENABLE_DETAILED_LOGGING",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    detailed_logging: Option<bool>,
}

impl SettingsArgs {
    fn into_overrides(self) -> Overrides {
        Overrides {
            rucio_host: self.rucio_host,
            auth_host: self.auth_host,
            auth_type: self.auth_type,
            account: self.account,
            auth_token: self.auth_token,
            request_timeout_secs: self.request_timeout,
            max_retries: self.max_retries,
            default_rse: self.default_rse,
            default_scope: self.default_scope,
            batch_size: self.batch_size,
            detailed_logging: self.detailed_logging,
        }
    }
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create a new, open dataset.
    CreateDataset(CreateDatasetArgs),
    /// Close a dataset.
    CloseDataset(DatasetNameArg),
    /// Mark a dataset for deletion by shortening its lifetime.
    DeleteDataset(DeleteDatasetArgs),
    /// Register replicas for files already on storage.
    RegisterFiles(RegisterFilesArgs),
    /// Attach existing files to a dataset.
    AttachFiles(AttachFilesArgs),
    /// Run the complete create, register, attach and close workflow.
    ExecuteWorkflow(ExecuteWorkflowArgs),
    /// Show dataset metadata or contents.
    ListDataset(ListDatasetArgs),
    /// Check that a dataset is closed and holds the expected files.
    Verify(VerifyArgs),
    /// Show or validate the effective configuration.
    Config(ConfigArgs),
}

#[derive(clap::Args)]
struct DatasetNameArg {
    /// Dataset name as 'scope:name' or dotted 'scope.name'.
    dataset: String,
}

#[derive(clap::Args)]
struct CreateDatasetArgs {
    /// Dataset name as 'scope:name' or dotted 'scope.name'.
    dataset: String,

    /// Dataset metadata as a JSON object.
    #[arg(long)]
    metadata: Option<String>,

    /// Dataset lifetime in days (defaults to the configured lifetime).
    #[arg(long)]
    lifetime: Option<u32>,
}

#[derive(clap::Args)]
struct DeleteDatasetArgs {
    /// Dataset name as 'scope:name' or dotted 'scope.name'.
    dataset: String,

    /// Hours before the catalog expires the dataset.
    #[arg(long)]
    grace_hours: Option<u32>,
}

#[derive(clap::Args)]
struct RegisterFilesArgs {
    /// RSE holding the files (defaults to the configured RSE).
    #[arg(long)]
    rse: Option<String>,

    #[command(flatten)]
    source: FileSource,

    /// Scope for files that do not name one.
    #[arg(long)]
    scope: Option<String>,
}

/// Where the files to register come from.
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct FileSource {
    /// JSON file list ('-' for stdin).
    #[arg(long)]
    file_list: Option<PathBuf>,

    /// Physical file names; size and checksum are read from local files.
    #[arg(long, num_args = 1..)]
    pfn: Vec<String>,

    /// Register every file below a local directory.
    #[arg(long)]
    from_dir: Option<PathBuf>,
}

#[derive(clap::Args)]
struct AttachFilesArgs {
    /// Dataset name as 'scope:name' or dotted 'scope.name'.
    dataset: String,

    /// JSON list of files with 'scope' and 'name' (or 'lfn') ('-' for stdin).
    #[arg(long)]
    file_list: PathBuf,

    /// Check that each file has a replica at this RSE first.
    #[arg(long)]
    rse: Option<String>,
}

#[derive(clap::Args)]
struct ExecuteWorkflowArgs {
    /// Dataset name as 'scope:name' or dotted 'scope.name'.
    dataset: String,

    /// RSE holding the files (defaults to the configured RSE).
    #[arg(long)]
    rse: Option<String>,

    /// JSON file list ('-' for stdin).
    #[arg(long)]
    file_list: PathBuf,

    /// Dataset metadata as a JSON object.
    #[arg(long)]
    metadata: Option<String>,

    /// Dataset lifetime in days.
    #[arg(long)]
    lifetime: Option<u32>,

    /// Replicas per registration call.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Output format for the result ('text' or 'json').
    #[arg(long, default_value = "text")]
    output: String,
}

#[derive(clap::Args)]
struct ListDatasetArgs {
    /// Dataset name as 'scope:name' or dotted 'scope.name'.
    dataset: String,

    /// List the files instead of the metadata.
    #[arg(long)]
    files: bool,

    /// Include per-file attributes.
    #[arg(long)]
    long: bool,

    /// Output format ('text' or 'json').
    #[arg(long, default_value = "text")]
    output: String,
}

#[derive(clap::Args)]
struct VerifyArgs {
    /// Dataset name as 'scope:name' or dotted 'scope.name'.
    dataset: String,

    /// Number of files the dataset should hold.
    #[arg(long)]
    expected_files: usize,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Check the configuration and fail on errors.
    #[arg(long)]
    validate: bool,
}

/// Run the rucio-workflow CLI.
///
/// This is the main entry point for the CLI, called from `main.rs`.
pub fn run() -> Result<(), WorkflowError> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply(cli.settings.into_overrides());
    init_logging(if cli.verbose {
        "debug"
    } else {
        settings.log_directive()
    });

    let Some(command) = cli.command else {
        // No subcommand: print a banner and exit successfully
        println!("rucio-workflow {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Create, fill and close catalog datasets from files already on storage.");
        println!();
        println!("Run 'rucio-workflow --help' for usage information.");
        return Ok(());
    };

    // config is the only command that runs without a catalog
    let catalog = || open_catalog(&settings, cli.dry_run);
    match command {
        Commands::CreateDataset(args) => run_create_dataset(catalog()?, &settings, args),
        Commands::CloseDataset(args) => run_close_dataset(catalog()?, args),
        Commands::DeleteDataset(args) => run_delete_dataset(catalog()?, args),
        Commands::RegisterFiles(args) => run_register_files(catalog()?, &settings, args),
        Commands::AttachFiles(args) => run_attach_files(catalog()?, &settings, args),
        Commands::ExecuteWorkflow(args) => run_execute_workflow(catalog()?, &settings, args),
        Commands::ListDataset(args) => run_list_dataset(catalog()?, args),
        Commands::Verify(args) => run_verify(catalog()?, &settings, args),
        Commands::Config(args) => run_config(&settings, args),
    }
}

/// Sends logs to stderr. `RUST_LOG` wins over `directive`.
fn init_logging(directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    // a subscriber may already be installed when embedded
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init();
}

fn open_catalog(settings: &Settings, dry_run: bool) -> Result<Arc<dyn Catalog>, WorkflowError> {
    if dry_run {
        debug!("using in-memory catalog");
        return Ok(Arc::new(InMemoryCatalog::with_account(
            settings.catalog.account.clone(),
        )));
    }
    remote_catalog(&settings.catalog)
}

#[cfg(feature = "rest")]
fn remote_catalog(settings: &CatalogSettings) -> Result<Arc<dyn Catalog>, WorkflowError> {
    Ok(Arc::new(catalog::rest::RestCatalog::new(settings)?))
}

#[cfg(not(feature = "rest"))]
fn remote_catalog(_settings: &CatalogSettings) -> Result<Arc<dyn Catalog>, WorkflowError> {
    Err(WorkflowError::validation(
        "built without the 'rest' feature; only --dry-run is available",
    ))
}

fn parse_metadata(text: Option<&str>) -> Result<Metadata, WorkflowError> {
    match text {
        Some(text) => serde_json::from_str(text).map_err(WorkflowError::MetadataParse),
        None => Ok(Metadata::new()),
    }
}

/// Reads a JSON array from a file, or from stdin for `-`.
fn read_json_list<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, WorkflowError> {
    let text = if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        text
    } else {
        std::fs::read_to_string(path)?
    };
    serde_json::from_str(&text).map_err(|source| WorkflowError::FileListParse {
        path: path.to_path_buf(),
        source,
    })
}

fn run_create_dataset(
    catalog: Arc<dyn Catalog>,
    settings: &Settings,
    args: CreateDatasetArgs,
) -> Result<(), WorkflowError> {
    let did = Did::parse(&args.dataset)?;
    let metadata = parse_metadata(args.metadata.as_deref())?;
    let lifetime = args
        .lifetime
        .unwrap_or(settings.workflow.default_lifetime_days);

    let info = DatasetService::new(catalog).create_dataset(&did, metadata, Some(lifetime), true)?;
    println!("Dataset created successfully: {}", did);
    println!("  vuid: {}", info.vuid);
    Ok(())
}

fn run_close_dataset(catalog: Arc<dyn Catalog>, args: DatasetNameArg) -> Result<(), WorkflowError> {
    let did = Did::parse(&args.dataset)?;
    DatasetService::new(catalog).close_dataset(&did)?;
    println!("Dataset closed successfully: {}", did);
    Ok(())
}

fn run_delete_dataset(
    catalog: Arc<dyn Catalog>,
    args: DeleteDatasetArgs,
) -> Result<(), WorkflowError> {
    let did = Did::parse(&args.dataset)?;
    DatasetService::new(catalog).delete_dataset(&did, args.grace_hours)?;
    println!("Dataset marked for deletion: {}", did);
    Ok(())
}

fn run_register_files(
    catalog: Arc<dyn Catalog>,
    settings: &Settings,
    args: RegisterFilesArgs,
) -> Result<(), WorkflowError> {
    let rse = args
        .rse
        .unwrap_or_else(|| settings.workflow.default_rse.clone());
    let scope = args
        .scope
        .unwrap_or_else(|| settings.workflow.default_scope.clone());

    let records: Vec<FileRecord> = if let Some(path) = &args.source.file_list {
        read_json_list::<FileSpec>(path)?
            .into_iter()
            .map(|spec| FileRecord::from_spec(spec, Some(scope.as_str())))
            .collect::<Result<_, _>>()?
    } else {
        let pfns = match &args.source.from_dir {
            Some(dir) => collect_dir_pfns(dir)?,
            None => args.source.pfn.clone(),
        };
        let orchestrator = WorkflowOrchestrator::new(catalog.clone(), settings.workflow.clone());
        orchestrator.create_files_from_pfn_list(&pfns, "user", Some(scope.as_str()))
    };
    if records.is_empty() {
        return Err(WorkflowError::registration("No files to register"));
    }

    let mut service = FileService::new(catalog);
    let results = service.register_batch(&records, &rse, settings.workflow.batch_size);
    let succeeded = results.values().filter(|ok| **ok).count();

    println!("Registered {}/{} files at {}", succeeded, records.len(), rse);
    for (lfn, ok) in &results {
        println!("  {} {}", if *ok { "ok    " } else { "FAILED" }, lfn);
    }

    if succeeded == 0 {
        return Err(WorkflowError::registration(
            "No files were successfully registered",
        ));
    }
    Ok(())
}

/// Absolute paths of every regular file below `dir`, in name order.
fn collect_dir_pfns(dir: &Path) -> Result<Vec<String>, WorkflowError> {
    let root = std::fs::canonicalize(dir)?;
    let mut pfns = Vec::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| WorkflowError::Io(e.into()))?;
        if entry.file_type().is_file() {
            pfns.push(entry.path().to_string_lossy().into_owned());
        }
    }
    Ok(pfns)
}

/// An attach-files entry: `scope` with `name` or `lfn`.
#[derive(serde::Deserialize)]
struct AttachEntry {
    scope: Option<String>,
    name: Option<String>,
    lfn: Option<String>,
}

fn run_attach_files(
    catalog: Arc<dyn Catalog>,
    settings: &Settings,
    args: AttachFilesArgs,
) -> Result<(), WorkflowError> {
    let did = Did::parse(&args.dataset)?;
    let entries: Vec<AttachEntry> = read_json_list(&args.file_list)?;

    let files: Vec<Did> = entries
        .into_iter()
        .filter_map(|entry| match entry.name.or(entry.lfn) {
            Some(name) => {
                let scope = entry
                    .scope
                    .unwrap_or_else(|| settings.workflow.default_scope.clone());
                Some(Did::new(scope, name))
            }
            None => {
                warn!("skipping file entry without a name");
                None
            }
        })
        .collect();
    if files.is_empty() {
        return Err(WorkflowError::validation("No valid files found in file list"));
    }

    let report = DatasetService::new(catalog).attach_files(&did, &files, args.rse.as_deref())?;
    println!(
        "Attached {} files to dataset {}",
        report.files_attached, report.dataset
    );
    if let Some(rse) = &report.rse {
        println!("Checked files on RSE: {}", rse);
    }
    Ok(())
}

fn run_execute_workflow(
    catalog: Arc<dyn Catalog>,
    settings: &Settings,
    args: ExecuteWorkflowArgs,
) -> Result<(), WorkflowError> {
    let did = Did::parse(&args.dataset)?;
    let specs: Vec<FileSpec> = read_json_list(&args.file_list)?;
    let rse = args
        .rse
        .unwrap_or_else(|| settings.workflow.default_rse.clone());

    let mut request = WorkflowRequest::new(did, rse, specs.into_iter().map(FileInput::from).collect())
        .with_metadata(parse_metadata(args.metadata.as_deref())?);
    if let Some(days) = args.lifetime {
        request = request.with_lifetime_days(days);
    }
    if let Some(size) = args.batch_size {
        request = request.with_batch_size(size);
    }

    let mut orchestrator = WorkflowOrchestrator::new(catalog, settings.workflow.clone());
    let result = orchestrator.execute_workflow(request)?;

    match args.output.as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(&result).map_err(|source| {
                WorkflowError::WorkflowExecution(format!("cannot render result: {}", source))
            })?;
            println!("{}", json);
        }
        _ => print!("{}", result),
    }

    if result.is_success() {
        Ok(())
    } else {
        Err(WorkflowError::WorkflowFailed {
            errors: result.errors().to_vec(),
        })
    }
}

fn run_list_dataset(catalog: Arc<dyn Catalog>, args: ListDatasetArgs) -> Result<(), WorkflowError> {
    let did = Did::parse(&args.dataset)?;
    let service = DatasetService::new(catalog);
    let json = args.output == "json";

    if args.files {
        let files = service.list_dataset_files(&did, args.long)?;
        if json {
            print_json(&files)?;
        } else if args.long {
            println!("Files in dataset {}:", did);
            for (lfn, attrs) in &files {
                println!(
                    "  {} (size: {}, events: {}, checksum: {})",
                    lfn, attrs.fsize, attrs.events, attrs.checksum
                );
            }
        } else {
            for lfn in files.keys() {
                println!("{}", lfn);
            }
        }
        return Ok(());
    }

    let Some(metadata) = service.get_dataset_metadata(&did)? else {
        return Err(WorkflowError::dataset(format!("Dataset not found: {}", did)));
    };
    if json {
        print_json(&metadata)?;
    } else {
        println!("Dataset: {}", did);
        for (key, value) in &metadata {
            println!("  {}: {}", key, value);
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), WorkflowError> {
    let text = serde_json::to_string_pretty(value).map_err(|source| {
        WorkflowError::WorkflowExecution(format!("cannot render output: {}", source))
    })?;
    println!("{}", text);
    Ok(())
}

fn run_verify(
    catalog: Arc<dyn Catalog>,
    settings: &Settings,
    args: VerifyArgs,
) -> Result<(), WorkflowError> {
    let did = Did::parse(&args.dataset)?;
    let orchestrator = WorkflowOrchestrator::new(catalog, settings.workflow.clone());
    if orchestrator.verify_workflow_completion(&did, args.expected_files) {
        println!("Verification passed: {}", did);
        Ok(())
    } else {
        Err(WorkflowError::WorkflowExecution(format!(
            "Verification failed for {}",
            did
        )))
    }
}

fn run_config(settings: &Settings, args: ConfigArgs) -> Result<(), WorkflowError> {
    if !args.validate {
        println!("{}", settings);
        return Ok(());
    }

    let report = validate_settings(settings);
    print!("{}", report);
    if report.is_ok() {
        Ok(())
    } else {
        Err(WorkflowError::InvalidConfig {
            error_count: report.error_count(),
        })
    }
}
