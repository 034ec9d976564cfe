//! backup-helper - Command-line interface for the backup engine.
//!
//! Stages sources and targets in a JSON status file, then hashes, transfers
//! and verifies them. Progress goes to stderr, logs through `tracing`.

use std::path::PathBuf;
use std::time::Instant;

use backup_engine::{
    config::{BackupConfig, DEFAULT_STATUS_FILE, STATUS_FILE_ENV},
    progress::ProgressCallback,
    queue::{ResultRecord, WorkItem},
    transfer::{describe, setup_transfer_queue, TransferPair},
    BackupState, ChecksumAlgorithm, EngineError, Source, Target,
};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// backup-helper - Create checksum files, copy files and verify the transfer
#[derive(Parser, Debug)]
#[command(name = "backup-helper")]
#[command(version = "0.1.0")]
#[command(about = "Create checksum files, copy files and verify the transfer")]
struct Args {
    /// JSON file holding the state of the backup; logs are written next to it
    #[arg(long, value_name = "PATH", global = true, env = STATUS_FILE_ENV, default_value = DEFAULT_STATUS_FILE)]
    status_file: PathBuf,

    /// Directory for hash and verification logs (default: next to the status file)
    #[arg(long, value_name = "PATH", global = true)]
    log_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage a source path for backup
    Stage {
        /// Source directory
        path: PathBuf,

        /// Alias usable instead of the full path
        #[arg(long)]
        alias: Option<String>,

        /// Hash algorithm: crc32, md5, sha256, sha512, blake3
        #[arg(long, value_name = "ALGORITHM")]
        hash_algorithm: Option<String>,

        /// Name the checksum file after the algorithm instead of .cshd
        #[arg(long)]
        single_hash: bool,

        /// Glob patterns of files to include (others are skipped)
        #[arg(long, num_args = 1..)]
        allowlist: Vec<String>,

        /// Glob patterns of entries to skip
        #[arg(long, num_args = 1..)]
        blocklist: Vec<String>,
    },

    /// Add a target directory to a source
    AddTarget {
        /// Source path or alias
        source: String,

        /// Target directory
        path: PathBuf,

        /// Alias usable instead of the full path
        #[arg(long)]
        alias: Option<String>,

        /// Don't verify the target after transfer
        #[arg(long)]
        no_verify: bool,
    },

    /// Show or change a field of a source or of one of its targets
    Modify {
        /// Source path or alias
        source: String,

        /// Field to show or change; all fields are listed when omitted
        key: Option<String>,

        /// New value(s)
        value: Vec<String>,

        /// Modify this target of the source instead
        #[arg(long, value_name = "PATH_OR_ALIAS")]
        target: Option<String>,
    },

    /// Hash a source (by default all of them)
    Hash {
        #[arg(long, value_name = "PATH_OR_ALIAS")]
        source: Option<String>,
    },

    /// Transfer sources (by default all of them) to their targets
    Transfer {
        #[arg(long, value_name = "PATH_OR_ALIAS")]
        source: Option<String>,

        /// Only transfer to this target (requires --source)
        #[arg(long, value_name = "PATH_OR_ALIAS", requires = "source")]
        target: Option<String>,

        /// Copy again even if the target was already transfered
        #[arg(long, requires = "target")]
        force: bool,
    },

    /// Verify every transfered target that has not been verified yet
    Verify,

    /// Show the status of a source (by default all of them)
    Status {
        #[arg(long, value_name = "PATH_OR_ALIAS")]
        source: Option<String>,
    },
}

/// How a command that ran to completion went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Complete,
    /// Number of items (sources or targets) that failed
    ItemsFailed(usize),
}

impl Outcome {
    fn from_failures(failed: usize) -> Self {
        if failed == 0 {
            Outcome::Complete
        } else {
            Outcome::ItemsFailed(failed)
        }
    }

    fn exit_code(self) -> i32 {
        match self {
            Outcome::Complete => 0,
            Outcome::ItemsFailed(_) => 1,
        }
    }
}

/// CLI implementation of ProgressCallback for transfers
struct CliProgress {
    verbose: bool,
    start_time: Instant,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
        }
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

impl ProgressCallback<TransferPair, TransferPair> for CliProgress {
    fn on_work_started(&self, item: &WorkItem<TransferPair>) {
        eprintln!("Transferring {}", describe(&item.payload));
        if self.verbose {
            let devices: Vec<String> = item.involved_devices.iter().map(|d| d.to_string()).collect();
            eprintln!("  devices: {}", devices.join(", "));
        }
    }

    fn on_work_completed(&self, record: &ResultRecord<TransferPair, TransferPair>) {
        let elapsed = Self::format_duration(self.start_time.elapsed());
        match &record.error {
            None => eprintln!("Done: {} [{}]", describe(&record.item.payload), elapsed),
            Some(msg) => eprintln!("Failed: {}: {} [{}]", describe(&record.item.payload), msg, elapsed),
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose {
        "backup_engine=debug,backup_helper=debug,warn"
    } else {
        "backup_engine=info,backup_helper=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // keep an already installed subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parse arguments, run the command, map the outcome to an exit code
fn main() {
    let args = Args::parse();
    setup_logging(args.verbose);

    let exit_code = match run_cli(&args) {
        Ok(outcome) => {
            if let Outcome::ItemsFailed(count) = outcome {
                eprintln!("{} item(s) failed", count);
            }
            outcome.exit_code()
        }
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

fn config_from_args(args: &Args) -> BackupConfig {
    let config = BackupConfig::new(&args.status_file);
    match &args.log_dir {
        Some(log_dir) => config.with_log_dir(log_dir),
        None => config,
    }
}

/// Main CLI logic - separated for testability
///
/// Loads the status file, runs the command and saves the state again when the
/// command changed it. If the command fails after loading, the state is saved
/// to a crash copy instead.
fn run_cli(args: &Args) -> Result<Outcome, String> {
    let config = config_from_args(args);
    let mut state = BackupState::load(&config.status_file)
        .map_err(|e| format!("Failed to load {}: {}", config.status_file.display(), e))?;
    debug!(
        status_file = %config.status_file.display(),
        sources = state.sources().len(),
        "Loaded state"
    );

    match run_command(&args.command, &config, &mut state, args.verbose) {
        Ok((outcome, changed)) => {
            if changed {
                state
                    .save(&config.status_file)
                    .map_err(|e| format!("Failed to save state: {}", e))?;
            }
            Ok(outcome)
        }
        Err(e) => {
            match state.save_crash_copy(&config.status_file) {
                Ok(path) => eprintln!("State saved to {}", path.display()),
                Err(save_err) => eprintln!("Failed to save crash copy: {}", save_err),
            }
            Err(e.to_string())
        }
    }
}

/// Run one subcommand against the loaded state.
///
/// # Returns
/// The outcome and whether the state must be saved.
fn run_command(
    command: &Command,
    config: &BackupConfig,
    state: &mut BackupState,
    verbose: bool,
) -> Result<(Outcome, bool), EngineError> {
    match command {
        Command::Stage {
            path,
            alias,
            hash_algorithm,
            single_hash,
            allowlist,
            blocklist,
        } => {
            let algorithm = match hash_algorithm {
                Some(name) => ChecksumAlgorithm::from_name(name).ok_or_else(|| {
                    EngineError::InvalidField {
                        field: "hash_algorithm".to_string(),
                        reason: format!(
                            "unknown algorithm '{}', must be crc32, md5, sha256, sha512 or blake3",
                            name
                        ),
                    }
                })?,
                None => config.default_hash_algorithm,
            };
            let mut source = Source::new(path, alias.clone(), algorithm, *single_hash);
            source.allowlist = allowlist.clone();
            source.blocklist = blocklist.clone();
            let staged = source.path.clone();
            state.add_source(source)?;
            println!("Staged: {}", staged.display());
            if let Some(alias) = alias {
                println!("    with alias: {}", alias);
            }
            Ok((Outcome::Complete, true))
        }

        Command::AddTarget {
            source,
            path,
            alias,
            no_verify,
        } => {
            let target = Target::new(path, alias.clone(), !no_verify);
            let added = target.path.clone();
            state.get_source_mut(source)?.add_target(target)?;
            println!("Added target {}", added.display());
            if let Some(alias) = alias {
                println!("    with alias: {}", alias);
            }
            Ok((Outcome::Complete, true))
        }

        Command::Modify {
            source,
            key,
            value,
            target,
        } => {
            let source = state.get_source_mut(source)?;
            let changed = match (key, target) {
                (None, None) => {
                    println!("{}", source.fields());
                    false
                }
                (None, Some(target)) => {
                    println!("{}", source.get_target(target)?.fields());
                    false
                }
                (Some(key), target) => {
                    if !value.is_empty() {
                        eprintln!(
                            "WARNING: You need to know what you're doing if you modify fields \
                             like transfered"
                        );
                    }
                    match target {
                        Some(target) => {
                            let target = source.get_target_mut(target)?;
                            if !value.is_empty() {
                                target.set_field(key, value)?;
                            }
                            println!("{} = {}", key, target.get_field(key)?);
                        }
                        None => {
                            if !value.is_empty() {
                                source.set_field(key, value)?;
                            }
                            println!("{} = {}", key, source.get_field(key)?);
                        }
                    }
                    !value.is_empty()
                }
            };
            Ok((Outcome::Complete, changed))
        }

        Command::Hash { source } => match source {
            Some(key) => {
                let hash_file = state.get_source_mut(key)?.hash(&config.log_dir)?;
                println!("Created {}", hash_file.display());
                Ok((Outcome::Complete, true))
            }
            None => {
                let (hashed, failed) = state.hash_all(&config.log_dir)?;
                for source in &hashed {
                    if let Some(hash_file) = &source.hash_file {
                        println!("Created {}", hash_file.display());
                    }
                }
                for (source, reason) in &failed {
                    eprintln!("Hashing {} failed: {}", source.path.display(), reason);
                }
                Ok((Outcome::from_failures(failed.len()), true))
            }
        },

        Command::Transfer {
            source,
            target,
            force,
        } => {
            let (transfered, failed) = match (source, target) {
                (Some(source), Some(target)) => {
                    let copied = state.get_source_mut(source)?.transfer(target, *force)?;
                    if !copied {
                        println!("Target {} was already transfered, use --force to copy again", target);
                    }
                    (usize::from(copied), 0)
                }
                (Some(source), None) => {
                    let (ok, failed) = state.get_source_mut(source)?.transfer_all()?;
                    report_failures(&failed);
                    (ok.len(), failed.len())
                }
                (None, _) => {
                    let queue = setup_transfer_queue().with_progress(CliProgress::new(verbose));
                    let (ok, failed) = state.transfer_all_in(queue)?;
                    report_failures(&failed);
                    (ok.len(), failed.len())
                }
            };
            println!("Summary: {} transfered, {} failed", transfered, failed);
            Ok((Outcome::from_failures(failed), true))
        }

        Command::Verify => {
            let (verified, failed) = state.verify_all(&config.log_dir)?;
            let mut problems = failed.len();
            for job in &verified {
                if let Some(info) = &job.verified {
                    println!(
                        "{}: {} errors, {} missing, {} crc errors (log: {})",
                        job.target_path.display(),
                        info.errors,
                        info.missing,
                        info.crc_errors,
                        info.log_file.display()
                    );
                    if !info.is_clean() {
                        problems += 1;
                    }
                }
            }
            for (job, reason) in &failed {
                eprintln!("Verifying {} failed: {}", job.target_path.display(), reason);
            }
            Ok((Outcome::from_failures(problems), true))
        }

        Command::Status { source } => {
            println!("Status:");
            match source {
                Some(key) => println!("{}", state.get_source(key)?.status()?),
                None => println!("{}", state.status_all()?),
            }
            Ok((Outcome::Complete, false))
        }
    }
}

fn report_failures(failed: &[(TransferPair, String)]) {
    if failed.is_empty() {
        return;
    }
    eprintln!();
    eprintln!("Failed transfers:");
    for (pair, msg) in failed {
        eprintln!("  {}: {}", describe(pair), msg);
    }
}
