mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::{exit_code_for, EXIT_CONFIG_ERROR};
use config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::{CreateSpec, Store};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    version,
    about = "Shared root filesystem store for container images"
)]
struct Cli {
    /// Path to the store directory [default: /var/lib/strata/store].
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Filesystem driver backing the store [default: dir].
    #[arg(long, global = true)]
    driver: Option<String>,

    /// TOML file with default settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create an image on top of a base image.
    Create {
        /// Disk limit for the image in bytes, 0 for unlimited.
        #[arg(long)]
        disk_limit_size_bytes: Option<u64>,
        /// Apply the disk limit to what the image writes only, not its base.
        #[arg(long, default_value_t = false)]
        exclude_image_from_quota: bool,
        /// Uid mapping as <namespace>:<host>:<size>. Repeatable.
        #[arg(long = "uid-mapping")]
        uid_mappings: Vec<String>,
        /// Gid mapping as <namespace>:<host>:<size>. Repeatable.
        #[arg(long = "gid-mapping")]
        gid_mappings: Vec<String>,
        /// Collect unused volumes before creating.
        #[arg(long, default_value_t = false)]
        clean: bool,
        /// Do not collect unused volumes before creating.
        #[arg(long, default_value_t = false)]
        no_clean: bool,
        /// Only clean when the store uses more than this many bytes.
        #[arg(long)]
        threshold_bytes: Option<u64>,
        /// Base image whose volumes cleaning must keep. Repeatable.
        #[arg(long = "keep-image")]
        keep_images: Vec<String>,
        /// Base image reference: a path, file:// URL, or a registry URL.
        base_image: String,
        /// Id of the new image.
        id: String,
    },
    /// Delete an image. Shared volumes are left for `clean`.
    Delete {
        /// Image id, or the image's path inside the store.
        id: String,
    },
    /// Remove volumes no image uses.
    Clean {
        /// Skip cleaning while the store uses at most this many bytes.
        #[arg(long)]
        threshold_bytes: Option<u64>,
        /// Base image whose volumes must be kept. Repeatable.
        #[arg(long = "keep-image")]
        keep_images: Vec<String>,
    },
    /// Create the store directory tree and record its id mappings.
    InitStore {
        /// Uid mapping as <namespace>:<host>:<size>. Repeatable.
        #[arg(long = "uid-mapping")]
        uid_mappings: Vec<String>,
        /// Gid mapping as <namespace>:<host>:<size>. Repeatable.
        #[arg(long = "gid-mapping")]
        gid_mappings: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STRATA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let config = match Config::load_optional(cli.config.as_deref()) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let result = run(cli, &config);
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn run(cli: Cli, config: &Config) -> Result<u8, String> {
    let store_path = config.store_path(cli.store.as_deref());
    let driver = config.driver(cli.driver.as_deref());
    debug!("using store {} with the {driver} driver", store_path.display());
    let store = Store::open(&store_path, &driver).map_err(|e| e.to_string())?;
    let json = cli.json;

    match cli.command {
        Commands::Create {
            disk_limit_size_bytes,
            exclude_image_from_quota,
            uid_mappings,
            gid_mappings,
            clean,
            no_clean,
            threshold_bytes,
            keep_images,
            base_image,
            id,
        } => {
            let spec = CreateSpec {
                id,
                base_image,
                disk_limit: config.disk_limit(disk_limit_size_bytes),
                exclude_base_from_quota: config.exclude_image_from_quota(exclude_image_from_quota),
                uid_mappings: config.uid_mappings(&uid_mappings)?,
                gid_mappings: config.gid_mappings(&gid_mappings)?,
                clean_on_create: config.clean_on_create(clean, no_clean)?,
                clean_threshold: config.clean_threshold(threshold_bytes),
                clean_keep_images: config.keep_images(&keep_images),
            };
            commands::create::run(&store, &spec, json)
        }
        Commands::Delete { id } => commands::delete::run(&store, &id, json),
        Commands::Clean {
            threshold_bytes,
            keep_images,
        } => commands::clean::run(
            &store,
            config.clean_threshold(threshold_bytes),
            &config.keep_images(&keep_images),
            json,
        ),
        Commands::InitStore {
            uid_mappings,
            gid_mappings,
        } => commands::init_store::run(
            &store,
            &config.uid_mappings(&uid_mappings)?,
            &config.gid_mappings(&gid_mappings)?,
            json,
        ),
    }
}
