#![allow(clippy::result_large_err)]
//! blockmesh-ctl
//!
//! Runs one block lifecycle operation against a shared volume and the target
//! agents of its gateway hosts, prints the response and exits with its code.

mod output;
mod target_client;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blockmesh_block::{
    BlockOrchestrator, BlockResult, CreateRequest, DeleteRequest, LocalConnector,
    ModifyAuthRequest, ModifySizeRequest, OrchestratorSettings, ReloadRequest, RemoteOpExecutor,
    ReplaceRequest, VolumeHandleCache,
};
use blockmesh_common::config::LoggingConfig;
use blockmesh_common::{
    Config, DEFAULT_SECTOR_SIZE, VolumeName, parse_host_list, parse_size, parse_volume_block,
};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use crate::output::Report;
use crate::target_client::HttpTargetBackend;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "blockmesh-ctl", about = "blockmesh block lifecycle control")]
#[command(version)]
struct Args {
    /// Configuration file (TOML), optional
    #[arg(
        long,
        global = true,
        env = "BLOCKMESH_CONFIG",
        default_value = "/etc/blockmesh/blockmesh.toml"
    )]
    config: PathBuf,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print responses as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding one sub-directory per volume
    #[arg(long, global = true, env = "BLOCKMESH_STORE_ROOT")]
    store_root: Option<PathBuf>,

    /// Number of volume handles kept open (1-512)
    #[arg(long, global = true)]
    lru_count: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AuthMode {
    Enable,
    Disable,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a block and export it from the given hosts
    Create {
        /// Block as <volume>/<block>
        target: String,
        /// Comma separated candidate hosts, the first --ha are configured first
        #[arg(long)]
        hosts: String,
        /// Number of paths (multipath factor)
        #[arg(long, default_value_t = 1)]
        ha: usize,
        /// Block size, e.g. 10GiB, 512m, 4096
        #[arg(long)]
        size: String,
        /// Enforce CHAP authentication
        #[arg(long)]
        auth: bool,
        /// Zero-fill the data object
        #[arg(long)]
        prealloc: bool,
        /// Ring buffer size in MiB
        #[arg(long)]
        ring_buffer: Option<u32>,
        /// Logical block size, a multiple of 512
        #[arg(long)]
        block_size: Option<String>,
        /// Device I/O timeout in seconds
        #[arg(long)]
        io_timeout: Option<u32>,
    },
    /// Delete a block
    Delete {
        /// Block as <volume>/<block>
        target: String,
        /// Remove the block even if some hosts cannot be cleaned up
        #[arg(long)]
        force: bool,
        /// Remove the backing data object (`--unlink-storage false` keeps it)
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        unlink_storage: bool,
    },
    /// Enable or disable authentication
    ModifyAuth {
        /// Block as <volume>/<block>
        target: String,
        #[arg(value_enum)]
        mode: AuthMode,
    },
    /// Resize a block
    ModifySize {
        /// Block as <volume>/<block>
        target: String,
        /// New size, e.g. 20GiB
        size: String,
        /// Allow shrinking
        #[arg(long)]
        force: bool,
    },
    /// Move one path of a block to another host
    Replace {
        /// Block as <volume>/<block>
        target: String,
        /// Host giving up the path
        old_node: String,
        /// Host taking over the path
        new_node: String,
        /// Tolerate an unreachable old host
        #[arg(long)]
        force: bool,
    },
    /// Re-apply the target configuration on every configured host
    Reload {
        /// Block as <volume>/<block>
        target: String,
        /// Report success even if some hosts fail
        #[arg(long)]
        force: bool,
    },
    /// Show the details of a block
    Info {
        /// Block as <volume>/<block>
        target: String,
    },
    /// List the blocks of a volume
    List {
        /// Volume name
        volume: String,
    },
}

// ── Setup ─────────────────────────────────────────────────────────────────────

/// Load the configuration file if it exists and apply command-line overrides
fn load_config(args: &Args) -> Result<Config> {
    let mut config = if Path::new(&args.config).exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("read config {:?}", args.config))?;
        toml::from_str::<Config>(&text)
            .with_context(|| format!("parse config {:?}", args.config))?
    } else {
        Config::default()
    };

    if let Some(root) = &args.store_root {
        config.store.root.clone_from(root);
    }
    if let Some(count) = args.lru_count {
        config.cache.lru_count = count;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_orchestrator(config: &Config) -> Result<BlockOrchestrator> {
    let connector = Arc::new(LocalConnector::new(config.store.root.clone()));
    let volumes = Arc::new(VolumeHandleCache::new(connector, config.cache.lru_count));

    let timeout = Duration::from_secs(config.executor.remote_timeout_secs);
    let backend = Arc::new(
        HttpTargetBackend::new(&config.target, timeout).context("build target agent client")?,
    );
    let executor = Arc::new(RemoteOpExecutor::new(
        backend,
        timeout,
        Duration::from_secs(config.executor.capability_timeout_secs),
    ));

    Ok(BlockOrchestrator::new(
        volumes,
        executor,
        OrchestratorSettings {
            iqn_prefix: config.target.iqn_prefix.clone(),
            portal_port: config.target.portal_port,
        },
    ))
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn run(orchestrator: &BlockOrchestrator, command: Command) -> BlockResult<Report> {
    let report = match command {
        Command::Create {
            target,
            hosts,
            ha,
            size,
            auth,
            prealloc,
            ring_buffer,
            block_size,
            io_timeout,
        } => {
            let (volume, block) = parse_volume_block(&target)?;
            let block_size = block_size
                .map(|bs| parse_size(&bs, DEFAULT_SECTOR_SIZE))
                .transpose()?;
            let size = parse_size(&size, block_size.unwrap_or(DEFAULT_SECTOR_SIZE))?;
            let response = orchestrator
                .create(CreateRequest {
                    volume,
                    block,
                    hosts: parse_host_list(&hosts),
                    mpath: ha,
                    size,
                    auth,
                    prealloc,
                    ring_buffer,
                    block_size,
                    io_timeout,
                })
                .await?;
            Report::new(&response, response.result.is_ok())
        }
        Command::Delete {
            target,
            force,
            unlink_storage,
        } => {
            let (volume, block) = parse_volume_block(&target)?;
            let response = orchestrator
                .delete(DeleteRequest {
                    volume,
                    block,
                    force,
                    unlink: unlink_storage,
                })
                .await?;
            Report::new(&response, response.result.is_ok())
        }
        Command::ModifyAuth { target, mode } => {
            let (volume, block) = parse_volume_block(&target)?;
            let response = orchestrator
                .modify_auth(ModifyAuthRequest {
                    volume,
                    block,
                    enable: mode == AuthMode::Enable,
                })
                .await?;
            Report::new(&response, response.result.is_ok())
        }
        Command::ModifySize {
            target,
            size,
            force,
        } => {
            let (volume, block) = parse_volume_block(&target)?;
            let response = orchestrator
                .modify_size(ModifySizeRequest {
                    volume,
                    block,
                    size: parse_size(&size, DEFAULT_SECTOR_SIZE)?,
                    force,
                })
                .await?;
            Report::new(&response, response.result.is_ok())
        }
        Command::Replace {
            target,
            old_node,
            new_node,
            force,
        } => {
            let (volume, block) = parse_volume_block(&target)?;
            let response = orchestrator
                .replace_node(ReplaceRequest {
                    volume,
                    block,
                    old_node,
                    new_node,
                    force,
                })
                .await?;
            Report::new(&response, response.result.is_ok())
        }
        Command::Reload { target, force } => {
            let (volume, block) = parse_volume_block(&target)?;
            let response = orchestrator
                .reload(ReloadRequest {
                    volume,
                    block,
                    force,
                })
                .await?;
            Report::new(&response, response.result.is_ok())
        }
        Command::Info { target } => {
            let (volume, block) = parse_volume_block(&target)?;
            Report::new(&orchestrator.info(&volume, &block).await?, true)
        }
        Command::List { volume } => {
            let volume = VolumeName::new(&volume).map_err(blockmesh_common::Error::from)?;
            Report::new(&orchestrator.list(&volume).await?, true)
        }
    };
    Ok(report)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging);

    let orchestrator = build_orchestrator(&config)?;
    let report = match run(&orchestrator, args.command).await {
        Ok(report) => report,
        Err(err) => {
            error!("{}", err);
            Report::failure(&err)
        }
    };
    report.print(args.json);

    orchestrator.volumes().clear().await;
    debug!("Volume handle cache: {:?}", orchestrator.volumes().stats());
    Ok(report.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("blockmesh-ctl").chain(argv.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_parse_create() {
        let args = parse(&[
            "create", "vol/blk", "--hosts", "h1,h2,h3", "--ha", "2", "--size", "1GiB", "--auth",
        ]);
        match args.command {
            Command::Create {
                target,
                ha,
                auth,
                prealloc,
                ..
            } => {
                assert_eq!(target, "vol/blk");
                assert_eq!(ha, 2);
                assert!(auth);
                assert!(!prealloc);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_modify_auth_mode() {
        let args = parse(&["--json", "modify-auth", "vol/blk", "disable"]);
        assert!(args.json);
        assert!(matches!(
            args.command,
            Command::ModifyAuth {
                mode: AuthMode::Disable,
                ..
            }
        ));
        let bad_mode = Args::try_parse_from(["blockmesh-ctl", "modify-auth", "vol/blk", "maybe"]);
        assert!(bad_mode.is_err());
    }

    #[test]
    fn test_parse_delete_unlink_storage() {
        let args = parse(&["delete", "vol/blk"]);
        assert!(matches!(
            args.command,
            Command::Delete {
                unlink_storage: true,
                force: false,
                ..
            }
        ));
        let args = parse(&["delete", "vol/blk", "--force", "--unlink-storage", "false"]);
        assert!(matches!(
            args.command,
            Command::Delete {
                unlink_storage: false,
                force: true,
                ..
            }
        ));
    }

    #[test]
    fn test_config_file_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockmesh.toml");
        std::fs::write(
            &path,
            "[cache]\nlru_count = 20\n\n[target]\nport = 9000\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();
        let config_arg = path.to_str().unwrap();

        let config = load_config(&parse(&["--config", config_arg, "list", "vol"])).unwrap();
        assert_eq!(config.cache.lru_count, 20);
        assert_eq!(config.target.port, 9000);
        assert_eq!(config.logging.level, "debug");

        let config = load_config(&parse(&[
            "--config", config_arg, "--lru-count", "7", "--log-level", "warn", "list", "vol",
        ]))
        .unwrap();
        assert_eq!(config.cache.lru_count, 7);
        assert_eq!(config.logging.level, "warn");

        let too_many = parse(&["--config", config_arg, "--lru-count", "513", "list", "vol"]);
        assert!(load_config(&too_many).is_err());
    }

    #[tokio::test]
    async fn test_run_against_local_store_without_agents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let connector = LocalConnector::new(dir.path());
        connector
            .create_volume(&VolumeName::new("vol").unwrap())
            .await
            .unwrap();

        let args = parse(&["--store-root", root, "list", "vol"]);
        let mut config = load_config(&args).unwrap();
        config.executor.capability_timeout_secs = 1;
        let orchestrator = build_orchestrator(&config).unwrap();

        let report = run(&orchestrator, args.command).await.unwrap();
        assert!(report.is_ok());
        assert_eq!(report.render(false), "*Nil*");

        let err = run(&orchestrator, parse(&["info", "vol/missing"]).command)
            .await
            .unwrap_err();
        assert_eq!(Report::failure(&err).render(false), err.to_string());

        // capability queries fail closed when no agent answers
        let err = run(
            &orchestrator,
            parse(&["create", "vol/blk", "--hosts", "127.0.0.1:9", "--size", "1m"]).command,
        )
        .await
        .unwrap_err();
        assert!(err.is_validation());
    }
}
