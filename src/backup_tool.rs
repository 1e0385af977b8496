use std::{env, path::PathBuf, process::exit, sync::Arc};

use anyhow::{bail, Context, Result};
use config::File;
use equipment_health_database::{backup, Store};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

const DEFAULT_BACKUPS_TO_KEEP: u32 = 5;

enum Command {
    Create,
    List,
    Restore(Option<u32>),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, command) = parse()?;
    let config = Config::load_config(config_path.as_deref())?;
    let store = Store::new(&config.data_dir, &config.backup_dir).context("cannot open store")?;
    let store = Arc::new(RwLock::new(store));

    match command {
        Command::Create => {
            backup::create(&store, true, config.backups_to_keep)
                .await
                .context("backup failed")?;
            println!("Backup created.");
        }
        Command::List => {
            for info in backup::list(&store).await? {
                println!("{}\t{}\t{} bytes", info.id, info.timestamp, info.size);
            }
        }
        Command::Restore(id) => {
            backup::restore(&store, id)
                .await
                .context("restore failed")?;
            println!("Restored.");
        }
    }
    Ok(())
}

fn parse() -> Result<(Option<String>, Command)> {
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        usage();
        exit(1);
    }

    if args[0] == "--help" || args[0] == "-h" {
        usage();
        exit(0);
    }
    if args[0] == "--version" || args[0] == "-V" {
        println!("{}", version());
        exit(0);
    }

    let config = if args.len() > 1 && args[0].ends_with(".toml") {
        Some(args.remove(0))
    } else {
        None
    };
    let command = match args.as_slice() {
        [cmd] if cmd == "create" => Command::Create,
        [cmd] if cmd == "list" => Command::List,
        [cmd] if cmd == "restore" => Command::Restore(None),
        [cmd, id] if cmd == "restore" => {
            Command::Restore(Some(id.parse().context("invalid backup ID")?))
        }
        _ => bail!("unknown command; see --help"),
    };
    Ok((config, command))
}

fn usage() {
    println!("{} {}", bin(), version());
    println!();
    println!(
        "USAGE: \
        \n    {} [CONFIG] <COMMAND> \
        \n \
        \nFLAGS: \
        \n    -h, --help       Prints help information \
        \n    -V, --version    Prints version information \
        \n \
        \nARG: \
        \n    <CONFIG>    A TOML config file \
        \n \
        \nCOMMANDS: \
        \n    create          Backs up the store \
        \n    list            Lists the backups on file \
        \n    restore [ID]    Restores the given or the latest backup",
        bin()
    );
}

fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn bin() -> &'static str {
    env!("CARGO_BIN_NAME")
}

pub struct Config {
    data_dir: PathBuf,
    backup_dir: PathBuf,
    backups_to_keep: u32,
}

impl Config {
    /// Reads configuration from the file on disk and environment variables and
    /// returns Config struct.
    ///
    /// # Errors
    ///
    /// If input arguments are invalid, an error will be returned.
    pub fn load_config(path: Option<&str>) -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("data_dir", env::current_dir()?.join("data").to_str())
            .context("cannot set the default data directory")?
            .set_default("backup_dir", env::current_dir()?.join("backup").to_str())
            .context("cannot set the default backup directory")?
            .set_default("backups_to_keep", DEFAULT_BACKUPS_TO_KEEP)
            .context("cannot set the default number of backups")?;
        let config: ConfigParser = if let Some(path) = path {
            builder.add_source(File::with_name(path))
        } else {
            builder
        }
        .add_source(config::Environment::with_prefix("HEALTH"))
        .build()
        .context("cannot build the config")?
        .try_deserialize()?;
        Ok(Self {
            data_dir: config.data_dir,
            backup_dir: config.backup_dir,
            backups_to_keep: config.backups_to_keep,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ConfigParser {
    data_dir: PathBuf,
    backup_dir: PathBuf,
    backups_to_keep: u32,
}
