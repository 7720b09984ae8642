use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use keywarp::cli::{Cli, Sub};
use keywarp::daemon::{self, DEFAULT_CONFIG_DIR};
use keywarp::ipc;
use keywarp_config::Config;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    match cli.subcommand {
        Some(Sub::Validate { config_dir }) => {
            return validate(&resolve_config_dir(config_dir));
        }
        Some(Sub::Msg { msg }) => return ipc::client::handle_msg(msg),
        None => {}
    }

    daemon::run(resolve_config_dir(cli.config_dir))
}

fn resolve_config_dir(arg: Option<PathBuf>) -> PathBuf {
    arg.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

fn validate(dir: &Path) -> anyhow::Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("error opening {}", dir.display()))?;

    let mut checked = 0;
    let mut failed = 0;
    for entry in entries {
        let entry = entry.context("error reading configuration directory")?;
        if entry.file_type().map_or(false, |ty| ty.is_dir()) {
            continue;
        }

        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "conf") {
            continue;
        }

        checked += 1;
        match Config::load(&path) {
            Ok(_) => println!("{}: OK", path.display()),
            Err(err) => {
                failed += 1;
                eprintln!("{err:?}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {checked} configuration files failed to validate");
    }

    println!("{checked} configuration files OK");
    Ok(())
}
