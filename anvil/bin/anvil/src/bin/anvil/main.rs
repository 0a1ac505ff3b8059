// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use anvil::build::Build;
use anvil::context::BuildContext;
use anvil::package::UnresolvedPackageId;
use anvil::resolver::ResolveRequest;
use anvil::storage::remote::RemoteSpec;
use anvil::storage::Storage;
use cliutil::{cli_main, LoggingConfig};

#[derive(Parser)]
#[command(name = "anvil", about = "Package-aware build orchestrator")]
struct Args {
    /// Local storage root.
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// JSON file with remote registry descriptions.
    #[arg(long)]
    remotes: Option<PathBuf>,

    /// Never touch the network.
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a package request and print the result.
    Resolve { package: String },
    /// Resolve a package request and install it into the local store.
    Install { package: String },
    /// Search known package paths.
    Search { needle: String },
    /// Force a catalog sync for every configured remote.
    Sync,
    /// Execute a previously saved execution plan.
    RunPlan {
        plan: PathBuf,
        #[arg(long, default_value = ".anvil-build")]
        build_dir: PathBuf,
    },
    /// Manage overridden source directories.
    #[command(subcommand)]
    Override(OverrideCommands),
}

#[derive(Subcommand)]
enum OverrideCommands {
    /// Substitute a package with a local source directory.
    Add { package: String, dir: PathBuf },
    /// Drop the override registered for a directory.
    Remove { dir: PathBuf },
    /// List overridden packages.
    List,
}

fn default_storage_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".anvil").join("storage"))
}

fn make_context(args: &Args) -> Result<BuildContext> {
    let storage_dir = match &args.storage_dir {
        Some(d) => d.clone(),
        None => default_storage_dir()?,
    };
    let mut ctx = BuildContext::new(&storage_dir)?;
    if let Some(remotes_path) = &args.remotes {
        let text = std::fs::read_to_string(remotes_path)
            .with_context(|| format!("read {}", remotes_path.display()))?;
        let specs: Vec<RemoteSpec> = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", remotes_path.display()))?;
        for spec in specs {
            ctx.add_remote(spec, !args.offline)?;
        }
    }
    Ok(ctx)
}

fn run() -> Result<()> {
    let args = Args::parse();
    let ctx = make_context(&args)?;

    match &args.command {
        Commands::Resolve { package } => {
            let u = UnresolvedPackageId::new(package.parse()?, settings::Settings::new());
            let mut rr = ResolveRequest::from_unresolved_id(&u);
            ctx.resolve(&mut rr)?;
            let pkg = rr.package().context("resolved without result")?;
            println!("{}", pkg.id().name());
        }
        Commands::Install { package } => {
            let u = UnresolvedPackageId::new(package.parse()?, settings::Settings::new());
            let installed = ctx.install(&[u])?;
            for (u, id) in installed {
                println!("{u} -> {id}");
            }
        }
        Commands::Search { needle } => {
            for path in ctx
                .local_storage()
                .database()
                .matching_packages(needle, 100)?
            {
                println!("{path}");
            }
        }
        Commands::Sync => {
            for remote in ctx.remotes() {
                remote.download()?;
                remote.load()?;
                println!("synced {}", remote.name());
            }
        }
        Commands::RunPlan { plan, build_dir } => {
            let mut build = Build::new(Arc::new(ctx), build_dir);
            build.run_saved_execution_plan(plan)?;
        }
        Commands::Override(cmd) => match cmd {
            OverrideCommands::Add { package, dir } => {
                let dir = std::fs::canonicalize(dir)
                    .with_context(|| format!("no such directory: {}", dir.display()))?;
                ctx.local_storage().install_overridden(&package.parse()?, &dir)?;
            }
            OverrideCommands::Remove { dir } => {
                ctx.local_storage().remove_override(dir)?;
            }
            OverrideCommands::List => {
                for name in ctx.local_storage().overridden_packages()? {
                    println!("{name}");
                }
            }
        },
    }
    Ok(())
}

fn main() -> ExitCode {
    cli_main(run, LoggingConfig::from_env())
}
