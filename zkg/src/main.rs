// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};
use cliutil::cli_main;

use zkg_engine::capabilities::{FileBackedCapabilities, PlatformCapabilities, StubCapabilities};
use zkg_engine::context::{resolve_stage_paths, Context};
use zkg_engine::metadata::UserConfig;
use zkg_engine::pipeline::PipelineOptions;
use zkg_engine::resolver::Request;
use zkg_engine::vcs::GitVcsDriver;
use zkg_engine::version::Constraint;
use zkg_engine::orchestrator;

/// The zkg-style package lifecycle CLI for a network-security analysis
/// platform's third-party package manager.
#[derive(Parser, Debug)]
#[command(name = "zkg")]
#[command(author = "Security Platform Authors")]
#[command(about = "Installs, removes, and manages third-party platform packages")]
struct Cli {
    /// Path to the INI config file. Defaults to `$HOME/.zkgrc`.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the state directory holding clones, the manifest, and logs.
    /// Overrides the config file's `[paths] state_dir`.
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Path to a JSON file describing the host platform's advertised
    /// built-in capability versions. If unset, no built-in capability is
    /// considered available (§4.1).
    #[arg(long, value_name = "PATH")]
    capabilities_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetches every configured source index.
    Refresh,

    /// Lists installed packages.
    List,

    /// Searches configured sources for package names containing a query.
    Search {
        query: String,
    },

    /// Prints a package's metadata.
    Info {
        name: String,
    },

    /// Installs one or more packages. Each PACKAGE may be a bare canonical
    /// name/alias (any satisfying version), or `NAME=CONSTRAINT` where
    /// CONSTRAINT is a semver range, `branch=NAME`, or `*`.
    Install {
        #[arg(required = true)]
        packages: Vec<String>,

        /// Override a user variable (`KEY=VALUE`); may be repeated.
        #[arg(long = "user-var", value_name = "KEY=VALUE")]
        user_vars: Vec<String>,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        skiptests: bool,
    },

    /// Removes a package, preserving any backed-up config files.
    #[command(alias = "uninstall")]
    Remove {
        name: String,
    },

    /// Removes a package and deletes any preserved config-file backups.
    Purge {
        name: String,
    },

    /// Adds a package to the loader index and enables its plugin, if any.
    Load {
        name: String,
    },

    /// Removes a package from the loader index and disables its plugin.
    Unload {
        name: String,
    },

    /// Pins a package so no later operation changes its version.
    Pin {
        name: String,
    },

    /// Reverts a pinned package to its ordinary installed/loaded status.
    Unpin {
        name: String,
    },

    /// Re-resolves installed packages to their newest satisfying version.
    Upgrade {
        #[arg(required = true)]
        names: Vec<String>,

        #[arg(long = "user-var", value_name = "KEY=VALUE")]
        user_vars: Vec<String>,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        skiptests: bool,
    },

    /// Re-runs an installed package's test command in a fresh clone area.
    Test {
        name: String,
    },

    /// Packages installed packages (or a named subset) into a tar.gz.
    Bundle {
        /// Packages to include. If omitted, every installed package.
        names: Vec<String>,

        #[arg(short = 'o', long, value_name = "PATH")]
        output: PathBuf,
    },

    /// Unpacks a bundle and installs its packages at the recorded versions.
    Unbundle {
        tar_gz: PathBuf,

        /// A built-in capability name known to be available on this host;
        /// may be repeated. Anything else is reported as a warning rather
        /// than verified (§4.8).
        #[arg(long = "known-capability", value_name = "NAME")]
        known_capabilities: Vec<String>,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        skiptests: bool,
    },

    /// Instantiates a new package skeleton from a template repository.
    Create {
        template_url: String,

        output_dir: PathBuf,

        /// A template feature to enable; may be repeated.
        #[arg(long = "feature", value_name = "NAME")]
        features: Vec<String>,

        /// A template parameter override (`KEY=VALUE`); may be repeated.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        variables: Vec<String>,

        #[arg(long)]
        force: bool,
    },
}

fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".zkgrc"))
}

fn load_user_config(path: &std::path::Path) -> Result<UserConfig> {
    if path.exists() {
        UserConfig::load(path)
    } else {
        Ok(UserConfig::default())
    }
}

fn parse_key_value_map(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = cliutil::split_key_value(pair)
                .with_context(|| format!("expected KEY=VALUE, got {pair:?}"))?;
            Ok((key.to_owned(), value.to_owned()))
        })
        .collect()
}

fn parse_request(spec: &str) -> Result<Request> {
    match spec.split_once('=') {
        Some((name, constraint)) => Ok(Request {
            canonical_name: name.to_owned(),
            constraint: constraint
                .parse()
                .with_context(|| format!("invalid constraint in {spec:?}"))?,
        }),
        None => Ok(Request {
            canonical_name: spec.to_owned(),
            constraint: Constraint::Any,
        }),
    }
}

fn build_context(cli: &Cli) -> Result<Context> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config = load_user_config(&config_path)?;

    let state_dir = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => config
            .paths
            .get("state_dir")
            .map(|s| PathBuf::from(s.clone()))
            .ok_or_else(|| anyhow!("no state directory: pass --state-dir or set [paths] state_dir in {}", config_path.display()))?,
    };
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state directory {}", state_dir.display()))?;

    let stage = resolve_stage_paths(&config);
    let manager_version = zkg_engine::version::parse_tag(env!("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| semver::Version::new(0, 1, 0));

    let capabilities: Arc<dyn PlatformCapabilities> = match &cli.capabilities_file {
        Some(path) => Arc::new(FileBackedCapabilities::load(path, manager_version)?),
        None => Arc::new(StubCapabilities {
            manager_version: Some(manager_version),
            ..Default::default()
        }),
    };

    Ok(Context::new(
        config,
        state_dir,
        stage,
        Arc::new(GitVcsDriver),
        capabilities,
    ))
}

fn print_package(package: &zkg_engine::manifest::InstalledPackage) {
    println!(
        "{}\t{}\t{:?}",
        package.canonical_name, package.version, package.status
    );
}

fn do_main() -> Result<()> {
    let cli = Cli::parse();
    let mut ctx = build_context(&cli)?;

    match cli.command {
        Commands::Refresh => orchestrator::refresh(&ctx)?,
        Commands::List => {
            for package in orchestrator::list(&ctx)? {
                print_package(&package);
            }
        }
        Commands::Search { query } => {
            for name in orchestrator::search(&ctx, &query)? {
                println!("{name}");
            }
        }
        Commands::Info { name } => {
            let metadata = orchestrator::info(&ctx, &name)?;
            println!("{}", metadata.description);
            if !metadata.depends.is_empty() {
                println!("depends:");
                for dep in &metadata.depends {
                    println!("  {dep}");
                }
            }
        }
        Commands::Install {
            packages,
            user_vars,
            force,
            skiptests,
        } => {
            let requests: Vec<Request> = packages.iter().map(|s| parse_request(s)).collect::<Result<_>>()?;
            let overrides = parse_key_value_map(&user_vars)?;
            let options = PipelineOptions {
                skip_tests: skiptests,
                force,
                add_to_load_set: true,
            };
            for package in orchestrator::install(&mut ctx, &requests, &overrides, options)? {
                print_package(&package);
            }
        }
        Commands::Remove { name } => orchestrator::remove(&mut ctx, &name)?,
        Commands::Purge { name } => orchestrator::purge(&mut ctx, &name)?,
        Commands::Load { name } => orchestrator::load(&mut ctx, &name)?,
        Commands::Unload { name } => orchestrator::unload(&mut ctx, &name)?,
        Commands::Pin { name } => orchestrator::pin(&mut ctx, &name)?,
        Commands::Unpin { name } => orchestrator::unpin(&mut ctx, &name)?,
        Commands::Upgrade {
            names,
            user_vars,
            force,
            skiptests,
        } => {
            let overrides = parse_key_value_map(&user_vars)?;
            let options = PipelineOptions {
                skip_tests: skiptests,
                force,
                add_to_load_set: true,
            };
            for package in orchestrator::upgrade(&mut ctx, &names, &overrides, options)? {
                print_package(&package);
            }
        }
        Commands::Test { name } => match orchestrator::test(&ctx, &name)? {
            Some(log_path) => println!("test passed, log at {}", log_path.display()),
            None => println!("{name} declares no test_command"),
        },
        Commands::Bundle { names, output } => {
            let names = if names.is_empty() { None } else { Some(names.as_slice()) };
            orchestrator::bundle(&mut ctx, names, &output)?;
        }
        Commands::Unbundle {
            tar_gz,
            known_capabilities,
            force,
            skiptests,
        } => {
            let options = PipelineOptions {
                skip_tests: skiptests,
                force,
                add_to_load_set: true,
            };
            let (installed, warnings) =
                orchestrator::unbundle(&mut ctx, &tar_gz, &known_capabilities, options)?;
            for package in &installed {
                print_package(package);
            }
            for warning in &warnings {
                eprintln!("WARNING: {warning}");
            }
        }
        Commands::Create {
            template_url,
            output_dir,
            features,
            variables,
            force,
        } => {
            let variables = parse_key_value_map(&variables)?;
            let record = orchestrator::create(&mut ctx, &template_url, &output_dir, &features, &variables, force)?;
            println!("created from {} @ {}", record.source_url, record.commit);
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    cli_main(do_main, Default::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_defaults_to_any() {
        let request = parse_request("bar").unwrap();
        assert_eq!(request.canonical_name, "bar");
        assert_eq!(request.constraint, Constraint::Any);
    }

    #[test]
    fn parse_request_reads_explicit_constraint() {
        let request = parse_request("bar=branch=dev").unwrap();
        assert_eq!(request.canonical_name, "bar");
        assert_eq!(request.constraint, Constraint::Branch("dev".to_owned()));
    }

    #[test]
    fn parse_request_rejects_malformed_constraint() {
        assert!(parse_request("bar=not a version").is_err());
    }

    #[test]
    fn parse_key_value_map_rejects_missing_equals() {
        assert!(parse_key_value_map(&["BROKEN".to_string()]).is_err());
    }

    #[test]
    fn cli_parses_install_with_user_vars_and_flags() {
        let cli = Cli::parse_from([
            "zkg",
            "install",
            "bar=branch=dev",
            "--user-var",
            "PREFIX=/opt",
            "--force",
            "--skiptests",
        ]);
        match cli.command {
            Commands::Install {
                packages,
                user_vars,
                force,
                skiptests,
            } => {
                assert_eq!(packages, vec!["bar=branch=dev".to_string()]);
                assert_eq!(user_vars, vec!["PREFIX=/opt".to_string()]);
                assert!(force);
                assert!(skiptests);
            }
            other => panic!("expected Install, got {other:?}"),
        }
    }
}
