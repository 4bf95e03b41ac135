// Copyright 2023 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use miette::{Context as _, IntoDiagnostic, miette};
use modstash::{
    config::Config,
    context::Context,
    package::{Artifacts, PackagePath},
    storage::Storage,
};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

#[derive(Parser)]
#[command(author, version, about, long_about)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file, defaults are used without one
    #[clap(long, short, env = "MODSTASH_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Makes sure a package version is stored and writes its parts to disk
    Get {
        /// Package path (e.g. github.com/pkg/errors)
        path: PackagePath,
        /// Version or revision
        version: String,
        /// Directory to write the parts into
        #[clap(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Lists stored and upstream versions of a package
    List {
        /// Package path
        path: PackagePath,
    },

    /// Resolves the latest version of a package
    Latest {
        /// Package path
        path: PackagePath,
    },

    /// Checks whether a package version is stored
    Exists {
        /// Package path
        path: PackagePath,
        /// Version
        version: String,
    },

    /// Enumerates stored package versions
    Catalog {
        /// Continue after this entry
        #[clap(long)]
        token: Option<String>,
        /// Entries per page
        #[clap(long, default_value_t = 100)]
        page_size: usize,
    },

    /// Removes a stored package version
    #[clap(alias = "rm")]
    Delete {
        /// Package path
        path: PackagePath,
        /// Version
        version: String,
    },
}

async fn context(config: Option<PathBuf>) -> miette::Result<Arc<Context>> {
    match config {
        Some(path) => Context::open(&path).await,
        None => Context::create(&Config::default()).await,
    }
}

async fn write(out_dir: &Path, version: &str, artifacts: &Artifacts) -> miette::Result<()> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .into_diagnostic()
        .wrap_err(miette!("failed to create {}", out_dir.display()))?;

    let parts = [
        (Artifacts::INFO_EXTENSION, &artifacts.info),
        (Artifacts::MANIFEST_EXTENSION, &artifacts.manifest),
        (Artifacts::ARCHIVE_EXTENSION, &artifacts.archive),
    ];

    for (extension, data) in parts {
        let file = out_dir.join(format!("{version}.{extension}"));
        tokio::fs::write(&file, data)
            .await
            .into_diagnostic()
            .wrap_err(miette!("failed to write {}", file.display()))?;
        println!("{}", file.display());
    }

    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> miette::Result<()> {
    human_panic::setup_panic!();

    tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_file(false)
        .with_target(false)
        .with_line_number(false)
        .try_init()
        .map_err(|error| miette!("failed to initialize logging: {error}"))?;

    let cli = Cli::parse();
    let context = context(cli.config)
        .await
        .wrap_err("failed to set up the proxy")?;
    let protocol = context.protocol();

    match cli.command {
        Command::Get {
            path,
            version,
            out_dir,
        } => {
            let (version, artifacts) = protocol
                .materialize(&path, &version)
                .await
                .wrap_err(miette!("failed to get {path}@{version}"))?;
            write(&out_dir, &version, &artifacts).await
        }
        Command::List { path } => {
            let versions = protocol
                .list(&path)
                .await
                .wrap_err(miette!("failed to list {path}"))?;
            for version in versions {
                println!("{version}");
            }
            Ok(())
        }
        Command::Latest { path } => {
            let info = protocol
                .latest(&path)
                .await
                .wrap_err(miette!("failed to resolve the latest version of {path}"))?;
            let json = serde_json::to_string(&info).into_diagnostic()?;
            println!("{json}");
            Ok(())
        }
        Command::Exists { path, version } => {
            let exists = protocol.exists(&path, &version).await;
            println!("{exists}");
            Ok(())
        }
        Command::Catalog { token, page_size } => {
            let page = context
                .storage()
                .catalog(token.as_deref(), page_size)
                .await
                .into_diagnostic()
                .wrap_err("failed to enumerate storage")?;
            for (path, version) in page.entries {
                println!("{path}@{version}");
            }
            if let Some(next) = page.next {
                tracing::info!("more entries follow, continue with --token {next}");
            }
            Ok(())
        }
        Command::Delete { path, version } => context
            .storage()
            .delete(&path, &version)
            .await
            .into_diagnostic()
            .wrap_err(miette!("failed to delete {path}@{version}")),
    }
}
