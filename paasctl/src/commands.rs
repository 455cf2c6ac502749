/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2024. All rights reserved.
 * KubeOS is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */


use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use workloads::entities::{Environment, ExposedUrlType};

#[derive(Parser)]
#[clap(name = "paasctl")]
#[clap(author, version, about)]
#[clap(about = "Operate the workload control plane: addresses, domains, deployments and processes")]
pub struct Cli {
    /// Enable debug logging
    #[clap(short, long, action)]
    pub debug: bool,
    /// Path to the control plane configuration
    #[arg(short, long, value_parser, default_value = "/etc/paas/control-plane.toml")]
    pub config: PathBuf,
    #[clap(subcommand)]
    pub commands: Commands,
}

/// Identifies one workload slot.
#[derive(clap::Args, Debug, Clone)]
pub struct Target {
    /// Application code
    #[arg(long)]
    pub app: String,
    /// Module name
    #[arg(long, default_value = "default")]
    pub module: String,
    /// Environment, `stag` or `prod`
    #[arg(long, default_value = "prod")]
    pub env: Environment,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the addresses allocated to a module
    Addrs {
        #[command(flatten)]
        target: Target,
        /// The module is not the application's default one
        #[arg(long, action)]
        non_default: bool,
        #[arg(long, value_enum, default_value = "subdomain")]
        exposed_type: UrlType,
        /// Also list addresses on reserved root domains
        #[arg(long, action)]
        include_reserved: bool,
    },
    /// Check a custom domain before binding it
    DomainCheck {
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "/")]
        path_prefix: String,
        #[arg(long, default_value = "prod")]
        env: Environment,
    },
    /// Build and release an application described by a YAML file
    Deploy(DeployArgs),
    /// Inspect the processes of a module
    Processes {
        #[clap(subcommand)]
        command: ProcessesCommand,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct DeployArgs {
    /// Application description
    #[arg(short, long, value_parser)]
    pub file: PathBuf,
    #[arg(long, default_value = "default")]
    pub module: String,
    #[arg(long, default_value = "prod")]
    pub env: Environment,
    /// Branch or tag being deployed
    #[arg(long)]
    pub version_name: String,
    #[arg(long, default_value = "")]
    pub revision: String,
    /// Blob store key of the source tarball
    #[arg(long, default_value = "")]
    pub source: String,
    /// Stop after the build phase
    #[arg(long, action)]
    pub build_only: bool,
    /// Store snapshot to resume from and save to
    #[arg(long, value_parser)]
    pub snapshot: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum ProcessesCommand {
    /// Print processes and instances once
    List {
        /// Application description
        #[arg(short, long, value_parser)]
        file: PathBuf,
        #[command(flatten)]
        target: Target,
    },
    /// Follow process and instance changes
    Watch {
        /// Application description
        #[arg(short, long, value_parser)]
        file: PathBuf,
        #[command(flatten)]
        target: Target,
        /// Seconds before the watch ends
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum UrlType {
    #[clap(name = "subdomain")]
    Subdomain,
    #[clap(name = "subpath")]
    Subpath,
}

impl From<UrlType> for ExposedUrlType {
    fn from(value: UrlType) -> Self {
        match value {
            UrlType::Subdomain => ExposedUrlType::Subdomain,
            UrlType::Subpath => ExposedUrlType::Subpath,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::try_parse_from([
            "paasctl",
            "-d",
            "deploy",
            "-f",
            "app.yaml",
            "--env",
            "stag",
            "--version-name",
            "main",
        ])
        .unwrap();
        assert!(cli.debug);
        match cli.commands {
            Commands::Deploy(args) => {
                assert_eq!(args.env, Environment::Stag);
                assert_eq!(args.version_name, "main");
                assert_eq!(args.module, "default");
                assert!(args.snapshot.is_none());
            },
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn test_unknown_env_is_rejected() {
        assert!(Cli::try_parse_from(["paasctl", "addrs", "--app", "foo", "--env", "dev"]).is_err());
    }

    #[test]
    fn test_parse_processes_watch() {
        let cli =
            Cli::try_parse_from(["paasctl", "processes", "watch", "-f", "app.yaml", "--app", "foo", "--timeout", "5"])
                .unwrap();
        match cli.commands {
            Commands::Processes { command: ProcessesCommand::Watch { target, timeout, .. } } => {
                assert_eq!(target.app, "foo");
                assert_eq!(target.env, Environment::Prod);
                assert_eq!(timeout, 5);
            },
            _ => panic!("expected processes watch"),
        }
    }
}
