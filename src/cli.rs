// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Provision nodes and deploy containerized services to them")]
#[command(version)]
pub struct Cli {
    /// Verbose diagnostics on stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file (default: ./shipyard.yml, then ~/.config/shipyard/config.yml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Identifies a service and its optional colour variant.
#[derive(Args, Clone)]
pub struct ServiceArgs {
    /// Service name, matching deployment/<service>.yml
    pub service: String,

    /// Colour variant: deploys as <service>-<colour> with image tag <colour>
    #[arg(long)]
    pub colour: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a template shipyard.yml, create the state directory and check the local Docker daemon
    Bootstrap {
        /// Overwrite an existing shipyard.yml
        #[arg(long)]
        force: bool,
    },

    /// Build and push a service image without deploying it
    Build {
        #[command(flatten)]
        target: ServiceArgs,

        /// Tag to build as, overriding the configured one
        #[arg(long)]
        tag: Option<String>,
    },

    /// Provision a node and start a service on it
    Launch {
        #[command(flatten)]
        target: ServiceArgs,

        /// Node size, overriding the service config
        #[arg(long)]
        size: Option<String>,

        /// Region, overriding the service config
        #[arg(long)]
        region: Option<String>,

        /// Break a lock left by another operation
        #[arg(long)]
        force: bool,
    },

    /// Rebuild a running service and replace its container on the same node
    Redeploy {
        #[command(flatten)]
        target: ServiceArgs,

        /// Break a lock left by another operation
        #[arg(long)]
        force: bool,
    },

    /// Delete a service's node and owned database, and forget the service
    Terminate {
        #[command(flatten)]
        target: ServiceArgs,

        /// Break a lock left by another operation
        #[arg(long)]
        force: bool,
    },

    /// Show the container log of a service
    Log {
        #[command(flatten)]
        target: ServiceArgs,

        /// Only the last N lines
        #[arg(long)]
        tail: Option<u64>,

        /// Save the log to this file instead of printing it
        #[arg(long)]
        filename: Option<PathBuf>,
    },

    /// List known services
    Services {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage nodes outside of a service
    #[command(subcommand)]
    Node(NodeCommand),

    /// Manage databases outside of a service
    #[command(subcommand)]
    Database(DatabaseCommand),
}

#[derive(Subcommand)]
pub enum NodeCommand {
    /// List nodes
    List {
        #[arg(long)]
        json: bool,
    },

    /// Create a node
    Create {
        name: String,

        #[arg(long)]
        size: Option<String>,

        #[arg(long)]
        region: Option<String>,

        /// Base image for the node
        #[arg(long = "type")]
        node_type: Option<String>,
    },

    /// Delete a node that no service uses
    Destroy { id: String },
}

#[derive(Subcommand)]
pub enum DatabaseCommand {
    /// List databases
    List {
        #[arg(long)]
        json: bool,
    },

    /// Create a managed database cluster
    Create {
        name: String,

        #[arg(long, default_value = "pg")]
        engine: String,

        #[arg(long)]
        version: Option<String>,

        #[arg(long, default_value = "db-s-1vcpu-1gb")]
        size: String,

        #[arg(long)]
        region: Option<String>,
    },

    /// Delete a database that no service uses
    Destroy { id: String },
}
