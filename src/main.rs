// src/main.rs
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use revision_router::{load_config, AdminClient, Router, RouterConfig, Table};
use std::{net::SocketAddr, path::PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "revision-router", version, about = "Serve several revisions of one web app side by side")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the data plane and the admin API
    Serve(ServeArgs),
    /// Inspect or change the routing tables of a running router
    Admin {
        /// Base URL of the admin listener
        #[arg(long, env = "ROUTER_ADMIN_URL", default_value = "http://127.0.0.1:2001")]
        url: String,
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,
    #[arg(long)]
    proxy_addr: Option<SocketAddr>,
    #[arg(long)]
    admin_addr: Option<SocketAddr>,
    /// Directory holding sv.json, vr.json and rp.json
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    probe_timeout_ms: Option<u64>,
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum AdminAction {
    /// Print a whole table, or one entry when a key is given
    Get {
        #[arg(value_parser = parse_table)]
        table: Table,
        key: Option<String>,
    },
    /// Insert or overwrite an entry
    Set {
        #[arg(value_parser = parse_table)]
        table: Table,
        key: String,
        value: String,
    },
    /// Remove an entry
    Delete {
        #[arg(value_parser = parse_table)]
        table: Table,
        key: String,
    },
}

fn parse_table(name: &str) -> std::result::Result<Table, String> {
    Table::from_name(name).ok_or_else(|| format!("unknown table '{}' (expected sv, vr or rp)", name))
}

impl ServeArgs {
    fn into_config(self) -> Result<RouterConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => RouterConfig::default(),
        };

        if let Some(addr) = self.proxy_addr {
            config.proxy_addr = addr;
        }
        if let Some(addr) = self.admin_addr {
            config.admin_addr = addr;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.probe_timeout_ms = ms;
        }
        if self.metrics_addr.is_some() {
            config.metrics_addr = self.metrics_addr;
        }

        config.validate()?;
        Ok(config)
    }
}

async fn run_admin(url: &str, action: AdminAction) -> Result<()> {
    let client = AdminClient::new(url)?;

    match action {
        AdminAction::Get { table, key: None } => {
            let entries = client.get_table(table).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        AdminAction::Get { table, key: Some(key) } => match client.get_entry(table, &key).await? {
            Some(value) => println!("{}", value),
            None => bail!("{} has no entry for '{}'", table, key),
        },
        AdminAction::Set { table, key, value } => {
            client
                .set_entry(table, &key, &value)
                .await
                .with_context(|| format!("Failed to set {} '{}'", table, key))?;
        }
        AdminAction::Delete { table, key } => {
            client
                .delete_entry(table, &key)
                .await
                .with_context(|| format!("Failed to delete {} '{}'", table, key))?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,revision_router=debug")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => {
            let router = Router::new(args.into_config()?);
            router.start().await?;
        }
        Command::Admin { url, action } => run_admin(&url, action).await?,
    }

    Ok(())
}
