use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify one or more image files
    Verify {
        /// Image files; several frames with --live are decided by vote
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Treat the images as consecutive frames of a live capture
        #[arg(long)]
        live: bool,
    },
    /// Send image files as frames of a named stream
    Stream {
        stream_id: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Register a new identity from a reference image
    Register {
        image: PathBuf,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        #[arg(long, default_value = "")]
        department: String,
        #[arg(long, default_value = "")]
        position: String,
    },
    /// List registered identities
    List,
    /// Delete an identity by id
    Delete { id: String },
    /// Show recent verification log entries for an identity
    History {
        id: String,
        /// Number of entries; the daemon default when omitted
        #[arg(short = 'n', long, default_value_t = 0)]
        limit: u32,
    },
    /// Show daemon status
    Status,
    /// Compare local identities with the remote face collection
    Audit,
    /// Re-link local identities to their remote faces
    Fix,
    /// Delete remote faces no local identity claims
    Clean,
    /// Audit, fix, clean and re-audit
    Recover,
    /// Re-enable the remote provider
    EnableRemote,
    /// Stop consulting the remote provider
    DisableRemote,
    /// Clear adaptive verification history
    ResetHistory {
        /// Identity id; all identities when omitted
        user: Option<String>,
    },
}

#[zbus::proxy(
    interface = "org.facegate.Engine1",
    default_service = "org.facegate.Engine1",
    default_path = "/org/facegate/Engine1"
)]
trait Facegate {
    async fn verify(&self, frames: Vec<Vec<u8>>, live: bool) -> zbus::Result<String>;
    async fn verify_stream(&self, stream_id: &str, frame: Vec<u8>) -> zbus::Result<String>;
    async fn register(
        &self,
        image: Vec<u8>,
        name: &str,
        email: &str,
        department: &str,
        position: &str,
    ) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn delete_identity(&self, id: &str) -> zbus::Result<()>;
    async fn verification_history(&self, id: &str, limit: u32) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn reset_history(&self, user: &str) -> zbus::Result<()>;
    async fn set_remote_enabled(&self, enabled: bool) -> zbus::Result<()>;
    async fn audit_sync(&self) -> zbus::Result<String>;
    async fn fix_sync(&self) -> zbus::Result<u64>;
    async fn clean_orphans(&self) -> zbus::Result<u64>;
    async fn recover_sync(&self) -> zbus::Result<String>;
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(bytes)
}

/// Pretty-print a JSON reply from the daemon.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = FacegateProxy::new(&conn)
        .await
        .context("facegated is not reachable")?;

    match cli.command {
        Commands::Verify { images, live } => {
            let frames = images.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            tracing::debug!(frames = frames.len(), live, "sending verify request");
            print_json(&proxy.verify(frames, live).await?)?;
        }
        Commands::Stream { stream_id, images } => {
            for path in &images {
                let reply = proxy.verify_stream(&stream_id, read_image(path)?).await?;
                println!("{}:", path.display());
                print_json(&reply)?;
            }
        }
        Commands::Register {
            image,
            name,
            email,
            department,
            position,
        } => {
            let bytes = read_image(&image)?;
            let reply = proxy.register(bytes, &name, &email, &department, &position).await?;
            print_json(&reply)?;
        }
        Commands::List => {
            let reply = proxy.list_identities().await?;
            let identities: Vec<serde_json::Value> = serde_json::from_str(&reply)?;
            if identities.is_empty() {
                println!("No identities registered");
            } else {
                print_json(&reply)?;
            }
        }
        Commands::Delete { id } => {
            proxy.delete_identity(&id).await?;
            println!("Deleted {id}");
        }
        Commands::History { id, limit } => {
            let reply = proxy.verification_history(&id, limit).await?;
            let records: Vec<serde_json::Value> = serde_json::from_str(&reply)?;
            if records.is_empty() {
                println!("No verifications logged for {id}");
            } else {
                print_json(&reply)?;
            }
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Audit => print_json(&proxy.audit_sync().await?)?,
        Commands::Fix => println!("{} identities re-linked", proxy.fix_sync().await?),
        Commands::Clean => println!("{} orphaned faces deleted", proxy.clean_orphans().await?),
        Commands::Recover => print_json(&proxy.recover_sync().await?)?,
        Commands::EnableRemote => {
            proxy.set_remote_enabled(true).await?;
            println!("Remote provider enabled");
        }
        Commands::DisableRemote => {
            proxy.set_remote_enabled(false).await?;
            println!("Remote provider disabled");
        }
        Commands::ResetHistory { user } => {
            proxy.reset_history(user.as_deref().unwrap_or("")).await?;
            println!("History reset for {}", user.as_deref().unwrap_or("all identities"));
        }
    }

    Ok(())
}
