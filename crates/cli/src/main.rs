use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use doclink_core::{
    CancelToken, ChunkStore, DoclinkConfig, DomainId, FileId, IngestRequest, PlanTier,
    RetrieveRequest, UserId,
};
use doclink_rag::{open_sqlite, write_identity, SqlitePipeline};

#[derive(Parser, Debug)]
#[command(name = "doclink", version, about = "Doclink retrieval core operator CLI")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Config file; defaults to $DOCLINK_CONFIG or doclink.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long, global = true)]
    identity: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an age identity for wrapping per-file keys.
    Keygen {
        #[arg(long, default_value = "doclink-identity.txt")]
        out: PathBuf,
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Create the database schema.
    Init,
    #[command(subcommand)]
    User(UserCommand),
    #[command(subcommand)]
    Domain(DomainCommand),
    /// Ingest a JSON ingest request ("-" reads stdin).
    Ingest { input: PathBuf },
    /// Run a JSON retrieve request ("-" reads stdin).
    Retrieve {
        input: PathBuf,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
    },
    DeleteFile { user: String, file: String },
    /// Write the sealed envelope of one chunk.
    ExportChunk {
        chunk_id: i64,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    Add {
        user: String,
        #[arg(long, default_value = "free")]
        tier: String,
    },
    Usage { user: String },
}

#[derive(Subcommand, Debug)]
enum DomainCommand {
    Create {
        user: String,
        name: String,
        #[arg(long)]
        id: Option<String>,
    },
    Rename {
        user: String,
        domain: String,
        name: String,
    },
    List { user: String },
    Files { user: String, domain: String },
    Delete { user: String, domain: String },
}

fn main() -> Result<()> {
    init_tracing();
    run(Cli::parse())
}

fn run(cli: Cli) -> Result<()> {
    let Cli { store, command } = cli;
    match command {
        Commands::Keygen { out, force } => keygen(&out, force)?,
        Commands::Init => {
            let (config, _) = store.open()?;
            info!(database = %config.database.display(), "schema ready");
            println!("initialized {}", config.database.display());
        }
        Commands::User(cmd) => run_user(&store.open()?.1, cmd)?,
        Commands::Domain(cmd) => run_domain(&store.open()?.1, cmd)?,
        Commands::Ingest { input } => {
            let request: IngestRequest = read_json(&input)?;
            let (_, pipeline) = store.open()?;
            let report = pipeline.ingest_file(&request)?;
            print_json(&report)?;
        }
        Commands::Retrieve {
            input,
            json,
            timeout_secs,
        } => {
            let request: RetrieveRequest = read_json(&input)?;
            let (_, pipeline) = store.open()?;
            let cancel = match timeout_secs {
                Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
                None => CancelToken::new(),
            };
            let retrieval = pipeline.retrieve(&request, &cancel)?;
            if json {
                print_json(&retrieval)?;
            } else if retrieval.is_empty() {
                println!("no matching context");
            } else {
                print!("{}", retrieval.render());
            }
            if !retrieval.skipped.is_empty() {
                eprintln!(
                    "warning: {} chunk(s) excluded as unreadable",
                    retrieval.skipped.len()
                );
            }
        }
        Commands::DeleteFile { user, file } => {
            let (_, pipeline) = store.open()?;
            let deleted = pipeline.delete_file(&UserId::new(user), &FileId::new(file))?;
            println!("{}", if deleted { "deleted" } else { "not found" });
        }
        Commands::ExportChunk { chunk_id, out } => {
            let (_, pipeline) = store.open()?;
            let stored = pipeline.store().get_chunk_text(chunk_id)?;
            fs::write(&out, stored.sealed.to_bytes())
                .with_context(|| format!("writing {}", out.display()))?;
            println!("chunk {chunk_id} of file {} -> {}", stored.file_id, out.display());
        }
    }
    Ok(())
}

fn run_user(pipeline: &SqlitePipeline, cmd: UserCommand) -> Result<()> {
    match cmd {
        UserCommand::Add { user, tier } => {
            let tier = PlanTier::parse(&tier).ok_or_else(|| anyhow!("unknown plan tier {tier}"))?;
            pipeline.ensure_user(&UserId::new(user.as_str()), tier)?;
            println!("user {user} ({})", tier.as_str());
        }
        UserCommand::Usage { user } => print_json(&pipeline.usage(&UserId::new(user))?)?,
    }
    Ok(())
}

fn run_domain(pipeline: &SqlitePipeline, cmd: DomainCommand) -> Result<()> {
    match cmd {
        DomainCommand::Create { user, name, id } => {
            let domain = pipeline.create_domain(&UserId::new(user), &name, id.map(DomainId::new))?;
            println!("{domain}");
        }
        DomainCommand::Rename { user, domain, name } => {
            pipeline.rename_domain(&UserId::new(user), &DomainId::new(domain), &name)?;
        }
        DomainCommand::List { user } => print_json(&pipeline.list_domains(&UserId::new(user))?)?,
        DomainCommand::Files { user, domain } => {
            print_json(&pipeline.list_files(&UserId::new(user), &DomainId::new(domain))?)?
        }
        DomainCommand::Delete { user, domain } => {
            let files = pipeline.delete_domain(&UserId::new(user), &DomainId::new(domain))?;
            println!("removed domain and {} file(s)", files.len());
        }
    }
    Ok(())
}

fn keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", out.display());
    }
    let recipient = write_identity(out)?;
    println!("wrote {}", out.display());
    println!("public key: {recipient}");
    Ok(())
}

impl StoreArgs {
    fn resolve_config(&self) -> Result<DoclinkConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = DoclinkConfig::from_file(path)?;
                config.apply_env();
                config
            }
            None => DoclinkConfig::load()?,
        };
        if let Some(db) = &self.db {
            config.database = db.clone();
        }
        if let Some(identity) = &self.identity {
            config.identity_path = Some(identity.clone());
        }
        config.validate()?;
        Ok(config)
    }

    /// Resolves config and opens the store. Keygen never gets here, so a
    /// fresh install can create its identity before any config exists.
    fn open(&self) -> Result<(DoclinkConfig, SqlitePipeline)> {
        let config = self.resolve_config()?;
        let pipeline = open_sqlite(&config)?;
        Ok((config, pipeline))
    }
}

fn read_json<T: DeserializeOwned>(input: &Path) -> Result<T> {
    let raw = if input == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", input.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::ffi::OsStr;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_nested_domain_commands() {
        let cli = Cli::try_parse_from([
            "doclink", "--db", "x.sqlite", "domain", "create", "u1", "Reports", "--id", "d1",
        ])
        .unwrap();
        assert_eq!(cli.store.db, Some(PathBuf::from("x.sqlite")));
        assert!(matches!(
            cli.command,
            Commands::Domain(DomainCommand::Create { ref id, .. }) if id.as_deref() == Some("d1")
        ));
    }

    #[test]
    fn keygen_runs_without_a_config_or_store() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("identity.txt");
        let missing = dir.path().join("absent.toml");
        let cli = Cli::try_parse_from([
            OsStr::new("doclink"),
            OsStr::new("--config"),
            missing.as_os_str(),
            OsStr::new("keygen"),
            OsStr::new("--out"),
            out.as_os_str(),
        ])
        .unwrap();
        run(cli).unwrap();
        assert!(out.exists());
        assert!(!dir.path().join("doclink.sqlite").exists());

        let again = Cli::try_parse_from([
            OsStr::new("doclink"),
            OsStr::new("keygen"),
            OsStr::new("--out"),
            out.as_os_str(),
        ])
        .unwrap();
        assert!(run(again).is_err());
    }
}
