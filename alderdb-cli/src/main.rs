use alderdb::{Database, Error, HashKind, ResourceConfig, Versioning};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "alderdb", version, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a database directory.
    CreateDb {
        /// Database path; defaults to ALDERDB_HOME.
        path: Option<PathBuf>,
    },
    /// Delete a database and all its resources.
    DropDb {
        path: Option<PathBuf>,
    },
    /// Create and bootstrap a resource.
    CreateResource {
        name: String,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "sliding-snapshot")]
        versioning: VersioningArg,
        /// Past revisions consulted when reconstructing a page.
        #[arg(long, default_value_t = 4)]
        revs_to_restore: u32,
        #[arg(long, value_enum, default_value = "rolling")]
        hashing: HashingArg,
        /// Assign hierarchical order labels to records.
        #[arg(long)]
        dewey_ids: bool,
    },
    /// Delete a resource.
    DropResource {
        name: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List the resources of a database.
    ListResources {
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VersioningArg {
    Full,
    Differential,
    Incremental,
    SlidingSnapshot,
}

impl From<VersioningArg> for Versioning {
    fn from(v: VersioningArg) -> Self {
        match v {
            VersioningArg::Full => Versioning::Full,
            VersioningArg::Differential => Versioning::Differential,
            VersioningArg::Incremental => Versioning::Incremental,
            VersioningArg::SlidingSnapshot => Versioning::SlidingSnapshot,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HashingArg {
    Rolling,
    Postorder,
    None,
}

impl From<HashingArg> for HashKind {
    fn from(h: HashingArg) -> Self {
        match h {
            HashingArg::Rolling => HashKind::Rolling,
            HashingArg::Postorder => HashKind::Postorder,
            HashingArg::None => HashKind::None,
        }
    }
}

fn db_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os("ALDERDB_HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("alderdb-data"))
}

fn run(cli: Cli) -> alderdb::Result<()> {
    match cli.command {
        Commands::CreateDb { path } => {
            let dir = db_dir(path);
            let db = Database::create(&dir)?;
            println!("created database {} at {}", db.name(), db.path().display());
        }
        Commands::DropDb { path } => {
            let dir = db_dir(path);
            Database::drop_database(&dir)?;
            println!("dropped database at {}", dir.display());
        }
        Commands::CreateResource {
            name,
            db,
            versioning,
            revs_to_restore,
            hashing,
            dewey_ids,
        } => {
            let database = Database::open(db_dir(db))?;
            let config = ResourceConfig {
                versioning: versioning.into(),
                revs_to_restore,
                hashing: hashing.into(),
                use_dewey_ids: dewey_ids,
                ..ResourceConfig::default()
            };
            database.create_resource(&name, config)?;
            println!("created resource {name}");
        }
        Commands::DropResource { name, db } => {
            let database = Database::open(db_dir(db))?;
            database.drop_resource(&name)?;
            println!("dropped resource {name}");
        }
        Commands::ListResources { db } => {
            let database = Database::open(db_dir(db))?;
            for name in database.list_resources()? {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn exit_code(error: &Error) -> u8 {
    match error {
        Error::Usage(_)
        | Error::DuplicateAttribute
        | Error::DuplicateNamespace
        | Error::MoveIntoDescendant
        | Error::InvalidMove(_)
        | Error::InvalidContent(_) => 1,
        Error::WriterBusy => 3,
        Error::InvalidRevision(_) | Error::NotFound(_) => 4,
        Error::Storage(s) => match s {
            alderdb::storage::Error::ResourceLocked => 3,
            alderdb::storage::Error::ResourceNotFound(_)
            | alderdb::storage::Error::RevisionNotFound(_)
            | alderdb::storage::Error::RecordNotFound(_) => 4,
            alderdb::storage::Error::ResourceExists(_) | alderdb::storage::Error::Config(_) => 1,
            _ => 2,
        },
        _ => 2,
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}
