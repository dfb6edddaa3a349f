use clap::{Parser, Subcommand};
use kvdbm::{get_usednames_ex, Dbm, DbmErrorKind, FilePerms, OpenMode};
use std::path::PathBuf;
use std::process::exit;
use tracing::{debug, Level};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: SubCommand,

    #[clap(long = "type", short = 't', default_value = "default")]
    #[clap(help = "Backend serving the database: sdbm, gdbm, db or default")]
    dbm_type: String,

    #[clap(long, short = 'p')]
    #[clap(help = "Logical path of the database, defaults to ./kvdbm")]
    path: Option<PathBuf>,

    #[clap(long, short = 'v')]
    #[clap(help = "Log what the dispatcher and backend do to stderr")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    #[clap(about = "Get the value of a given key")]
    Get {
        #[clap(help = "The key")]
        key: String,
    },

    #[clap(about = "Set the value of a given key")]
    Set {
        #[clap(help = "The key")]
        key: String,
        #[clap(help = "The value assigned to key")]
        val: String,
    },

    #[clap(about = "Remove a given key")]
    Rm {
        #[clap(help = "The key to remove")]
        key: String,
    },

    #[clap(about = "Check whether a given key is present")]
    Exists {
        #[clap(help = "The key")]
        key: String,
    },

    #[clap(about = "List all keys")]
    List,

    #[clap(about = "Print the files the backend uses for the database")]
    Names,
}

impl SubCommand {
    fn mode(&self) -> OpenMode {
        match self {
            SubCommand::Set { .. } => OpenMode::RwCreate,
            SubCommand::Rm { .. } => OpenMode::ReadWrite,
            _ => OpenMode::ReadOnly,
        }
    }
}

fn main() {
    let args = Args::parse();

    // set log collector
    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    debug!("Application Started: Version {}", env!("CARGO_PKG_VERSION"));

    let path = args.path.unwrap_or_else(|| {
        std::env::current_dir()
            .expect("Cannot Open Working Directory")
            .join("kvdbm")
    });

    if let SubCommand::Names = args.command {
        match get_usednames_ex(&args.dbm_type, &path) {
            Ok((used1, used2)) => {
                println!("{}", used1.display());
                if let Some(used2) = used2 {
                    println!("{}", used2.display());
                }
                exit(0);
            }
            Err(error) => {
                eprintln!("{}", error.message());
                exit(1);
            }
        }
    }

    let mut db = match Dbm::open_ex(&args.dbm_type, &path, args.command.mode(), FilePerms::default()) {
        Ok(db) => db,
        Err(error) => {
            eprintln!("{}", error.message());
            exit(1);
        }
    };

    let code = run(&mut db, args.command);
    db.close();
    exit(code);
}

// returns the process exit code
fn run(db: &mut Dbm, command: SubCommand) -> i32 {
    let result = match command {
        SubCommand::Get { key } => db.fetch(key).map(|val| match val {
            Some(val) => println!("{}", String::from_utf8_lossy(&val)),
            None => println!("Key not found"),
        }),

        SubCommand::Set { key, val } => db.store(key, val),

        SubCommand::Rm { key } => match db.delete(key) {
            Err(error) if error.kind() == DbmErrorKind::KeyNotFound => {
                println!("Key not found");
                return 1;
            }
            other => other,
        },

        SubCommand::Exists { key } => {
            if db.exists(key) {
                println!("true");
                return 0;
            } else {
                println!("false");
                return 1;
            }
        }

        SubCommand::List => db.keys().try_for_each(|key| -> kvdbm::Result<()> {
            println!("{}", String::from_utf8_lossy(&key?));
            Ok(())
        }),

        SubCommand::Names => Ok(()),
    };

    match result {
        Ok(()) => 0,
        Err(_) => {
            let (_, message) = db.geterror(usize::MAX);
            eprintln!("{}", message);
            1
        }
    }
}
