//! `arbor` maintenance tool
//!
//! Thin command-line front end over the library: create databases, poke at
//! individual keys, scan ranges, and run the maintenance operations.

use std::error::Error;
use std::path::{Path, PathBuf};

use arbor::{Comparator, Database, DbError, DupMode, HashStore, JumpMode, OpenOptions, Tuning};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "arbor", version, about = "Inspect and maintain arbor B+ tree databases")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    #[arg(long, global = true, value_enum, default_value_t = CmpArg::Lex, help = "Key comparator")]
    cmp: CmpArg,

    #[arg(long, global = true, help = "Keys and values are given and printed as hex")]
    hex: bool,

    #[arg(long, global = true, value_name = "FILE", help = "JSON file with tuning parameters")]
    tuning: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a database")]
    Create {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(long, help = "Compress leaf pages")]
        compress: bool,
    },

    #[command(about = "Store a value")]
    Put {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        key: String,
        value: String,
        #[arg(long, value_enum, default_value_t = DupArg::Over, help = "Behavior for an existing key")]
        dup: DupArg,
    },

    #[command(about = "Remove the first value of a key")]
    Out {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        key: String,
        #[arg(long, help = "Remove every value of the key")]
        all: bool,
    },

    #[command(about = "Print the value of a key")]
    Get {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        key: String,
        #[arg(long, help = "Print every value of the key")]
        all: bool,
    },

    #[command(about = "List records in key order")]
    List {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(long, help = "Smallest key to list")]
        top: Option<String>,
        #[arg(long, help = "Largest key to list")]
        bottom: Option<String>,
        #[arg(long, help = "Walk from the largest key down")]
        reverse: bool,
        #[arg(long, help = "Stop after this many records")]
        max: Option<usize>,
        #[arg(long, help = "Print keys only")]
        keys_only: bool,
    },

    #[command(about = "Reclaim space held by dead records")]
    Optimize {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Print database statistics")]
    Inform {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(long, help = "Print as JSON")]
        json: bool,
    },

    #[command(about = "Rebuild a damaged database")]
    Repair {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Dump all records to a tab-separated file")]
    Export {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    #[command(about = "Load a dump into a new database")]
    Import {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    #[command(about = "Delete a database file")]
    Remove {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CmpArg {
    Lex,
    Int,
    Num,
    Dec,
}

impl From<CmpArg> for Comparator {
    fn from(arg: CmpArg) -> Self {
        match arg {
            CmpArg::Lex => Comparator::Lexical,
            CmpArg::Int => Comparator::NativeInt,
            CmpArg::Num => Comparator::BigEndianNum,
            CmpArg::Dec => Comparator::Decimal,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DupArg {
    Over,
    Keep,
    Cat,
    Dup,
}

impl From<DupArg> for DupMode {
    fn from(arg: DupArg) -> Self {
        match arg {
            DupArg::Over => DupMode::Overwrite,
            DupArg::Keep => DupMode::KeepExisting,
            DupArg::Cat => DupMode::Concatenate,
            DupArg::Dup => DupMode::AllowDuplicate,
        }
    }
}

#[derive(Serialize, Debug)]
struct Inform {
    name: String,
    file_size: u64,
    leaves: u32,
    nodes: u32,
    records: u32,
    compressed: bool,
    inode: u64,
    mtime: i64,
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let args = &cli.global;
    let cmp: Comparator = args.cmp.into();
    let tuning = args.tuning()?;

    match &cli.command {
        Command::Create { db_path, compress } => {
            let db = OpenOptions::new()
                .writer(true)
                .create(true)
                .truncate(true)
                .compress(*compress)
                .tuning(tuning)
                .open(db_path, cmp)?;
            db.close()?;
        }
        Command::Put {
            db_path,
            key,
            value,
            dup,
        } => {
            let mut db = open_writer(db_path, cmp, tuning)?;
            let stored = db.put(&args.key_bytes(key)?, &args.value_bytes(value)?, (*dup).into())?;
            db.close()?;
            if !stored {
                return Err("key already exists".into());
            }
        }
        Command::Out { db_path, key, all } => {
            let mut db = open_writer(db_path, cmp, tuning)?;
            let key = args.key_bytes(key)?;
            let removed = if *all { db.out_list(&key)? } else { db.out(&key)? };
            db.close()?;
            if !removed {
                return Err("no such key".into());
            }
        }
        Command::Get { db_path, key, all } => {
            let mut db = open_reader(db_path, cmp, tuning)?;
            let key = args.key_bytes(key)?;
            let values = if *all {
                db.get_list(&key)?
            } else {
                db.get(&key)?.map(|value| vec![value])
            };
            db.close()?;
            let Some(values) = values else {
                return Err("no such key".into());
            };
            for value in values {
                println!("{}", args.show_value(&value));
            }
        }
        Command::List {
            db_path,
            top,
            bottom,
            reverse,
            max,
            keys_only,
        } => {
            let mut db = open_reader(db_path, cmp, tuning)?;
            let top = top.as_deref().map(|k| args.key_bytes(k)).transpose()?;
            let bottom = bottom.as_deref().map(|k| args.key_bytes(k)).transpose()?;
            list(&mut db, args, top, bottom, *reverse, *max, *keys_only)?;
            db.close()?;
        }
        Command::Optimize { db_path } => {
            let mut db = open_writer(db_path, cmp, tuning)?;
            db.optimize()?;
            db.close()?;
        }
        Command::Inform { db_path, json } => {
            let db = open_reader(db_path, cmp, tuning)?;
            let report = Inform {
                name: db.name().to_string(),
                file_size: db.file_size(),
                leaves: db.leaf_count(),
                nodes: db.node_count(),
                records: db.record_count(),
                compressed: db.is_compressed(),
                inode: db.inode(),
                mtime: db.mtime(),
            };
            db.close()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("name: {}", report.name);
                println!("file size: {}", report.file_size);
                println!("leaf nodes: {}", report.leaves);
                println!("non-leaf nodes: {}", report.nodes);
                println!("records: {}", report.records);
                println!("compressed: {}", report.compressed);
                println!("inode: {}", report.inode);
                println!("modified time: {}", report.mtime);
            }
        }
        Command::Repair { db_path } => {
            Database::repair(db_path, cmp)?;
        }
        Command::Export { db_path, file } => {
            let mut db = open_reader(db_path, cmp, tuning)?;
            let rows = db.export(file)?;
            db.close()?;
            println!("exported {rows} records");
        }
        Command::Import { db_path, file } => {
            let mut db = OpenOptions::new()
                .writer(true)
                .create(true)
                .tuning(tuning)
                .open(db_path, cmp)?;
            let rows = db.import(file)?;
            db.close()?;
            println!("imported {rows} records");
        }
        Command::Remove { db_path } => {
            Database::remove(db_path)?;
        }
    }

    Ok(())
}

fn open_writer(path: &Path, cmp: Comparator, tuning: Tuning) -> Result<Database<HashStore>, DbError> {
    OpenOptions::new().writer(true).tuning(tuning).open(path, cmp)
}

fn open_reader(path: &Path, cmp: Comparator, tuning: Tuning) -> Result<Database<HashStore>, DbError> {
    OpenOptions::new().tuning(tuning).open(path, cmp)
}

fn list(
    db: &mut Database<HashStore>,
    args: &GlobalArgs,
    top: Option<Vec<u8>>,
    bottom: Option<Vec<u8>>,
    reverse: bool,
    max: Option<usize>,
    keys_only: bool,
) -> Result<(), DbError> {
    let cmp = db.comparator();
    let mut more = match (reverse, &top, &bottom) {
        (false, Some(top), _) => db.cursor_jump(top, JumpMode::Forward)?,
        (false, None, _) => db.cursor_first()?,
        (true, _, Some(bottom)) => db.cursor_jump(bottom, JumpMode::Backward)?,
        (true, _, None) => db.cursor_last()?,
    };

    let mut printed = 0;
    while more && max.is_none_or(|max| printed < max) {
        let Some((key, value)) = db.cursor_record()? else {
            break;
        };
        let past_end = if reverse {
            top.as_ref().is_some_and(|top| cmp.compare(&key, top).is_lt())
        } else {
            bottom.as_ref().is_some_and(|bottom| cmp.compare(&key, bottom).is_gt())
        };
        if past_end {
            break;
        }

        if keys_only {
            println!("{}", args.show_key(&key));
        } else {
            println!("{}\t{}", args.show_key(&key), args.show_value(&value));
        }
        printed += 1;
        more = if reverse { db.cursor_prev()? } else { db.cursor_next()? };
    }
    Ok(())
}

impl GlobalArgs {
    fn tuning(&self) -> Result<Tuning, Box<dyn Error>> {
        match &self.tuning {
            Some(file) => Ok(serde_json::from_slice(&std::fs::read(file)?)?),
            None => Ok(Tuning::default()),
        }
    }

    fn key_bytes(&self, text: &str) -> Result<Vec<u8>, Box<dyn Error>> {
        if self.hex {
            return Ok(hex::decode(text)?);
        }
        match self.cmp {
            CmpArg::Int => Ok(text.trim().parse::<i32>()?.to_ne_bytes().to_vec()),
            CmpArg::Num => Ok(text.trim().parse::<u64>()?.to_be_bytes().to_vec()),
            CmpArg::Lex | CmpArg::Dec => Ok(text.as_bytes().to_vec()),
        }
    }

    fn value_bytes(&self, text: &str) -> Result<Vec<u8>, Box<dyn Error>> {
        if self.hex {
            Ok(hex::decode(text)?)
        } else {
            Ok(text.as_bytes().to_vec())
        }
    }

    fn show_key(&self, key: &[u8]) -> String {
        if self.hex {
            return hex::encode(key);
        }
        match self.cmp {
            CmpArg::Int => match <[u8; 4]>::try_from(key) {
                Ok(bytes) => i32::from_ne_bytes(bytes).to_string(),
                Err(_) => hex::encode(key),
            },
            CmpArg::Num => match <[u8; 8]>::try_from(key) {
                Ok(bytes) => u64::from_be_bytes(bytes).to_string(),
                Err(_) => hex::encode(key),
            },
            CmpArg::Lex | CmpArg::Dec => String::from_utf8_lossy(key).into_owned(),
        }
    }

    fn show_value(&self, value: &[u8]) -> String {
        if self.hex {
            hex::encode(value)
        } else {
            String::from_utf8_lossy(value).into_owned()
        }
    }
}
