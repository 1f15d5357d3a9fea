#![forbid(unsafe_code)]
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser, Subcommand};
use treepatch::{Bsdiff, Compression, PackageBuilder};

#[derive(Parser, Debug)]
#[command(
    name = "treediff",
    version,
    about = "build bsdiff 4.x patch packages from two directory trees",
    long_about = None,
)]
struct TreediffArgs {
    #[command(subcommand)]
    command: Command,

    /// more logging (repeat for more)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// only log errors
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// build a patch package turning SOURCE into TARGET
    Folder {
        /// folder holding the files to update
        #[arg(value_name = "SOURCE")]
        source: PathBuf,

        /// folder holding the updated files
        #[arg(value_name = "TARGET")]
        target: PathBuf,

        /// folder receiving the package
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// only print what would be done
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// remove OUTPUT first if it already exists
        #[arg(short = 'y', long)]
        yes: bool,

        /// bzip2 level (1-9)
        #[arg(short = 'z', value_name = "LEVEL", default_value_t = 9)]
        level: u32,
    },

    /// diff a single pair of files
    File {
        /// source file
        #[arg(value_name = "SOURCE")]
        source_path: PathBuf,

        /// target file
        #[arg(value_name = "TARGET")]
        target_path: PathBuf,

        /// patch file
        #[arg(value_name = "PATCH")]
        patch_path: PathBuf,

        /// skip small matches
        #[arg(short = 's', value_name = "SMALL")]
        small_match: Option<usize>,

        /// bzip2 level (1-9)
        #[arg(short = 'z', value_name = "LEVEL", default_value_t = 9)]
        level: u32,
    },
}

fn main() {
    let args = TreediffArgs::parse();
    init_logger(args.verbose, args.quiet);

    if let Err(e) = execute(args.command) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn init_logger(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn level(lv: u32) -> Compression {
    Compression::new(lv.clamp(1, 9))
}

fn execute(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Folder {
            source,
            target,
            output,
            dry_run,
            yes,
            level: lv,
        } => {
            let manifest = PackageBuilder::new()
                .dry_run(dry_run)
                .overwrite(yes)
                .compression_level(level(lv))
                .build(&source, &target, &output)?;
            if dry_run {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                serde_json::to_writer_pretty(&mut out, &manifest)?;
                writeln!(out)?;
            }
            Ok(())
        }
        Command::File {
            source_path,
            target_path,
            patch_path,
            small_match,
            level: lv,
        } => {
            let source = fs::read(&source_path)?;
            let target = fs::read(&target_path)?;

            let mut bsdiff = Bsdiff::new(&source, &target).compression_level(level(lv));
            if let Some(sm) = small_match {
                bsdiff = bsdiff.small_match(sm);
            }

            let mut patch = io::BufWriter::new(fs::File::create(&patch_path)?);
            bsdiff.compare(&mut patch)?;
            patch.flush()?;
            Ok(())
        }
    }
}
