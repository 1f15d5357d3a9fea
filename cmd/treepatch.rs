#![forbid(unsafe_code)]
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Parser, Subcommand};
use log::info;
use treepatch::{FolderPatcher, PatchFolderResult};

#[derive(Parser, Debug)]
#[command(
    name = "treepatch",
    version,
    about = "apply bsdiff 4.x patch packages to directory trees",
    long_about = None,
)]
struct TreepatchArgs {
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
    /// apply a patch package to a directory tree
    Folder {
        /// tree to update in place
        #[arg(value_name = "TREE")]
        tree: PathBuf,

        /// package directory holding manifest.json
        #[arg(value_name = "PACKAGE")]
        package: PathBuf,

        /// buffer size
        #[arg(short = 'b', value_name = "BUFFER")]
        buffer_size: Option<usize>,
    },

    /// apply a single patch file
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

        /// buffer size
        #[arg(short = 'b', value_name = "BUFFER")]
        buffer_size: Option<usize>,
    },
}

fn main() {
    let args = TreepatchArgs::parse();
    init_logger(args.verbose, args.quiet);

    match execute(args.command) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
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

fn execute(command: Command) -> Result<i32, Box<dyn Error>> {
    match command {
        Command::Folder {
            tree,
            package,
            buffer_size,
        } => {
            let mut patcher = FolderPatcher::new();
            if let Some(bs) = buffer_size {
                patcher = patcher.buffer_size(bs);
            }
            let report = patcher.patch(&tree, &package);
            for err in report.errors.iter() {
                eprintln!("{}", err);
            }
            Ok(match report.result {
                PatchFolderResult::Ok => 0,
                PatchFolderResult::Fail => 1,
                PatchFolderResult::NoManifest => 2,
                PatchFolderResult::InvalidManifest => 3,
                PatchFolderResult::Cancelled => 4,
            })
        }
        Command::File {
            source_path,
            target_path,
            patch_path,
            buffer_size,
        } => {
            patch_file(&source_path, &target_path, &patch_path, buffer_size)?;
            Ok(0)
        }
    }
}

/// Rebuild into a sibling of the target so a failure never leaves a torn
/// target behind, even when the target is the source itself.
fn patch_file(
    source: &Path,
    target: &Path,
    patch: &Path,
    buffer_size: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let mut patcher = FolderPatcher::new();
    if let Some(bs) = buffer_size {
        patcher = patcher.buffer_size(bs);
    }
    let size = patcher.replace_file(source, patch, target)?;
    info!("wrote {} ({} bytes)", target.display(), size);
    Ok(())
}
