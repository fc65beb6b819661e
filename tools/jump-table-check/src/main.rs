//! # `jump-table-check`
//!
//! Validates the `__jump_table` section of a linked kernel image:
//!
//! ```text
//! jump-table-check <image> [--verbose]
//! ```
//!
//! Every record must point at a site inside executable text, a label inside
//! executable text and a key inside writable data; every site must hold its
//! no-op or its jump. Any violation fails the build.

mod check;
mod elf;
mod logger;

use check::{CheckError, check_image};
use log::{LevelFilter, error, info};
use logger::StderrLogger;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{env, fs};

fn main() -> ExitCode {
    // args: <image> [--verbose]
    let mut image = None;
    let mut level = LevelFilter::Info;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => level = LevelFilter::Trace,
            _ if image.is_none() => image = Some(PathBuf::from(arg)),
            _ => return usage(),
        }
    }
    let Some(image) = image else {
        return usage();
    };

    if StderrLogger::new(level).init().is_err() {
        eprintln!("logger already installed");
    }

    match run(&image) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}: {err}", image.display());
            ExitCode::FAILURE
        }
    }
}

fn run(path: &Path) -> Result<(), CheckError> {
    let bytes = fs::read(path).map_err(|source| CheckError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let report = check_image(&bytes)?;
    info!(
        "{}: {} site(s) for {} key(s), {} taken ({})",
        path.display(),
        report.sites,
        report.keys,
        report.taken,
        report.arch
    );
    Ok(())
}

fn usage() -> ExitCode {
    eprintln!("usage: jump-table-check <image> [--verbose]");
    ExitCode::from(2)
}
