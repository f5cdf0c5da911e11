use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use t3_format::savefile::{check_signature, verify_checksum};
use t3_format::{SaveHeader, read_header, restore_get_image};

/// Inspect T3 saved state files without loading the image they belong to.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the name of the image a saved state belongs to
    Image {
        /// Saved state file
        path: PathBuf,
    },
    /// Print the saved state header
    Info {
        /// Saved state file
        path: PathBuf,

        /// Emit the header as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recompute the checksum and report whether the file is intact
    Verify {
        /// Saved state file
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct HeaderReport<'a> {
    path: String,
    data_size: u32,
    crc: String,
    timestamp: String,
    image_name: &'a str,
    metadata: Vec<MetadataEntry<'a>>,
}

#[derive(Serialize)]
struct MetadataEntry<'a> {
    name: &'a str,
    value: &'a str,
}

fn main() -> Result<ExitCode> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Image { path } => {
            let mut file = open(&path)?;
            let name = restore_get_image(&mut file)
                .with_context(|| format!("reading image name from {}", path.display()))?;
            println!("{name}");
        }
        Command::Info { path, json } => {
            let mut file = open(&path)?;
            let header = read_header(&mut file)
                .with_context(|| format!("reading header of {}", path.display()))?;
            if json {
                let report = header_report(&path, &header);
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_header(&path, &header);
            }
        }
        Command::Verify { path } => {
            let mut file = open(&path)?;
            let result = check_signature(&mut file).and_then(|_| verify_checksum(&mut file));
            match result {
                Ok((size, crc)) => {
                    println!("{}: ok ({size} bytes, crc {crc:#010x})", path.display());
                }
                Err(err) => {
                    println!("{}: {} ({err})", path.display(), err.kind_name());
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("opening {}", path.display()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn header_report<'a>(path: &Path, header: &'a SaveHeader) -> HeaderReport<'a> {
    HeaderReport {
        path: path.display().to_string(),
        data_size: header.data_size,
        crc: format!("{:#010x}", header.crc),
        timestamp: hex(&header.timestamp),
        image_name: &header.image_name,
        metadata: header
            .metadata
            .iter()
            .map(|(name, value)| MetadataEntry { name, value })
            .collect(),
    }
}

fn print_header(path: &Path, header: &SaveHeader) {
    println!("file       {}", path.display());
    println!("data size  {}", header.data_size);
    println!("crc        {:#010x}", header.crc);
    println!("timestamp  {}", String::from_utf8_lossy(&header.timestamp));
    println!("image      {}", header.image_name);
    if header.metadata.is_empty() {
        println!("metadata   (none)");
    }
    for (name, value) in &header.metadata {
        println!("  {name:<16} {value}");
    }
}
