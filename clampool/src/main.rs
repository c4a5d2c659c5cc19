// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A small CLI for smoke testing the clampool engine against a live
//! ClamAV daemon: scan a few files, or ask the daemon for its version.
//! Exit codes follow clamdscan: 0 clean, 1 something was found, 2 an
//! error got in the way.

use std::{fs, io, path::PathBuf, process, sync::Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_derive::Serialize;
use tracing::error;

use libclampool::{read_config, Config, Engine, Verdict};

#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
    #[clap(short, long, action, help = "the file to write logs to, stderr if unset")]
    log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count,
           help = "show more in logs, may be provided multiple times")]
    verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    config_file: Option<String>,

    #[clap(short, long, action, help = "address of the ClamAV server, overrides the config file")]
    address: Option<String>,

    #[clap(short, long, action, help = "port of the ClamAV server, overrides the config file")]
    port: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[clap(about = "Scans the given files and prints a verdict for each")]
    Scan {
        #[clap(long, help = "print the verdicts as json")]
        json: bool,

        #[clap(required = true, help = "the files to scan")]
        files: Vec<PathBuf>,
    },

    #[clap(about = "Prints the version reported by the ClamAV server")]
    Version,
}

#[derive(Serialize, Debug)]
struct Report {
    file: String,
    verdict: Verdict,
    message: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    }

    match run(args) {
        Ok(status) => process::exit(status),
        Err(err) => {
            error!("{:?}", err);
            process::exit(2);
        }
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let mut config = match &args.config_file {
        Some(path) => read_config(path)?,
        None => Config::default(),
    };
    if let Some(address) = args.address {
        config.address = Some(address);
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }

    let engine = Engine::new(config);
    engine.init().context("initializing the scanning engine")?;
    let session = engine.thread_init().context("opening a scanning session")?;

    let status = match args.command {
        Commands::Scan { json, files } => {
            let mut status = 0;
            let mut reports = vec![];
            for file in files {
                let (verdict, message) = engine.test_file(Some(&session), &file);
                if verdict == Verdict::VirusFound {
                    status = 1;
                }
                reports.push(Report {
                    file: file.display().to_string(),
                    verdict,
                    message,
                });
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    println!("{}: {} ({})", report.file, report.verdict, report.message);
                }
            }
            status
        }
        Commands::Version => {
            let version = session.get_version().context("asking for the daemon version")?;
            println!("{version}");
            0
        }
    };

    if let Err(err) = engine.thread_close(&session) {
        error!("closing scanning session: {:?}", err);
    }
    engine.close().context("closing the scanning engine")?;

    Ok(status)
}
