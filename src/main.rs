// Copyright 2022 Ryan Seipp
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

//! pelt binary: parse arguments, run the load, print the report.

use std::net::SocketAddr;
use std::process::exit;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;

use pelt::config::{Args, Config};
use pelt::coordinator::{self, RunError, Shared};
use pelt::report;

fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp => 0,
                _ => 1,
            };
            let _ = err.print();
            exit(code);
        }
    };

    if args.version {
        println!("pelt {}", env!("CARGO_PKG_VERSION"));
        exit(0);
    }

    let (cfg, addr, shared) = match setup(args) {
        Ok(run) => run,
        Err(err) => {
            eprintln!("pelt: {:#}", err);
            exit(1);
        }
    };

    match coordinator::run(cfg.clone(), addr, shared) {
        Ok(summary) => report::print(&cfg, &summary),
        Err(err @ RunError::Spawn(_)) => {
            eprintln!("pelt: {:#}", err);
            exit(2);
        }
        Err(err) => {
            eprintln!("pelt: {:#}", err);
            exit(1);
        }
    }
}

/// Everything that must succeed before threads spawn.
fn setup(args: Args) -> anyhow::Result<(Arc<Config>, SocketAddr, Arc<Shared>)> {
    let cfg = Config::from_args(args).context("invalid arguments")?;
    let addr = coordinator::resolve(&cfg).context("target resolution failed")?;

    let shared = Shared::new(cfg.threads);
    let stop = shared.clone();
    ctrlc::set_handler(move || stop.stop.store(true, Ordering::Relaxed))
        .context("unable to install the interrupt handler")?;

    Ok((Arc::new(cfg), addr, shared))
}
