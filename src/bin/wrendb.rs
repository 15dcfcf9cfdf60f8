//! # WrenDB CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve a database file over TCP
//! wrendb serve --file ./wren.db --port 6677
//!
//! # Bind a specific address
//! wrendb serve --file ./wren.db --addr 0.0.0.0 --port 6677
//!
//! # Print the build version
//! wrendb version
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{bail, Result, WrapErr};
use tracing_subscriber::EnvFilter;

use wrendb::net::Server;
use wrendb::{Engine, Options};

const DEFAULT_PORT: u16 = 6677;

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,wrendb=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let Some(subcommand) = args.get(1) else {
        print_usage();
        return Ok(());
    };

    match subcommand.as_str() {
        "serve" => serve(&args[2..]),
        "version" => {
            println!("wrendb {}", wrendb::VERSION);
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        other => bail!("unknown subcommand '{}'; try 'wrendb --help'", other),
    }
}

fn serve(args: &[String]) -> Result<()> {
    let mut file: Option<PathBuf> = None;
    let mut addr = "127.0.0.1".to_string();
    let mut port = DEFAULT_PORT;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                file = Some(PathBuf::from(take_value(args, &mut i, "--file")?));
            }
            "--addr" | "-a" => {
                addr = take_value(args, &mut i, "--addr")?.to_string();
            }
            "--port" | "-p" => {
                let raw = take_value(args, &mut i, "--port")?;
                port = raw
                    .parse()
                    .wrap_err_with(|| format!("invalid port '{}'", raw))?;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => bail!("unknown option '{}' for serve", other),
        }
        i += 1;
    }

    let Some(file) = file else {
        bail!("serve requires --file <path>");
    };

    let engine = Engine::open(&file, Options::default())
        .wrap_err_with(|| format!("failed to open database at {:?}", file))?;

    let server = Server::bind(Arc::new(engine), &format!("{}:{}", addr, port))?;
    server.run()
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    match args.get(*i) {
        Some(value) => Ok(value),
        None => bail!("{} requires a value", flag),
    }
}

fn print_usage() {
    println!("WrenDB - single-file ordered key-value store");
    println!();
    println!("USAGE:");
    println!("    wrendb <SUBCOMMAND> [OPTIONS]");
    println!();
    println!("SUBCOMMANDS:");
    println!("    serve      Serve a database file over TCP");
    println!("    version    Print version information");
    println!();
    println!("SERVE OPTIONS:");
    println!("    -f, --file <PATH>    Database file (created if absent)");
    println!("    -a, --addr <ADDR>    Listen address [default: 127.0.0.1]");
    println!("    -p, --port <PORT>    Listen port [default: 6677]");
    println!();
    println!("EXAMPLES:");
    println!("    wrendb serve --file ./wren.db --port 6677");
    println!("    wrendb version");
}
