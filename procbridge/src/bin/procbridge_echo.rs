//! Reference worker: answers requests according to their `op` query field.
//!
//! Operations:
//! - `ping`: responds with `pong`
//! - `echo`: responds with the request's data
//! - `sleep`: waits `ms` milliseconds, then responds with `slept`
//! - `fail`: responds with an error carrying `message`
//! - `stderr`: writes `message` to stderr, then responds with `ok`
//! - `exit`: exits immediately with `code`, without responding

use std::io::Write;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use procbridge::{Envelope, EnvelopeBuilder, RequestHandler, WorkerConfig};
use serde_json::json;

struct EchoHandler;

#[async_trait::async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: Envelope, response: &mut EnvelopeBuilder) {
        let op = request
            .query_field("op")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let message = request
            .query_field("message")
            .and_then(|v| v.as_str())
            .unwrap_or("requested failure");

        match op {
            "ping" => {
                response.set_payload("pong");
            }
            "echo" => {
                if let Some(data) = request.data() {
                    response.set_payload(data);
                }
            }
            "sleep" => {
                let ms = request
                    .query_field("ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                response.set_payload("slept");
            }
            "fail" => {
                response.set_error(json!({ "message": message }));
            }
            "stderr" => {
                let mut stderr = std::io::stderr().lock();
                let _ = writeln!(stderr, "{message}");
                let _ = stderr.flush();
                response.set_payload("ok");
            }
            "exit" => {
                let code = request
                    .query_field("code")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                tracing::info!(code, "Exiting on request");
                process::exit(code as i32);
            }
            other => {
                tracing::warn!(op = other, "Unknown operation");
                response.set_error(json!({ "message": format!("unknown op '{other}'") }));
            }
        }
    }
}

struct Args {
    handshake: bool,
    max_in_flight: usize,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: procbridge-echo [--no-handshake] [--max-in-flight <n>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --no-handshake        Print a greeting instead of the alive token");
            eprintln!("  --max-in-flight <n>   Requests handled concurrently [default: 64]");
            process::exit(2);
        }
    };

    procbridge::logging::init_tracing("warn");

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        handshake: true,
        max_in_flight: WorkerConfig::default().max_in_flight,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--no-handshake" => parsed.handshake = false,
            "--max-in-flight" => {
                i += 1;
                let value = args.get(i).ok_or("--max-in-flight requires a value")?;
                parsed.max_in_flight = value
                    .parse()
                    .map_err(|_| format!("invalid --max-in-flight value '{value}'"))?;
            }
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(parsed)
}

fn run(args: Args) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let result = runtime.block_on(serve(args));
    // A blocking stdin read can't be cancelled; don't wait for it.
    runtime.shutdown_background();
    result
}

async fn serve(args: Args) -> anyhow::Result<()> {
    if !args.handshake {
        // Misbehaving worker: wrong greeting, then idle until signalled.
        println!("hello");
        std::io::stdout().flush()?;
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let config = WorkerConfig {
        max_in_flight: args.max_in_flight,
    };
    procbridge::run_worker(Arc::new(EchoHandler), config)
        .await
        .context("worker failed")
}
