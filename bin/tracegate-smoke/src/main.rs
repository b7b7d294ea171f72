use std::{process::ExitCode, time::Duration};

use clap::{Parser, ValueEnum, error::ErrorKind};
use eyre::Result;
use serde_json::{Value, json};
use tracing::{error, info};

const EXIT_USAGE: u8 = 1;
const EXIT_EXPECTED_ERROR: u8 = 2;
const EXIT_UNEXPECTED_ERROR: u8 = 3;
const EXIT_BAD_SHAPE: u8 = 4;
const EXIT_WRONG_LENGTH: u8 = 5;
const EXIT_REQUEST_FAILED: u8 = 6;

/// Expected outcome of the trace request
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Expect {
    /// A JSON-RPC error object
    Error,
    /// An empty trace list
    Empty,
    /// A trace list with at least one entry
    Nonempty,
}

/// Send one trace request to a running endpoint and check the response shape.
#[derive(Debug, Parser)]
#[command(name = "tracegate-smoke", version)]
struct Args {
    /// Block number (0x-hex) or transaction hash
    target: String,

    /// Expected outcome
    expect: Expect,

    /// JSON-RPC endpoint
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    url: String,

    /// Trace method to call
    #[arg(long, value_parser = ["trace_block", "trace_transaction"], default_value = "trace_block")]
    method: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

/// A response that does not match the expectation
#[derive(Debug, PartialEq, Eq)]
struct Mismatch {
    exit_code: u8,
    message: String,
}

impl Mismatch {
    fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }
}

fn is_hex(digits: &str) -> bool {
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit())
}

fn valid_target(method: &str, target: &str) -> bool {
    match target.strip_prefix("0x") {
        Some(digits) if method == "trace_transaction" => digits.len() == 64 && is_hex(digits),
        Some(digits) => is_hex(digits),
        None => false,
    }
}

/// Compare a JSON-RPC response against the expectation
fn check(expect: Expect, response: &Value) -> Result<String, Mismatch> {
    let error = response.get("error");
    if expect == Expect::Error {
        return match error {
            Some(error) => Ok(format!("error response: {}", error["message"])),
            None => Err(Mismatch::new(
                EXIT_EXPECTED_ERROR,
                format!("expected error, got {}", response["result"]),
            )),
        };
    }
    if let Some(error) = error {
        return Err(Mismatch::new(
            EXIT_UNEXPECTED_ERROR,
            format!("unexpected error {error}"),
        ));
    }

    let traces = response
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Mismatch::new(
                EXIT_BAD_SHAPE,
                format!("unexpected result shape {}", response["result"]),
            )
        })?;

    match (expect, traces.len()) {
        (Expect::Empty, 0) => Ok("empty trace list".to_string()),
        (Expect::Nonempty, n) if n > 0 => Ok(format!("{n} traces")),
        (_, n) => Err(Mismatch::new(
            EXIT_WRONG_LENGTH,
            format!("unexpected trace list length {n}"),
        )),
    }
}

async fn rpc_call(client: &reqwest::Client, url: &str, method: &str, target: &str) -> Result<Value> {
    let req = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": [target]
    });
    let resp = client.post(url).json(&req).send().await?;
    let v: Value = resp.json().await?;
    Ok(v)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(false)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_USAGE),
            };
        }
    };

    if !valid_target(&args.method, &args.target) {
        error!(
            method = %args.method,
            target = %args.target,
            "Target must be a 0x-hex block number or a 0x-prefixed 32-byte transaction hash"
        );
        return ExitCode::from(EXIT_USAGE);
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!(%err, "Failed to build HTTP client");
            return ExitCode::from(EXIT_REQUEST_FAILED);
        }
    };

    let response = match rpc_call(&client, &args.url, &args.method, &args.target).await {
        Ok(response) => response,
        Err(err) => {
            error!(url = %args.url, %err, "Request failed");
            return ExitCode::from(EXIT_REQUEST_FAILED);
        }
    };

    match check(args.expect, &response) {
        Ok(summary) => {
            info!(method = %args.method, target = %args.target, "OK: {summary}");
            ExitCode::SUCCESS
        }
        Err(mismatch) => {
            error!(method = %args.method, target = %args.target, "{}", mismatch.message);
            ExitCode::from(mismatch.exit_code)
        }
    }
}
