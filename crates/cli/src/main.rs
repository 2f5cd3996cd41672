//! cmdexec CLI - Command-line interface for the cmdexec engine

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tabled::{Table, Tabled};

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:9530";
const DEFAULT_CALLER: &str = "operator";

#[derive(Parser)]
#[command(name = "cmdexec")]
#[command(about = "cmdexec Command Execution Engine CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// RPC server URL
    #[arg(long, env = "CMDEXEC_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,

    /// Caller identity sent with every request
    #[arg(long, env = "CMDEXEC_CALLER_ID", default_value = DEFAULT_CALLER)]
    caller: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a command line for execution
    Submit {
        /// Command line, e.g. "ls -la /tmp"
        command: String,

        /// Restrict this submission to commands starting with PREFIX (repeatable)
        #[arg(long = "allow-prefix", value_name = "PREFIX")]
        allow_prefixes: Vec<String>,

        /// Forbid arguments under PATH (repeatable)
        #[arg(long = "forbid-path", value_name = "PATH")]
        forbid_paths: Vec<String>,

        /// Stream output until the execution finishes
        #[arg(short, long)]
        watch: bool,
    },

    /// Show an execution with its captured output
    Status {
        execution_id: String,
    },

    /// Cancel an execution
    Cancel {
        execution_id: String,
    },

    /// List your executions, newest first
    List {
        /// Only executions in this status (e.g. running, completed)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Follow an execution's output until it finishes
    Watch {
        execution_id: String,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,
    },

    /// Show engine health
    Health,
}

#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Deserialize, Tabled)]
#[serde(rename_all = "camelCase")]
struct SubmitResult {
    #[tabled(rename = "execution_id")]
    execution_id: String,
    status: String,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputLine {
    seq: u64,
    stream: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionDetail {
    execution_id: String,
    command: String,
    status: String,
    exit_code: Option<i32>,
    reason: Option<String>,
    #[serde(default)]
    output: Vec<OutputLine>,
    output_bytes: u64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    cancel_requested: bool,
}

#[derive(Deserialize, Tabled)]
#[serde(rename_all = "camelCase")]
struct SummaryRow {
    #[tabled(rename = "execution_id")]
    execution_id: String,
    command: String,
    status: String,
    #[tabled(rename = "exit", display_with = "display_exit_code")]
    exit_code: Option<i32>,
    #[tabled(rename = "created")]
    created_at: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: String,
    version: String,
    in_flight: usize,
    max_concurrent: usize,
    available_slots: usize,
}

fn display_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
}

fn is_terminal(status: &str) -> bool {
    matches!(status, "completed" | "failed" | "cancelled" | "timed_out")
}

fn colored_status(status: &str) -> colored::ColoredString {
    match status {
        "completed" => status.green(),
        "failed" | "timed_out" => status.red(),
        "cancelled" => status.yellow(),
        _ => status.cyan(),
    }
}

/// Process exit code mirroring the execution outcome
fn exit_code_for(detail: &ExecutionDetail) -> i32 {
    match (detail.status.as_str(), detail.exit_code) {
        ("completed", _) => 0,
        ("failed", Some(code)) if code > 0 => code,
        _ => 1,
    }
}

fn submit_params(
    caller: &str,
    command: &str,
    allow_prefixes: Vec<String>,
    forbid_paths: Vec<String>,
) -> Value {
    let mut params = json!({
        "callerId": caller,
        "command": command,
    });
    if !allow_prefixes.is_empty() || !forbid_paths.is_empty() {
        params["permissions"] = json!({
            "allowedPrefixes": allow_prefixes,
            "forbiddenPaths": forbid_paths,
        });
    }
    params
}

async fn call_rpc(url: &str, method: &str, params: Value) -> Result<Value> {
    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        method: method.to_string(),
        params,
        id: 1,
    };

    let client = reqwest::Client::new();
    let response: JsonRpcResponse = client
        .post(url)
        .json(&request)
        .send()
        .await
        .context("Failed to connect to daemon")?
        .json()
        .await
        .context("Failed to parse response")?;

    if let Some(error) = response.error {
        anyhow::bail!("RPC error ({}): {}", error.code, error.message);
    }

    response
        .result
        .ok_or_else(|| anyhow::anyhow!("No result in response"))
}

async fn get_execution(cli: &Cli, execution_id: &str) -> Result<ExecutionDetail> {
    let params = json!({ "callerId": cli.caller, "executionId": execution_id });
    let result = call_rpc(&cli.rpc_url, "commands.get.v1", params).await?;
    serde_json::from_value(result).context("Unexpected commands.get.v1 result")
}

fn print_output(lines: &[OutputLine]) {
    for line in lines {
        if line.stream == "stderr" {
            eprint!("{}", line.data);
        } else {
            print!("{}", line.data);
        }
    }
}

/// Poll until terminal, printing each chunk once
async fn watch(cli: &Cli, execution_id: &str, interval: Duration) -> Result<ExecutionDetail> {
    let mut next_seq = 0u64;
    loop {
        let detail = get_execution(cli, execution_id).await?;
        let fresh: Vec<OutputLine> = detail
            .output
            .iter()
            .filter(|line| line.seq >= next_seq)
            .cloned()
            .collect();
        if let Some(last) = fresh.last() {
            next_seq = last.seq + 1;
        }
        print_output(&fresh);

        if is_terminal(&detail.status) {
            return Ok(detail);
        }
        tokio::time::sleep(interval).await;
    }
}

fn print_finished(detail: &ExecutionDetail) {
    println!();
    let mut line = format!("{} {}", "Finished:".bold(), colored_status(&detail.status));
    if let Some(code) = detail.exit_code {
        line.push_str(&format!(" (exit {})", code));
    }
    if let Some(reason) = &detail.reason {
        line.push_str(&format!(" - {}", reason));
    }
    println!("{}", line);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Submit {
            command,
            allow_prefixes,
            forbid_paths,
            watch: follow,
        } => {
            let params = submit_params(
                &cli.caller,
                command,
                allow_prefixes.clone(),
                forbid_paths.clone(),
            );
            let result = call_rpc(&cli.rpc_url, "commands.submit.v1", params).await?;
            let submitted: SubmitResult = serde_json::from_value(result)?;

            if *follow {
                let id = submitted.execution_id.clone();
                println!("{} {}", "Submitted".green().bold(), id);
                let detail = watch(&cli, &id, Duration::from_millis(500)).await?;
                print_finished(&detail);
                std::process::exit(exit_code_for(&detail));
            }

            println!("{}", "✓ Command submitted".green().bold());
            println!();
            println!("{}", Table::new(vec![submitted]));
        }

        Commands::Status { execution_id } => {
            let detail = get_execution(&cli, execution_id).await?;

            println!("{}", format!("Execution {}", detail.execution_id).cyan().bold());
            println!();
            println!("  {} {}", "Command:".bold(), detail.command);
            println!("  {} {}", "Status:".bold(), colored_status(&detail.status));
            println!("  {} {}", "Exit code:".bold(), display_exit_code(&detail.exit_code));
            if let Some(reason) = &detail.reason {
                println!("  {} {}", "Reason:".bold(), reason);
            }
            println!("  {} {}", "Created:".bold(), detail.created_at);
            if let Some(started) = &detail.started_at {
                println!("  {} {}", "Started:".bold(), started);
            }
            if let Some(completed) = &detail.completed_at {
                println!("  {} {}", "Completed:".bold(), completed);
            }
            if detail.cancel_requested {
                println!("  {} yes", "Cancel requested:".bold());
            }
            println!(
                "  {} {} chunks, {} bytes",
                "Output:".bold(),
                detail.output.len(),
                detail.output_bytes
            );

            if !detail.output.is_empty() {
                println!();
                print_output(&detail.output);
            }
        }

        Commands::Cancel { execution_id } => {
            let params = json!({ "callerId": cli.caller, "executionId": execution_id });
            let result = call_rpc(&cli.rpc_url, "commands.cancel.v1", params).await?;
            let status = result["status"].as_str().unwrap_or("cancelled");

            if status == "cancelled" {
                println!("{}", format!("✓ Execution {} cancelled", execution_id).green().bold());
            } else {
                println!(
                    "{} already finished: {}",
                    execution_id,
                    colored_status(status)
                );
            }
        }

        Commands::List { status, limit } => {
            let mut params = json!({ "callerId": cli.caller, "limit": limit });
            if let Some(status) = status {
                params["status"] = json!(status);
            }
            let result = call_rpc(&cli.rpc_url, "commands.list.v1", params).await?;
            let rows: Vec<SummaryRow> = serde_json::from_value(result)?;

            if rows.is_empty() {
                println!("{}", "No executions".yellow());
            } else {
                println!("{}", Table::new(rows));
            }
        }

        Commands::Watch {
            execution_id,
            interval_ms,
        } => {
            let detail = watch(&cli, execution_id, Duration::from_millis(*interval_ms)).await?;
            print_finished(&detail);
            std::process::exit(exit_code_for(&detail));
        }

        Commands::Health => {
            println!("{}", "Engine Health".cyan().bold());
            println!();

            match call_rpc(&cli.rpc_url, "system.health.v1", json!({})).await {
                Ok(result) => {
                    let health: Health = serde_json::from_value(result)?;
                    let status = if health.status == "ok" {
                        health.status.green()
                    } else {
                        health.status.yellow()
                    };
                    println!("  {} {}", "RPC URL:".bold(), cli.rpc_url);
                    println!("  {} {}", "Status:".bold(), status);
                    println!("  {} {}", "Version:".bold(), health.version);
                    println!(
                        "  {} {}/{}",
                        "In flight:".bold(),
                        health.in_flight,
                        health.max_concurrent
                    );
                    println!("  {} {}", "Free slots:".bold(), health.available_slots);
                }
                Err(e) => {
                    println!("  {} {}", "Status:".bold(), "UNREACHABLE".red());
                    println!("  {} {}", "Error:".bold(), e);
                }
            }
        }
    }

    Ok(())
}
