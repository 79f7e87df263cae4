//! batonctl: inspect, reload and stop running baton processes.

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "batonctl")]
#[command(about = "Operator CLI for baton processes", long_about = None)]
struct Cli {
    /// Instrumentation endpoint of the target process
    #[arg(short, long, default_value = "http://127.0.0.1:5556")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show process identity and listeners
    Status,
    /// Check liveness
    Health,
    /// Dump Prometheus metrics
    Metrics,
    /// Hand the listeners to a fresh process (SIGHUP)
    Reload {
        /// Target pid; asked from the status endpoint when omitted
        pid: Option<i32>,
    },
    /// Shut the process down gracefully (SIGTERM)
    Stop {
        /// Target pid; asked from the status endpoint when omitted
        pid: Option<i32>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Status => {
            let res = client.get(format!("{}/debug/status", cli.url)).send().await?;
            print_json(res).await?;
        }
        Commands::Health => {
            let res = client.get(format!("{}/healthz", cli.url)).send().await?;
            print_text(res).await?;
        }
        Commands::Metrics => {
            let res = client.get(format!("{}/metrics", cli.url)).send().await?;
            print_text(res).await?;
        }
        Commands::Reload { pid } => {
            let pid = resolve_pid(&client, &cli.url, pid).await?;
            signal::hangup(pid)?;
            println!("sent SIGHUP to {pid}");
        }
        Commands::Stop { pid } => {
            let pid = resolve_pid(&client, &cli.url, pid).await?;
            signal::terminate(pid)?;
            println!("sent SIGTERM to {pid}");
        }
    }

    Ok(())
}

async fn resolve_pid(
    client: &reqwest::Client,
    url: &str,
    pid: Option<i32>,
) -> Result<i32, Box<dyn std::error::Error>> {
    if let Some(pid) = pid {
        return Ok(pid);
    }
    let status: Value = client
        .get(format!("{url}/debug/status"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    status["pid"]
        .as_i64()
        .and_then(|pid| i32::try_from(pid).ok())
        .ok_or_else(|| "status response has no pid".into())
}

async fn print_json(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: instrumentation endpoint returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn print_text(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if status.is_success() {
        println!("{}", text.trim_end());
    } else {
        eprintln!("Error: instrumentation endpoint returned status {}", status);
        eprintln!("Response: {}", text);
    }
    Ok(())
}

#[cfg(unix)]
mod signal {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    pub fn hangup(pid: i32) -> Result<(), Box<dyn std::error::Error>> {
        kill(Pid::from_raw(pid), Signal::SIGHUP)?;
        Ok(())
    }

    pub fn terminate(pid: i32) -> Result<(), Box<dyn std::error::Error>> {
        kill(Pid::from_raw(pid), Signal::SIGTERM)?;
        Ok(())
    }
}

#[cfg(not(unix))]
mod signal {
    pub fn hangup(_pid: i32) -> Result<(), Box<dyn std::error::Error>> {
        Err("reloading is only supported on unix".into())
    }

    pub fn terminate(_pid: i32) -> Result<(), Box<dyn std::error::Error>> {
        Err("signals are only supported on unix".into())
    }
}
