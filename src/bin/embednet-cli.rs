use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::io::Write;

use embednet::gateway::auth::{LOCALAPI_HEADER, LOCALAPI_HEADER_VALUE};

#[derive(Parser)]
#[command(name = "embednet-cli")]
#[command(about = "Talk to a node's control API through its loopback gateway", long_about = None)]
struct Cli {
    /// Loopback gateway address printed by the node.
    #[arg(short, long, default_value = "http://127.0.0.1:1055")]
    url: String,

    /// Control credential printed by the node.
    #[arg(short, long, env = "EMBEDNET_CONTROL_CREDENTIAL")]
    credential: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend state and overlay addresses
    Status,
    /// Show the preferences the node started with
    Prefs,
    /// List open overlay listeners
    Listeners,
    /// Follow backend notifications
    Watch,
    /// Start an interactive login
    Login,
    /// Log the node out of the network
    Logout,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(LOCALAPI_HEADER, HeaderValue::from_static(LOCALAPI_HEADER_VALUE));
    let base = format!("{}/localapi/v0", cli.url.trim_end_matches('/'));

    let request = match cli.command {
        Commands::Status => client.get(format!("{base}/status")),
        Commands::Prefs => client.get(format!("{base}/prefs")),
        Commands::Listeners => client.get(format!("{base}/listeners")),
        Commands::Watch => client.get(format!("{base}/watch-ipn-bus")),
        Commands::Login => client.post(format!("{base}/login-interactive")),
        Commands::Logout => client.post(format!("{base}/logout")),
    };
    let res = request
        .headers(headers)
        .basic_auth("embednet", Some(&cli.credential))
        .send()
        .await?;

    if matches!(cli.command, Commands::Watch) {
        follow(res).await
    } else {
        print_response(res).await
    }
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: control API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text.trim());
        }
        return Ok(());
    }
    if status == reqwest::StatusCode::NO_CONTENT {
        println!("ok");
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn follow(mut res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    if !res.status().is_success() {
        return print_response(res).await;
    }
    let mut stdout = std::io::stdout();
    while let Some(chunk) = res.chunk().await? {
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }
    Ok(())
}
