//! linkcache-cli: drive channel-linking sessions through the linkcache HTTP API
//!
//! # Subcommands
//! - `status <agent>`  poll session status
//! - `detail <agent>`  poll session detail (QR artifact)
//! - `reconnect <agent>`  request a fresh handshake
//! - `create <agent> --api-key <key>`  create a remote session
//! - `watch <agent> [--interval] [--timeout]`  poll until the session settles
//! - `health`  show server health

use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8780";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "linkcache-cli",
    version,
    about = "Poll and drive channel-linking sessions through linkcache"
)]
struct Cli {
    /// linkcache HTTP server URL (overrides LINKCACHE_HTTP_URL env var)
    #[arg(long, env = "LINKCACHE_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the session status for an agent
    Status {
        agent_id: String,

        /// Print the full status document as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll the session detail, QR artifact included
    Detail {
        agent_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Request a fresh linking handshake
    Reconnect { agent_id: String },

    /// Create a remote session for an agent
    Create {
        agent_id: String,

        /// Agent API key forwarded to the session service
        #[arg(long, env = "LINKCACHE_AGENT_API_KEY")]
        api_key: String,

        /// Display name (defaults to the agent id)
        #[arg(long)]
        name: Option<String>,
    },

    /// Poll until the session is active or the timeout elapses
    Watch {
        agent_id: String,

        /// Seconds between polls
        #[arg(long, default_value_t = 3)]
        interval: u64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },

    /// Show linkcache server health
    Health,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusBlock {
    #[serde(default)]
    pub state: String,
    pub updated_at: Option<String>,
}

/// The fields of a status document the CLI prints.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusDocument {
    #[serde(default)]
    pub success: bool,
    pub agent_id: Option<String>,
    #[serde(default)]
    pub status: StatusBlock,
    #[serde(default)]
    pub is_active: bool,
    pub qr_base64: Option<String>,
    pub qr_url: Option<String>,
    pub qr_expires_at: Option<String>,
    pub trace_id: Option<String>,
    pub message: Option<String>,
}

// ============================================================================
// Formatting helpers
// ============================================================================

/// True once the session is linked.
pub fn is_settled(doc: &StatusDocument) -> bool {
    doc.is_active || doc.status.state == "active"
}

/// Short description of the QR artifact, if any.
pub fn describe_artifact(doc: &StatusDocument) -> String {
    match (&doc.qr_base64, &doc.qr_url) {
        (Some(b64), _) => format!("image ({} base64 chars)", b64.len()),
        (None, Some(url)) => format!("link {}", url),
        (None, None) => "none".to_string(),
    }
}

pub fn format_summary(doc: &StatusDocument) -> String {
    let mut lines = vec![
        format!("Agent:    {}", doc.agent_id.as_deref().unwrap_or("?")),
        format!("State:    {}", doc.status.state),
        format!("Active:   {}", if doc.is_active { "yes" } else { "no" }),
        format!("QR:       {}", describe_artifact(doc)),
    ];
    if let Some(expires) = &doc.qr_expires_at {
        lines.push(format!("Expires:  {}", expires));
    }
    if let Some(updated) = &doc.status.updated_at {
        lines.push(format!("Updated:  {}", updated));
    }
    if let Some(trace) = &doc.trace_id {
        lines.push(format!("Trace:    {}", trace));
    }
    if let Some(message) = &doc.message {
        lines.push(format!("Message:  {}", message));
    }
    lines.join("\n")
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?)
}

/// Send a request and return the decoded document; exits on transport or HTTP errors.
fn fetch(request: reqwest::blocking::RequestBuilder, url: &str) -> serde_json::Value {
    let resp = match request.send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("linkcache-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    let status = resp.status();
    let body: serde_json::Value = resp.json().unwrap_or_default();
    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("no details");
        eprintln!("linkcache-cli: server returned {}: {}", status, message);
        std::process::exit(1);
    }
    body
}

fn print_document(body: serde_json::Value, json_output: bool) -> anyhow::Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let doc: StatusDocument = serde_json::from_value(body)?;
        println!("{}", format_summary(&doc));
    }
    Ok(())
}

fn do_status(server: &str, agent_id: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/sessions/status", server);
    let body = fetch(client()?.get(&url).query(&[("agentId", agent_id)]), &url);
    print_document(body, json_output)
}

/// `{server}/sessions/{agent_id}` with the agent id as one encoded segment.
fn detail_url(server: &str, agent_id: &str) -> anyhow::Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(server)?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("server URL cannot take a path: {}", server))?
        .pop_if_empty()
        .push("sessions")
        .push(agent_id);
    Ok(url)
}

fn do_detail(server: &str, agent_id: &str, json_output: bool) -> anyhow::Result<()> {
    let url = detail_url(server, agent_id)?;
    let body = fetch(client()?.get(url.clone()), url.as_str());
    print_document(body, json_output)
}

fn do_reconnect(server: &str, agent_id: &str) -> anyhow::Result<()> {
    let url = format!("{}/sessions/reconnect", server);
    let body = fetch(
        client()?
            .post(&url)
            .json(&serde_json::json!({ "agentId": agent_id })),
        &url,
    );
    print_document(body, false)
}

fn do_create(
    server: &str,
    agent_id: &str,
    api_key: &str,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let url = format!("{}/sessions", server);
    let body = fetch(
        client()?.post(&url).json(&serde_json::json!({
            "agentId": agent_id,
            "agentName": name.unwrap_or(agent_id),
            "apiKey": api_key,
        })),
        &url,
    );
    print_document(body, false)
}

fn do_watch(server: &str, agent_id: &str, interval: u64, timeout: u64) -> anyhow::Result<()> {
    let client = client()?;
    let url = format!("{}/sessions/status", server);
    let deadline = Instant::now() + Duration::from_secs(timeout);
    let mut last_state = String::new();

    loop {
        let body = fetch(client.get(&url).query(&[("agentId", agent_id)]), &url);
        let doc: StatusDocument = serde_json::from_value(body)?;

        if doc.status.state != last_state {
            println!("{} → {} (QR: {})", agent_id, doc.status.state, describe_artifact(&doc));
            last_state = doc.status.state.clone();
        }
        if is_settled(&doc) {
            println!("✅ {} linked", agent_id);
            return Ok(());
        }
        if Instant::now() >= deadline {
            eprintln!("linkcache-cli: {} not linked after {}s", agent_id, timeout);
            std::process::exit(2);
        }
        std::thread::sleep(Duration::from_secs(interval.max(1)));
    }
}

/// Show the server status by calling GET /health.
fn do_health(server: &str) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let url = format!("{}/health", server);
    match client.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("linkcache server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
            println!("Stored sessions:  {}", body["stored"].as_u64().unwrap_or(0));
            println!("Backend:          {}", body["backend"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            eprintln!("linkcache-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("linkcache-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Status { agent_id, json } => do_status(&server, &agent_id, json),
        Commands::Detail { agent_id, json } => do_detail(&server, &agent_id, json),
        Commands::Reconnect { agent_id } => do_reconnect(&server, &agent_id),
        Commands::Create {
            agent_id,
            api_key,
            name,
        } => do_create(&server, &agent_id, &api_key, name.as_deref()),
        Commands::Watch {
            agent_id,
            interval,
            timeout,
        } => do_watch(&server, &agent_id, interval, timeout),
        Commands::Health => do_health(&server),
    };

    if let Err(e) = result {
        eprintln!("linkcache-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
