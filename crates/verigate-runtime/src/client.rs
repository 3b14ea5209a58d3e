//! UDS JSON-RPC client for CLI subcommands.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::cli::ExperimentCommand;
use crate::rpc::JsonRpcResponse;

pub(crate) async fn rpc_call(
    socket_path: &str,
    method: &str,
    params: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to daemon at {socket_path}: {e}"))?;

    let (reader, mut writer) = stream.into_split();

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut req = serde_json::to_string(&request)?;
    req.push('\n');
    writer.write_all(req.as_bytes()).await?;
    writer.shutdown().await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let response: JsonRpcResponse = match serde_json::from_str(line.trim()) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if response.id != Some(1) {
            continue;
        }
        if let Some(error) = response.error {
            anyhow::bail!("RPC error {}: {}", error.code, error.message);
        }
        return Ok(response.result.unwrap_or(serde_json::Value::Null));
    }
    anyhow::bail!("daemon closed the connection without answering {method}")
}

/// `verigate status`: bound verifiers, live sessions, queued experiments.
pub async fn cmd_status(socket_path: &str, json: bool) -> anyhow::Result<()> {
    let snapshot = rpc_call(socket_path, "status", serde_json::json!({})).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    let now_ms = Utc::now().timestamp_millis().max(0) as u64;
    print!("{}", format_status(&snapshot, now_ms));
    Ok(())
}

fn render_time(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// Pure formatting logic for status output, separated for testability.
pub(crate) fn format_status(snapshot: &serde_json::Value, now_ms: u64) -> String {
    let mut out = String::new();

    match snapshot["verifier"].as_object() {
        Some(v) => out.push_str(&format!(
            "verifier: {}/{}\n",
            v.get("package_name").and_then(|p| p.as_str()).unwrap_or("?"),
            v.get("service_name").and_then(|s| s.as_str()).unwrap_or("?"),
        )),
        None => out.push_str("verifier: none configured\n"),
    }

    let handles = snapshot["handles"].as_array().map(Vec::as_slice).unwrap_or_default();
    if handles.is_empty() {
        out.push_str("handles: none\n");
    } else {
        out.push_str("handles:\n");
        for h in handles {
            let state = if h["connected"].as_bool() == Some(true) {
                "connected"
            } else {
                "connecting"
            };
            let idle = if h["idle_disconnect_armed"].as_bool() == Some(true) {
                "  idle-disconnect armed"
            } else {
                ""
            };
            out.push_str(&format!(
                "  user {}  uid {}  {state}{idle}\n",
                h["user_id"], h["uid"]
            ));
        }
    }

    let sessions = snapshot["sessions"].as_array().map(Vec::as_slice).unwrap_or_default();
    if sessions.is_empty() {
        out.push_str("sessions: none\n");
    } else {
        out.push_str("sessions:\n");
        for s in sessions {
            let deadline = s["deadline_ms"].as_u64().unwrap_or(0);
            let remaining = deadline.saturating_sub(now_ms) / 1000;
            out.push_str(&format!(
                "  #{} {} (user {})  deadline {} (in {remaining}s)\n",
                s["verification_id"],
                s["package_name"].as_str().unwrap_or("?"),
                s["user_id"],
                render_time(deadline),
            ));
        }
    }

    let experiments: Vec<&str> = snapshot["experiments"]
        .as_array()
        .map(|a| a.iter().filter_map(|e| e.as_str()).collect())
        .unwrap_or_default();
    if experiments.is_empty() {
        out.push_str("experiments: none\n");
    } else {
        out.push_str(&format!("experiments: {}\n", experiments.join(", ")));
    }
    out
}

/// `verigate experiment ...`
pub async fn cmd_experiment(socket_path: &str, command: ExperimentCommand) -> anyhow::Result<()> {
    match command {
        ExperimentCommand::Add {
            package,
            policy,
            outcomes,
        } => {
            let params = serde_json::json!({
                "package_name": package,
                "policy": policy,
                "outcomes": outcomes,
            });
            let result = rpc_call(socket_path, "add_experiment", params).await?;
            if result["added"].as_bool() == Some(true) {
                println!("queued {} outcome(s) for {package}", result["outcomes"]);
            } else {
                println!("no valid outcomes; experiment for {package} cleared");
            }
        }
        ExperimentCommand::Has { package } => {
            let params = serde_json::json!({ "package_name": package });
            let result = rpc_call(socket_path, "has_experiments", params).await?;
            let has = result["has_experiments"].as_bool() == Some(true);
            println!("{}", if has { "yes" } else { "no" });
        }
        ExperimentCommand::Run {
            package,
            reject_policy,
        } => {
            let params = serde_json::json!({
                "package_name": package,
                "accept_policy_overrides": !reject_policy,
            });
            let result = rpc_call(socket_path, "start_local_experiment", params).await?;
            if result["ran"].as_bool() != Some(true) {
                println!("no experiment queued for {package}");
                return Ok(());
            }
            for event in result["events"].as_array().map(Vec::as_slice).unwrap_or_default() {
                println!("{event}");
            }
        }
    }
    Ok(())
}
