//! CLI presentation: text tables and json for each command.

use super::parse::OutputFormat;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::identity::IdentityMapSnapshot;
use crate::persistence::PersistedState;
use comfy_table::{presets, Table};
use serde_json::json;

fn to_json(value: &serde_json::Value) -> Result<String, SyncError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| SyncError::ConfigError(format!("Failed to render json: {e}")))
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL);
    table.set_header(header);
    table
}

/// Saved state, or a hint when nothing is saved.
pub fn format_state(
    state: Option<&PersistedState>,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let Some(state) = state else {
        return match format {
            OutputFormat::Json => to_json(&serde_json::Value::Null),
            OutputFormat::Text => Ok("No saved session state.".to_string()),
        };
    };
    let restorable = state.is_restorable();

    if format == OutputFormat::Json {
        return to_json(&json!({
            "client_url": state.client_url,
            "repository_id": state.repository_id,
            "branch_name": state.branch_name,
            "local_version_hash": state.local_version_hash,
            "module_ids": state.module_ids,
            "identity_map_bytes": state.serialized_identity_map.len(),
            "restorable": restorable,
        }));
    }

    let mut table = table(vec!["Field", "Value"]);
    table.add_row(vec!["Server", state.client_url.as_str()]);
    table.add_row(vec!["Repository", state.repository_id.as_str()]);
    table.add_row(vec!["Branch", state.branch_name.as_str()]);
    table.add_row(vec!["Version", state.local_version_hash.as_str()]);
    let modules = if state.module_ids.is_empty() {
        "-".to_string()
    } else {
        state.module_ids.join("\n")
    };
    table.add_row(vec!["Modules".to_string(), modules]);
    table.add_row(vec![
        "Restorable".to_string(),
        if restorable { "yes" } else { "no" }.to_string(),
    ]);
    Ok(table.to_string())
}

/// One row per identity map entry: kind, local entity, owner, remote id.
pub fn format_map(
    snapshot: &IdentityMapSnapshot,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let mut rows: Vec<[String; 4]> = Vec::with_capacity(snapshot.len());
    for (module, remote) in &snapshot.modules {
        rows.push(["module".into(), module.to_string(), "-".into(), remote.to_string()]);
    }
    for (model, module, remote) in &snapshot.models {
        rows.push(["model".into(), model.to_string(), module.to_string(), remote.to_string()]);
    }
    for (node, model, remote) in &snapshot.nodes {
        rows.push(["node".into(), node.to_string(), model.to_string(), remote.to_string()]);
    }
    for (module, target, remote) in &snapshot.module_dependencies {
        rows.push([
            "module dependency".into(),
            target.to_string(),
            module.to_string(),
            remote.to_string(),
        ]);
    }
    for (model, target, remote) in &snapshot.model_imports {
        rows.push([
            "model import".into(),
            target.to_string(),
            model.to_string(),
            remote.to_string(),
        ]);
    }
    for (model, language, remote) in &snapshot.language_dependencies {
        rows.push([
            "language dependency".into(),
            language.to_string(),
            model.to_string(),
            remote.to_string(),
        ]);
    }

    if format == OutputFormat::Json {
        let entries: Vec<serde_json::Value> = rows
            .iter()
            .map(|[kind, local, owner, remote]| {
                json!({ "kind": kind, "local": local, "owner": owner, "remote": remote })
            })
            .collect();
        return to_json(&serde_json::Value::Array(entries));
    }

    if rows.is_empty() {
        return Ok("Identity map is empty.".to_string());
    }
    let mut table = table(vec!["Kind", "Local", "Owner", "Remote"]);
    for row in rows {
        table.add_row(row.to_vec());
    }
    Ok(format!("{table}\n{} entries", snapshot.len()))
}

pub fn format_config(config: &SyncConfig) -> Result<String, SyncError> {
    config.to_toml()
}
