use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

use crate::node::STOP_TOOL;
use crate::tool::{ParamKind, ToolError, ToolRegistry, ToolSpec};
use crate::tools::command::{CmdError, run_cmd};
use crate::tools::file;
use crate::tools::store::{JsonStore, STOPS_FILE};

const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 120;

/// Register the stock tool set: shell execution, file read/write,
/// directory listing and the stop/escalation tool. Hosts that want a
/// different surface register their own tools instead.
pub fn register_defaults(registry: &mut ToolRegistry) -> Result<(), ToolError> {
    registry.register(
        ToolSpec::new(
            "execute_shell_command",
            "Execute a shell command in the working directory and return its output.",
        )
        .param("command", ParamKind::String)
        .describe("Shell command line, run via sh -c")
        .optional("timeout_seconds", ParamKind::Integer, json!(DEFAULT_SHELL_TIMEOUT_SECS))
        .describe("Kill the command after this many seconds"),
        |ctx, args| {
            let command = require_str(&args, "command")?;
            let timeout = args["timeout_seconds"]
                .as_u64()
                .unwrap_or(DEFAULT_SHELL_TIMEOUT_SECS);

            match run_cmd(command, &ctx.cwd, Duration::from_secs(timeout)) {
                Ok(output) => Ok(json!({
                    "status": "success",
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                    "return_code": output.exit_code,
                    "cwd": ctx.cwd.display().to_string(),
                })),
                // A timeout is a normal outcome the model should see and
                // react to, not a failed call.
                Err(err @ CmdError::TimedOut(_)) => Ok(json!({
                    "status": "error",
                    "message": err.to_string(),
                })),
                Err(CmdError::Io(e)) => Err(ToolError::from(e)),
            }
        },
    )?;

    registry.register(
        ToolSpec::new(
            "read_file_content",
            "Read a file and return its contents. Relative paths resolve against the working directory.",
        )
        .param("file_path", ParamKind::String),
        |ctx, args| {
            let path = file::resolve(&ctx.cwd, require_str(&args, "file_path")?);
            let content = file::read_file(&path)?;
            Ok(json!({
                "status": "success",
                "file_path": path.display().to_string(),
                "size": content.len(),
                "content": content,
            }))
        },
    )?;

    registry.register(
        ToolSpec::new(
            "write_file_content",
            "Write a file, creating parent directories as needed. Overwrites existing content.",
        )
        .param("file_path", ParamKind::String)
        .param("content", ParamKind::String),
        |ctx, args| {
            let path = file::resolve(&ctx.cwd, require_str(&args, "file_path")?);
            let content = require_str(&args, "content")?;
            file::write_file(&path, content)?;
            Ok(json!({
                "status": "success",
                "file_path": path.display().to_string(),
                "bytes_written": content.len(),
            }))
        },
    )?;

    registry.register(
        ToolSpec::new("list_directory", "List a directory's entries with type and size.")
            .optional("path", ParamKind::String, json!("."))
            .describe("Directory to list, relative to the working directory"),
        |ctx, args| {
            let path = file::resolve(&ctx.cwd, args["path"].as_str().unwrap_or("."));
            let entries: Vec<Value> = file::list_dir(&path)?
                .into_iter()
                .map(|e| json!({"name": e.name, "type": e.kind, "size": e.size}))
                .collect();
            Ok(json!({
                "status": "success",
                "path": path.display().to_string(),
                "entries": entries,
            }))
        },
    )?;

    registry.register(
        ToolSpec::new(
            STOP_TOOL,
            "Open an escalation ticket for the human operator and pause the run. \
             Use when you are blocked or need a decision you cannot make yourself.",
        )
        .param("reason", ParamKind::String)
        .describe("What you are blocked on")
        .optional("question", ParamKind::String, Value::Null)
        .describe("The specific question the operator should answer"),
        |ctx, args| {
            let reason = require_str(&args, "reason")?;

            let store = JsonStore::new(&ctx.cwd);
            let mut stops = store.read(STOPS_FILE, json!({"tickets": []}));
            if !stops.is_object() || !stops["tickets"].is_array() {
                stops = json!({"tickets": []});
            }

            let count = stops["tickets"].as_array().map(Vec::len).unwrap_or(0);
            let mut ticket = json!({
                "id": format!("S-{}", count + 1),
                "status": "OPEN",
                "created_at": unix_now(),
                "reason": reason,
            });
            if let Some(question) = args["question"].as_str() {
                ticket["question"] = json!(question);
            }

            if let Some(tickets) = stops["tickets"].as_array_mut() {
                tickets.push(ticket.clone());
            }
            store.write(STOPS_FILE, &stops)?;

            ctx.running = false;
            ctx.paused = true;
            Ok(json!({"status": "paused", "ticket": ticket}))
        },
    )?;

    Ok(())
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .ok_or_else(|| ToolError::failed(format!("{key} is required")))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
