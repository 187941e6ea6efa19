//! Script sandbox collaborator.
//!
//! The engine only needs `evaluate(program, args, entry_point, settings)`.
//! [`CommandSandbox`] implements it by running a JavaScript interpreter as a
//! child process: the program plus an invocation stub go in on stdin, and the
//! JSON-serialized return value comes back on stdout behind a marker so
//! script `console` output can be told apart from the result.
//!
//! Under node the buyer program never runs in the host realm. It is
//! evaluated in a `vm` context whose global starts empty, with string and
//! wasm code generation off. The interpreter itself starts under node's
//! permission model with no grants, so host access stays refused even if
//! the context is escaped.

use std::process::Stdio;

use anyhow::{Context, bail};
use async_trait::async_trait;
use signals_core::config::SandboxConfig;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Prefix of the stdout line carrying the result.
pub const RESULT_MARKER: &str = "__SIGNALS_RESULT__:";

/// A named script argument. `json` is a JSON literal (object, number, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedArgument {
    pub name: String,
    pub json: String,
}

impl NamedArgument {
    pub fn new(name: impl Into<String>, json: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            json: json.into(),
        }
    }
}

/// Per-run isolation limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolateSettings {
    pub max_heap_size_bytes: Option<u64>,
    pub console_messages_in_logs: bool,
}

impl Default for IsolateSettings {
    fn default() -> Self {
        Self {
            max_heap_size_bytes: Some(10 * 1024 * 1024),
            console_messages_in_logs: false,
        }
    }
}

impl From<&SandboxConfig> for IsolateSettings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_heap_size_bytes: config.max_heap_size_bytes,
            console_messages_in_logs: config.console_messages_in_logs,
        }
    }
}

#[async_trait]
pub trait ScriptSandbox: Send + Sync {
    /// Run `entry_point(args...)` in `program` and return its JSON-serialized
    /// result. An empty string means the script produced nothing.
    async fn evaluate(
        &self,
        program: &str,
        args: &[NamedArgument],
        entry_point: &str,
        settings: &IsolateSettings,
    ) -> anyhow::Result<String>;
}

/// Runs scripts in a fresh interpreter process per call.
///
/// The child is killed when the returned future is dropped, so an outer
/// timeout reclaims a runaway script.
#[derive(Debug, Clone)]
pub struct CommandSandbox {
    command: String,
    args: Vec<String>,
    permission_flag: Option<String>,
}

impl CommandSandbox {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            permission_flag: Some("--permission".to_string()),
        }
    }

    pub fn with_permission_flag(mut self, flag: Option<String>) -> Self {
        self.permission_flag = flag;
        self
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
            .with_permission_flag(config.permission_flag.clone())
    }

    fn is_node(&self) -> bool {
        std::path::Path::new(&self.command)
            .file_stem()
            .is_some_and(|stem| stem == "node")
    }

    fn command_args(&self, settings: &IsolateSettings) -> Vec<String> {
        let mut args = Vec::new();
        if self.is_node() {
            args.extend(self.permission_flag.iter().cloned());
            if let Some(bytes) = settings.max_heap_size_bytes {
                let mib = bytes.div_ceil(1024 * 1024).max(1);
                args.push(format!("--max-old-space-size={mib}"));
            }
        }
        args.extend(self.args.iter().cloned());
        args
    }

    fn script(&self, program: &str, args: &[NamedArgument], entry_point: &str) -> anyhow::Result<String> {
        if self.is_node() {
            isolated_invocation_script(program, args, entry_point)
        } else {
            Ok(invocation_script(program, args, entry_point))
        }
    }
}

fn call_stub(args: &[NamedArgument], entry_point: &str) -> String {
    let mut stub = String::new();
    for (index, arg) in args.iter().enumerate() {
        stub.push_str(&format!("  const __arg{index} = {};\n", arg.json));
    }
    let call_args = (0..args.len())
        .map(|index| format!("__arg{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    stub.push_str(&format!("  const __result = {entry_point}({call_args});\n"));
    stub
}

/// Program text followed by a stub that calls the entry point and prints
/// the marked result line.
pub fn invocation_script(program: &str, args: &[NamedArgument], entry_point: &str) -> String {
    let mut script = String::with_capacity(program.len() + 256);
    script.push_str(program);
    script.push_str("\n;(function () {\n");
    script.push_str(&call_stub(args, entry_point));
    script.push_str(&format!(
        "  console.log('{RESULT_MARKER}' + JSON.stringify(__result === undefined ? null : __result));\n"
    ));
    script.push_str("})();\n");
    script
}

/// Node host script that evaluates the program in a fresh, empty `vm`
/// context and prints the marked result line.
///
/// The guest gets its own `console` that buffers lines; the host replays
/// them before the result so [`extract_result`] sees the same shape as
/// [`invocation_script`] output.
pub fn isolated_invocation_script(
    program: &str,
    args: &[NamedArgument],
    entry_point: &str,
) -> anyhow::Result<String> {
    let mut guest = String::with_capacity(program.len() + 512);
    guest.push_str(
        "const __signalsConsole = [];\n\
         globalThis.console = (function () {\n\
           const log = (...parts) => { __signalsConsole.push(parts.map(String).join(' ')); };\n\
           return { log, info: log, warn: log, error: log, debug: log };\n\
         })();\n",
    );
    guest.push_str(program);
    guest.push_str("\n;(function () {\n");
    guest.push_str(&call_stub(args, entry_point));
    guest.push_str(
        "  return JSON.stringify([__signalsConsole, __result === undefined ? null : __result]);\n})();\n",
    );
    let guest = serde_json::to_string(&guest).context("encoding guest program")?;

    Ok(format!(
        "'use strict';\n\
         const __vm = require('vm');\n\
         const __context = __vm.createContext(Object.create(null), {{\n\
           codeGeneration: {{ strings: false, wasm: false }},\n\
         }});\n\
         const [__lines, __result] = JSON.parse(__vm.runInContext({guest}, __context, {{ filename: 'encoder.js' }}));\n\
         for (const line of __lines) console.log(line);\n\
         console.log('{RESULT_MARKER}' + JSON.stringify(__result));\n"
    ))
}

/// Pull the marked result out of captured stdout. Other lines are script
/// console output.
pub fn extract_result(stdout: &str, log_console: bool) -> String {
    let mut result = String::new();
    for line in stdout.lines() {
        match line.strip_prefix(RESULT_MARKER) {
            Some(rest) => result = rest.to_string(),
            None if log_console => debug!(line, "encoder console"),
            None => {}
        }
    }
    result
}

#[async_trait]
impl ScriptSandbox for CommandSandbox {
    async fn evaluate(
        &self,
        program: &str,
        args: &[NamedArgument],
        entry_point: &str,
        settings: &IsolateSettings,
    ) -> anyhow::Result<String> {
        let script = self.script(program, args, entry_point)?;

        let mut child = Command::new(&self.command)
            .args(self.command_args(settings))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.command))?;

        let mut stdin = child.stdin.take().context("interpreter stdin unavailable")?;
        stdin.write_all(script.as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            );
        }

        Ok(extract_result(&stdout, settings.console_messages_in_logs))
    }
}
