//! 策略源码的语法与依赖检查。检查在独立的 Python 进程里做，源码从 stdin 传入，不落盘。

use crate::config::{split_command, Config, DEFAULT_COMPILE_TIMEOUT_SECS};
use anyhow::{bail, Context};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// 解释器里执行的检查脚本：先 ast.parse，再逐个确认顶层 import 可被找到。
/// 结果以一行 JSON 写到 stdout。
const CHECK_SCRIPT: &str = r#"
import ast, json, sys, importlib.util
src = sys.stdin.read()
out = {"ok": True, "stdout": "", "stderr": "", "diagnostics": []}
try:
    tree = ast.parse(src, "strategy.py")
except SyntaxError as e:
    msg = e.msg or "invalid syntax"
    out["ok"] = False
    out["stderr"] = "SyntaxError: %s (line %s)" % (msg, e.lineno)
    out["diagnostics"] = [{"line": e.lineno or 1, "column": e.offset or 1, "level": "error", "message": msg}]
    print(json.dumps(out))
    sys.exit(0)
lines = ["syntax check passed"]
missing = []
seen = set()
for node in ast.walk(tree):
    if isinstance(node, ast.Import):
        names = [a.name for a in node.names]
    elif isinstance(node, ast.ImportFrom) and not node.level and node.module:
        names = [node.module]
    else:
        continue
    for name in names:
        root = name.split(".")[0]
        if root in seen:
            continue
        seen.add(root)
        try:
            found = importlib.util.find_spec(root) is not None
        except Exception:
            found = False
        if not found:
            missing.append({"line": node.lineno, "column": node.col_offset + 1, "level": "error",
                            "message": "module '%s' is not installed" % root})
if missing:
    out["ok"] = False
    out["stderr"] = "\n".join(d["message"] for d in missing)
    out["diagnostics"] = missing
else:
    lines.append("dependency check passed")
out["stdout"] = "\n".join(lines)
print(json.dumps(out))
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileKind {
    Ok,
    CompileError,
    InternalError,
}

impl fmt::Display for CompileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompileKind::Ok => "ok",
            CompileKind::CompileError => "compile_error",
            CompileKind::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// 检查器原样输出的诊断，字段可能缺失或越界
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawDiagnostic {
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub column: Option<i64>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CheckOutput {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub diagnostics: Vec<RawDiagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileReport {
    pub kind: CompileKind,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileReport {
    /// 规整诊断：行列不小于 0，级别默认 error，按 (行, 列, 消息) 排序
    pub fn from_check(out: CheckOutput) -> Self {
        let mut diagnostics: Vec<Diagnostic> = out
            .diagnostics
            .into_iter()
            .map(|d| Diagnostic {
                line: clamp_position(d.line),
                column: clamp_position(d.column),
                level: d
                    .level
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| "error".to_string()),
                message: d.message.unwrap_or_default(),
            })
            .collect();
        diagnostics.sort_by(|a, b| {
            (a.line, a.column, &a.message).cmp(&(b.line, b.column, &b.message))
        });
        Self {
            kind: if out.ok {
                CompileKind::Ok
            } else {
                CompileKind::CompileError
            },
            ok: out.ok,
            stdout: out.stdout,
            stderr: out.stderr,
            diagnostics,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: CompileKind::InternalError,
            ok: false,
            stdout: String::new(),
            stderr: message.into(),
            diagnostics: Vec::new(),
        }
    }
}

fn clamp_position(v: Option<i64>) -> u32 {
    v.unwrap_or(0).clamp(0, u32::MAX as i64) as u32
}

/// 源码检查器
#[async_trait]
pub trait StrategyChecker: Send + Sync {
    async fn check(&self, code: &str) -> anyhow::Result<CheckOutput>;
}

/// `<python> -c <检查脚本>`，超时后杀掉子进程
pub struct PythonChecker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl PythonChecker {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let mut parts = split_command(&cfg.compile_command);
        let program = if parts.is_empty() {
            "python3".to_string()
        } else {
            parts.remove(0)
        };
        Self::new(program, parts, cfg.compile_timeout)
    }
}

impl Default for PythonChecker {
    fn default() -> Self {
        Self::new(
            "python3",
            Vec::new(),
            Duration::from_secs(DEFAULT_COMPILE_TIMEOUT_SECS),
        )
    }
}

#[async_trait]
impl StrategyChecker for PythonChecker {
    async fn check(&self, code: &str) -> anyhow::Result<CheckOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("-c")
            .arg(CHECK_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn checker {}", self.program))?;

        let mut stdin = child.stdin.take();
        let run = async move {
            if let Some(stdin) = stdin.as_mut() {
                // 子进程可能不读 stdin 就退出
                if let Err(e) = stdin.write_all(code.as_bytes()).await {
                    debug!("写入检查器 stdin 失败: {}", e);
                }
            }
            drop(stdin);
            child.wait_with_output().await
        };
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output.context("wait checker")?,
            Err(_) => bail!("compile timeout after {}s", self.timeout.as_secs()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(last) = stdout.lines().rev().find(|l| !l.trim().is_empty()) else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "checker produced no output (exit code={:?}): {}",
                output.status.code(),
                stderr.trim()
            );
        };
        serde_json::from_str(last.trim()).context("checker output is not valid JSON")
    }
}
