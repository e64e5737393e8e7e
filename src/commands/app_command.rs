use crate::backtest::model::LogWindow;
use std::convert::Infallible;
use std::str::FromStr;

pub const HELP_TEXT: &str = "\
命令:
  run <strategy_id> <start_date> <end_date> [cash] [benchmark] [frequency]
  cancel <job_id>
  status <job_id>
  result <job_id> [page] [page_size]
  log <job_id> [tail <bytes> | offset <bytes>]
  jobs <strategy_id> [limit] [offset] [status]
  delete-job <job_id>
  save <strategy_id> <file>
  show <strategy_id>
  strategies [limit] [offset] [q]
  compile <strategy_id> [file]
  rename <from_id> <to_id> [code_file]
  map <from_id> <to_id>
  renames
  delete-strategy <strategy_id> [cascade]
  stats | bundle | help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    Run {
        strategy_id: String,
        start_date: String,
        end_date: String,
        cash: Option<f64>,
        benchmark: Option<String>,
        frequency: Option<String>,
    },
    Cancel {
        job_id: String,
    },
    Status {
        job_id: String,
    },
    Result {
        job_id: String,
        page: Option<(usize, usize)>,
    },
    Log {
        job_id: String,
        window: LogWindow,
    },
    Jobs {
        strategy_id: String,
        limit: u64,
        offset: u64,
        status: Option<String>,
    },
    DeleteJob {
        job_id: String,
    },
    Save {
        strategy_id: String,
        file: String,
    },
    Show {
        strategy_id: String,
    },
    Strategies {
        limit: u64,
        offset: u64,
        q: Option<String>,
    },
    /// `file` 给出时只检查该文件内容，不保存
    Compile {
        strategy_id: String,
        file: Option<String>,
    },
    Rename {
        from_id: String,
        to_id: String,
        code_file: Option<String>,
    },
    Map {
        from_id: String,
        to_id: String,
    },
    Renames,
    DeleteStrategy {
        strategy_id: String,
        cascade: bool,
    },
    Stats,
    Bundle,
    Help,
    Quit,
    Unknown(String),
}

fn usage(text: &str) -> AppCommand {
    AppCommand::Unknown(format!("用法: {}", text))
}

/// 解析不会失败：用法错误落到 `Unknown`，由 dispatch 输出提示
impl FromStr for AppCommand {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(AppCommand::Unknown("".to_string()));
        }
        let arg = |i: usize| parts.get(i).map(|s| s.to_string());

        match parts[0] {
            "run" => {
                let (Some(strategy_id), Some(start_date), Some(end_date)) = (arg(1), arg(2), arg(3))
                else {
                    return Ok(usage(
                        "run <strategy_id> <start_date> <end_date> [cash] [benchmark] [frequency]",
                    ));
                };
                let cash = match parts.get(4) {
                    Some(raw) => match raw.parse::<f64>() {
                        Ok(v) => Some(v),
                        Err(_) => return Ok(AppCommand::Unknown(format!("cash 不是数字: {}", raw))),
                    },
                    None => None,
                };
                Ok(AppCommand::Run {
                    strategy_id,
                    start_date,
                    end_date,
                    cash,
                    benchmark: arg(5),
                    frequency: arg(6),
                })
            }
            "cancel" => match arg(1) {
                Some(job_id) => Ok(AppCommand::Cancel { job_id }),
                None => Ok(usage("cancel <job_id>")),
            },
            "status" => match arg(1) {
                Some(job_id) => Ok(AppCommand::Status { job_id }),
                None => Ok(usage("status <job_id>")),
            },
            "result" => {
                let Some(job_id) = arg(1) else {
                    return Ok(usage("result <job_id> [page] [page_size]"));
                };
                let page = match (parts.get(2), parts.get(3)) {
                    (None, _) => None,
                    (Some(p), size) => {
                        let page = p.parse::<usize>().ok();
                        let size = size.map_or(Some(100), |s| s.parse::<usize>().ok());
                        match (page, size) {
                            (Some(p), Some(s)) => Some((p, s)),
                            _ => return Ok(usage("result <job_id> [page] [page_size]")),
                        }
                    }
                };
                Ok(AppCommand::Result { job_id, page })
            }
            "log" => {
                let Some(job_id) = arg(1) else {
                    return Ok(usage("log <job_id> [tail <bytes> | offset <bytes>]"));
                };
                let n = parts.get(3).and_then(|s| s.parse::<u64>().ok());
                let window = match (parts.get(2).copied(), n) {
                    (None, _) => LogWindow::Full,
                    (Some("tail"), Some(n)) => LogWindow::Tail(n),
                    (Some("offset"), Some(n)) => LogWindow::Offset(n),
                    _ => return Ok(usage("log <job_id> [tail <bytes> | offset <bytes>]")),
                };
                Ok(AppCommand::Log { job_id, window })
            }
            "jobs" => {
                let Some(strategy_id) = arg(1) else {
                    return Ok(usage("jobs <strategy_id> [limit] [offset] [status]"));
                };
                let limit = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(100);
                let offset = parts.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
                Ok(AppCommand::Jobs {
                    strategy_id,
                    limit,
                    offset,
                    status: arg(4),
                })
            }
            "delete-job" => match arg(1) {
                Some(job_id) => Ok(AppCommand::DeleteJob { job_id }),
                None => Ok(usage("delete-job <job_id>")),
            },
            "save" => match (arg(1), arg(2)) {
                (Some(strategy_id), Some(file)) => Ok(AppCommand::Save { strategy_id, file }),
                _ => Ok(usage("save <strategy_id> <file>")),
            },
            "show" => match arg(1) {
                Some(strategy_id) => Ok(AppCommand::Show { strategy_id }),
                None => Ok(usage("show <strategy_id>")),
            },
            "strategies" => {
                let num = |i: usize| match parts.get(i) {
                    None => Some(None),
                    Some(raw) => raw.parse::<u64>().ok().map(Some),
                };
                let (Some(limit), Some(offset)) = (num(1), num(2)) else {
                    return Ok(usage("strategies [limit] [offset] [q]"));
                };
                Ok(AppCommand::Strategies {
                    limit: limit.unwrap_or(100),
                    offset: offset.unwrap_or(0),
                    q: arg(3),
                })
            }
            "compile" => match arg(1) {
                Some(strategy_id) => Ok(AppCommand::Compile {
                    strategy_id,
                    file: arg(2),
                }),
                None => Ok(usage("compile <strategy_id> [file]")),
            },
            "rename" => match (arg(1), arg(2)) {
                (Some(from_id), Some(to_id)) => Ok(AppCommand::Rename {
                    from_id,
                    to_id,
                    code_file: arg(3),
                }),
                _ => Ok(usage("rename <from_id> <to_id> [code_file]")),
            },
            "map" => match (arg(1), arg(2)) {
                (Some(from_id), Some(to_id)) => Ok(AppCommand::Map { from_id, to_id }),
                _ => Ok(usage("map <from_id> <to_id>")),
            },
            "renames" => Ok(AppCommand::Renames),
            "delete-strategy" => match arg(1) {
                Some(strategy_id) => Ok(AppCommand::DeleteStrategy {
                    strategy_id,
                    cascade: matches!(
                        parts.get(2).map(|s| s.to_ascii_lowercase()).as_deref(),
                        Some("cascade" | "--cascade" | "1" | "true" | "yes")
                    ),
                }),
                None => Ok(usage("delete-strategy <strategy_id> [cascade]")),
            },
            "stats" => Ok(AppCommand::Stats),
            "bundle" => Ok(AppCommand::Bundle),
            "help" | "h" => Ok(AppCommand::Help),
            "quit" | "q" | "exit" => Ok(AppCommand::Quit),
            _ => Ok(AppCommand::Unknown(format!("未知命令: {}", parts[0]))),
        }
    }
}
