//! 改名图的纯函数部分。
//!
//! 存储的关系是 `旧 id -> 当前 id` 的部分函数，每个值都是终点（没有出边），
//! 所以解析只需一次查表。这里不碰存储：调用方读出边集、计算变更、整体写回。

use crate::error::ConflictError;
use std::collections::{BTreeMap, HashSet};

pub type RenameMap = BTreeMap<String, String>;

pub const NOOP_SAME_ID: &str = "noop: source and target are the same strategy";
pub const NOOP_ALREADY_APPLIED: &str = "noop: rename already applied";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenamePlan {
    /// 无需写入；`canonical` 是 `from` 当前解析到的 id
    Noop {
        canonical: String,
        warning: &'static str,
    },
    /// 完整的新边集，已压缩
    Apply { edges: RenameMap, terminal: String },
}

/// 沿边走到终点，没有边时返回 `id` 本身。
/// 输入未压缩或有环时，遇到重复节点即停止。
pub fn resolve(edges: &RenameMap, id: &str) -> String {
    let mut current = id;
    let mut visited: HashSet<&str> = HashSet::from([id]);
    while let Some(next) = edges.get(current) {
        if !visited.insert(next.as_str()) {
            break;
        }
        current = next;
    }
    current.to_string()
}

/// `start` 的终点；走进环时返回 `None`
fn terminal_of(edges: &RenameMap, start: &str) -> Option<String> {
    let mut current = start;
    let mut visited: HashSet<&str> = HashSet::from([start]);
    while let Some(next) = edges.get(current) {
        if !visited.insert(next.as_str()) {
            return None;
        }
        current = next;
    }
    Some(current.to_string())
}

/// 每条边改写为直接指向终点，丢弃自环以及落入环的节点
pub fn compress(edges: &RenameMap) -> RenameMap {
    edges
        .keys()
        .filter_map(|from| {
            let terminal = terminal_of(edges, from)?;
            (terminal != *from).then(|| (from.clone(), terminal))
        })
        .collect()
}

/// 加入 `from -> to` 后 `from` 能否回到自身
pub fn would_create_cycle(edges: &RenameMap, from: &str, to: &str) -> bool {
    from == to || resolve(edges, to) == from
}

/// 在已压缩的边集上规划 `from -> to`，两个 id 须已校验。
/// 返回的边集中 `from` 的所有前驱都指向新终点。
pub fn plan_upsert(edges: &RenameMap, from: &str, to: &str) -> Result<RenamePlan, ConflictError> {
    if from == to {
        return Ok(RenamePlan::Noop {
            canonical: resolve(edges, from),
            warning: NOOP_SAME_ID,
        });
    }
    if would_create_cycle(edges, from, to) {
        return Err(ConflictError::RenameCycle {
            from_id: from.to_string(),
            to_id: to.to_string(),
        });
    }

    let terminal = resolve(edges, to);
    if resolve(edges, from) == terminal {
        return Ok(RenamePlan::Noop {
            canonical: terminal,
            warning: NOOP_ALREADY_APPLIED,
        });
    }

    let mut next = edges.clone();
    for target in next.values_mut() {
        if target == from {
            *target = terminal.clone();
        }
    }
    next.insert(from.to_string(), terminal.clone());
    Ok(RenamePlan::Apply {
        edges: next,
        terminal,
    })
}

/// 解析到 `canonical` 的全部 id，含自身
pub fn aliases(edges: &RenameMap, canonical: &str) -> Vec<String> {
    let mut out = vec![canonical.to_string()];
    out.extend(
        edges
            .keys()
            .filter(|from| from.as_str() != canonical && resolve(edges, from) == canonical)
            .cloned(),
    );
    out
}

/// 去掉以 `canonical` 为起点或终点的边
pub fn without_strategy(edges: &RenameMap, canonical: &str) -> RenameMap {
    edges
        .iter()
        .filter(|(from, to)| from.as_str() != canonical && to.as_str() != canonical)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// 把 `stored` 变成 `target` 需要的行级变更：(upserts, deletes)
pub fn diff(stored: &RenameMap, target: &RenameMap) -> (Vec<(String, String)>, Vec<String>) {
    let upserts = target
        .iter()
        .filter(|(k, v)| stored.get(k.as_str()) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let deletes = stored
        .keys()
        .filter(|k| !target.contains_key(k.as_str()))
        .cloned()
        .collect();
    (upserts, deletes)
}
