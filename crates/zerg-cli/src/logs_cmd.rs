//! `zerg logs`: query the aggregated structured logs.

use std::path::Path;

use anyhow::Result;

use zerg_core::config::ZergConfig;
use zerg_core::logs::{LogAggregator, LogQuery};

pub struct LogsArgs {
    pub worker: Option<String>,
    pub task: Option<String>,
    pub level: Option<String>,
    pub phase: Option<String>,
    pub event: Option<String>,
    pub zerg_level: Option<u32>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

pub fn run_logs(repo_root: &Path, args: LogsArgs) -> Result<()> {
    let config = ZergConfig::load(repo_root)?;
    let aggregator = LogAggregator::new(repo_root.join(&config.directories.logs));

    // Numeric worker filters match the JSON number; anything else (e.g.
    // "orchestrator") matches the string form.
    let worker_id = args.worker.map(|w| match w.parse::<u64>() {
        Ok(n) => serde_json::json!(n),
        Err(_) => serde_json::json!(w),
    });

    let query = LogQuery {
        worker_id,
        task_id: args.task,
        level: args.level,
        phase: args.phase,
        event: args.event,
        zerg_level: args.zerg_level,
        since: args.since,
        until: args.until,
        search: args.search,
        limit: args.limit,
    };

    let entries = aggregator.query(&query);
    for entry in &entries {
        let ts = entry.get("ts").and_then(|v| v.as_str()).unwrap_or("-");
        let level = entry.get("level").and_then(|v| v.as_str()).unwrap_or("-");
        let worker = entry
            .get("worker_id")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".into());
        let message = entry.get("message").and_then(|v| v.as_str()).unwrap_or("");
        match entry.get("task_id").and_then(|v| v.as_str()) {
            Some(task) => println!("{ts} [{level}] worker={worker} task={task} {message}"),
            None => println!("{ts} [{level}] worker={worker} {message}"),
        }
    }
    eprintln!("{} entries", entries.len());
    Ok(())
}
