//! Hive 命令行入口
//!
//! 用法：`hive <plan.json> [--config <path>] [--user <id>] [--approve-all]`
//! 读取计划文档并执行，结束后把任务报告以 JSON 打印到标准输出。Ctrl-C 触发紧急停止。

use std::path::PathBuf;

use anyhow::{bail, Context};
use hive::config::load_config;
use hive::observability;
use hive::oracle::parse_plan_text;
use hive::AgentBuilder;

struct Args {
    plan: PathBuf,
    config: Option<PathBuf>,
    user: String,
    approve_all: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut plan = None;
    let mut config = None;
    let mut user = "local".to_string();
    let mut approve_all = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--approve-all" => approve_all = true,
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "--user" => user = args.next().context("--user needs an id")?,
            other if other.starts_with("--") => bail!("unknown option: {other}"),
            other => plan = Some(PathBuf::from(other)),
        }
    }
    let Some(plan) = plan else {
        bail!("usage: hive <plan.json> [--config <path>] [--user <id>] [--approve-all]");
    };
    Ok(Args {
        plan,
        config,
        user,
        approve_all,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let cfg = load_config(args.config.clone()).context("Failed to load config")?;
    observability::init(&cfg.observability);

    let text = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("Failed to read plan {}", args.plan.display()))?;
    let plan = parse_plan_text(&text).context("Failed to parse plan")?;

    let agent = std::sync::Arc::new(AgentBuilder::new(cfg).build().context("Failed to build agent")?);

    let mut confirmations = agent.subscribe_confirmations();
    let handle = agent.submit(&args.user, plan).context("Plan rejected")?;
    let task_id = handle.task_id().to_string();

    // 交互确认：--approve-all 时自动同意，否则拒绝
    let approver = {
        let agent = agent.clone();
        let approve = args.approve_all;
        tokio::spawn(async move {
            while let Ok(req) = confirmations.recv().await {
                tracing::info!(step_id = %req.step_id, scope = %req.scope, approve, "Resolving confirmation");
                if let Err(e) = agent.resolve_confirmation(&req.prompt_token, approve) {
                    tracing::warn!(error = %e, "Failed to resolve confirmation");
                }
            }
        })
    };

    let stopper = {
        let agent = agent.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!(task_id = %task_id, "Interrupted, stopping task");
                if let Err(e) = agent.emergency_stop(&task_id).await {
                    tracing::warn!(error = %e, "Emergency stop failed");
                }
            }
        })
    };

    let report = handle.wait().await?;
    approver.abort();
    stopper.abort();
    agent.flush_events();

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status() != hive::TaskStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
