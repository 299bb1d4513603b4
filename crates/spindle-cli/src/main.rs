//! spindle デモ
//!
//! 擬似 work function（sleep して echo、指定回に 1 回失敗）でタスクを流し、
//! 最終状態と stats を JSON で出力する。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use spindle_core::{
    CallbackConfig, EngineBuilder, EngineConfig, FailureContext, SubmitOptions, TaskId,
    TaskStatus, WorkError, sync_callback_fn, work_fn,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "spindle", about = "Run simulated tasks through the spindle engine")]
struct Args {
    /// Engine config (TOML). Missing file means defaults.
    #[arg(long, default_value = "spindle.toml")]
    config: PathBuf,

    /// Number of tasks to submit.
    #[arg(long, default_value_t = 6)]
    tasks: usize,

    /// Every n-th task fails (0 disables failures).
    #[arg(long, default_value_t = 3)]
    fail_every: usize,

    /// Simulated work duration per task.
    #[arg(long, default_value_t = 100)]
    work_ms: u64,

    /// Cancel the last submitted task right away.
    #[arg(long)]
    cancel_last: bool,
}

#[derive(Debug, Deserialize)]
struct DemoInput {
    n: usize,
    fail: bool,
    work_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    // (A) config と work function
    let config = EngineConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let work = work_fn(|kind, input, ctx| async move {
        let input: DemoInput = serde_json::from_value(input)?;
        tokio::time::sleep(Duration::from_millis(input.work_ms / 2)).await;
        ctx.progress.report(50);
        tokio::time::sleep(Duration::from_millis(input.work_ms / 2)).await;
        if input.fail {
            return Err(WorkError::new(format!("simulated failure in task #{}", input.n)));
        }
        Ok::<_, WorkError>(serde_json::json!({ "kind": kind.as_str(), "n": input.n }))
    });

    // (B) エンジンを構築して reaper を起動
    let manager = EngineBuilder::new(work).config(config).build()?;
    manager.start()?;
    manager.register_callback(
        "audit",
        Arc::new(sync_callback_fn(|ctx: &FailureContext| {
            info!(task_id = %ctx.task_id, "audit: recorded failure");
            Ok(())
        })),
    );

    // (C) タスク投入（submit は待たない）
    let mut ids: Vec<TaskId> = Vec::with_capacity(args.tasks);
    for n in 1..=args.tasks {
        let fail = args.fail_every > 0 && n % args.fail_every == 0;
        let kind = if n % 2 == 0 { "summarize" } else { "translate" };
        let callbacks = CallbackConfig {
            custom_callback_name: Some("audit".to_string()),
            ..CallbackConfig::log_only()
        };
        let id = manager.submit(
            kind,
            serde_json::json!({ "n": n, "fail": fail, "work_ms": args.work_ms }),
            SubmitOptions::new().callbacks(callbacks),
        )?;
        ids.push(id);
    }
    if args.cancel_last {
        if let Some(&last) = ids.last() {
            info!(task_id = %last, cancelled = manager.cancel(last), "cancel requested");
        }
    }

    // (D) 全タスクが終端状態になるまでポーリング
    loop {
        let pending = manager
            .list(None, 0)?
            .iter()
            .filter(|view| matches!(view.status, TaskStatus::Pending | TaskStatus::Running))
            .count();
        if pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // (E) 結果と stats を出力して停止
    for id in &ids {
        let view = manager.result(*id)?;
        println!("{}", serde_json::to_string(&view)?);
    }
    println!("{}", serde_json::to_string_pretty(&manager.stats()?)?);

    manager.shutdown().await;
    Ok(())
}
