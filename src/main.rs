//! FFTT 演示入口
//!
//! 加载配置、初始化日志，组装协调器 / 监控 / 恢复管理器，跑一条 phase_one -> phase_two 的嵌套流水线，
//! 再模拟一次资源耗尽错误并打印健康报告。`--watch` 时保持后台循环直到 Ctrl-C。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use fftt::config::load_config;
use fftt::core::{FnCleanup, ShutdownSignal};
use fftt::monitoring::{HealthTrackerCollector, SystemMonitoringAgent};
use fftt::phase::{NestedExecutionOptions, PhaseCoordinator, PhaseType};
use fftt::recovery::{OperationError, SystemErrorRecovery, SystemRecoveryManager};
use fftt::resources::{InMemoryResources, JsonFileStateStore, Resources};
use serde_json::{json, Map};

struct CliArgs {
    config_path: Option<PathBuf>,
    watch: bool,
}

fn parse_args() -> CliArgs {
    let mut args = CliArgs {
        config_path: None,
        watch: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--watch" => args.watch = true,
            "--config" => args.config_path = iter.next().map(PathBuf::from),
            other => eprintln!("ignoring unknown argument: {}", other),
        }
    }
    args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    let cfg = load_config(args.config_path).context("Failed to load config")?;
    fftt::observability::init(&cfg.app.log_level);

    let memory = InMemoryResources::new();
    let mut resources: Resources = memory.handles();
    if let Some(ref path) = cfg.app.state_file {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let store = JsonFileStateStore::open(path)
            .await
            .with_context(|| format!("Failed to open state file {}", path.display()))?;
        resources = resources.with_state_store(Arc::new(store));
    }

    let coordinator = Arc::new(
        PhaseCoordinator::new(resources.clone())
            .with_settings(cfg.coordinator.to_settings())
            .with_circuit_configs(cfg.circuit_breakers.clone()),
    );
    let monitoring = Arc::new(
        SystemMonitoringAgent::new(
            resources.clone(),
            Arc::new(HealthTrackerCollector::new(resources.health.clone())),
        )
        .with_settings(cfg.monitoring.to_settings()),
    );
    let recovery = Arc::new(
        SystemErrorRecovery::new(resources.clone(), monitoring)
            .with_settings(cfg.recovery.to_settings()),
    );
    let manager = Arc::new(
        SystemRecoveryManager::new(resources.clone(), recovery, coordinator.clone())
            .with_settings(cfg.recovery.to_manager_settings()),
    );
    manager.start().await.context("Failed to start recovery manager")?;

    // 流水线：p1 (phase_one) 嵌套执行 p2 (phase_two)
    coordinator
        .initialize_phase("p1", PhaseType::One, Map::new(), None, None)
        .await?;
    coordinator
        .initialize_phase("p2", PhaseType::Two, Map::new(), Some("p1"), None)
        .await?;
    let started = coordinator.start_phase("p1", Map::new()).await;
    tracing::info!("p1 finished with {:?}", started.status);

    let mut input = Map::new();
    input.insert("request".to_string(), json!("demo"));
    let nested = coordinator
        .coordinate_nested_execution("p1", "p2", input, NestedExecutionOptions::new())
        .await?;
    tracing::info!("nested p1 -> p2 finished with {:?}", nested.status);

    let checkpoint = manager.create_system_checkpoint(&["p1", "p2"]).await?;
    tracing::info!("created system checkpoint {}", checkpoint);

    let cleanup = FnCleanup::new("demo_cleanup", |forced| {
        tracing::info!("demo cleanup invoked (forced={})", forced);
        Ok(())
    });
    let mut error = OperationError::resource_exhaustion("memory_pool", 180.0, 100.0)
        .with_operation("allocate_buffers");
    match manager
        .handle_operation_error(&mut error, "allocate_buffers", "memory_pool", Some(&cleanup))
        .await
    {
        Ok(classification) => tracing::info!(
            "recovery for {} via {:?} succeeded={:?}",
            error,
            classification.recovery_strategy,
            classification.recovery_succeeded
        ),
        Err(original) => tracing::warn!("recovery failed for {}", original),
    }

    let health = coordinator.get_phase_health().await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    let metrics = manager.get_recovery_metrics().await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    if args.watch {
        let signal = ShutdownSignal::new();
        signal.install_ctrl_c();
        tracing::info!("watching; press Ctrl-C to stop");
        signal.wait().await;
    }

    manager.shutdown().await;
    Ok(())
}
