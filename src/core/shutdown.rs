//! 后台循环与清理回调
//!
//! 协调器的停滞/孤儿巡检与监控代理的指标循环都是「可取消的周期任务」：
//! - 由 CancellationToken 驱动，停止时在有界超时内等待任务结束
//! - 单次 tick 出错只记录日志并按退避间隔继续，不会终止循环
//!
//! CleanupCallback 是组件交给错误恢复层的清理入口（forced = true 表示强制清理）。

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 周期性后台任务句柄
#[derive(Debug)]
pub struct LoopHandle {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl LoopHandle {
    /// 启动周期任务：立即执行首个 tick，成功后等待 `interval`，失败后等待 `error_backoff`
    pub fn spawn<F, Fut>(
        name: &'static str,
        token: CancellationToken,
        interval: Duration,
        error_backoff: Duration,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("Background loop '{}' started", name);
            loop {
                let wait = tokio::select! {
                    _ = loop_token.cancelled() => break,
                    outcome = tick() => match outcome {
                        Ok(()) => interval,
                        Err(e) => {
                            tracing::error!("Background loop '{}' tick failed: {}", name, e);
                            error_backoff
                        }
                    },
                };

                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            tracing::info!("Background loop '{}' stopped", name);
        });

        Self { name, token, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// 发出取消信号并在 `timeout` 内等待任务退出；超时则强制 abort
    ///
    /// 返回任务是否在时限内干净退出。
    pub async fn stop(mut self, timeout: Duration) -> bool {
        self.token.cancel();
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) if e.is_cancelled() => true,
            Ok(Err(e)) => {
                tracing::warn!("Background loop '{}' panicked: {}", self.name, e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Background loop '{}' did not stop within {:?}, aborting",
                    self.name,
                    timeout
                );
                self.handle.abort();
                false
            }
        }
    }
}

/// 组件提供的清理入口；需幂等，可能被多次调用
#[async_trait::async_trait]
pub trait CleanupCallback: Send + Sync {
    async fn cleanup(&self, forced: bool) -> anyhow::Result<()>;

    /// 清理回调名称（用于日志）
    fn name(&self) -> &str {
        "cleanup"
    }
}

/// 用同步闭包实现的清理回调
pub struct FnCleanup<F>
where
    F: Fn(bool) -> anyhow::Result<()> + Send + Sync,
{
    name: String,
    cleanup_fn: F,
}

impl<F> FnCleanup<F>
where
    F: Fn(bool) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, cleanup_fn: F) -> Self {
        Self {
            name: name.into(),
            cleanup_fn,
        }
    }
}

#[async_trait::async_trait]
impl<F> CleanupCallback for FnCleanup<F>
where
    F: Fn(bool) -> anyhow::Result<()> + Send + Sync,
{
    async fn cleanup(&self, forced: bool) -> anyhow::Result<()> {
        (self.cleanup_fn)(forced)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 进程级关闭信号（演示程序的 watch 模式使用）
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 派生给后台循环的子 token：根 token 取消时一并取消
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 监听，收到信号后触发关闭
    pub fn install_ctrl_c(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping background loops...");
                signal.trigger();
            }
        });
    }
}
