//! 可观测性：tracing 订阅器初始化

use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    fmt,
    prelude::*,
    EnvFilter,
};

/// 解析默认日志指令，无法解析时退回 info
fn default_directive(directive: &str) -> Directive {
    directive
        .parse()
        .unwrap_or_else(|_| Directive::from(LevelFilter::INFO))
}

/// 安装全局订阅器；RUST_LOG 优先，`default` 作为兜底指令（如配置中的 app.log_level）
pub fn try_init(default: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(default_directive(default)))
        .with(fmt::layer())
        .try_init()
}

/// 同 try_init，重复初始化时忽略
pub fn init(default: &str) {
    if let Err(e) = try_init(default) {
        eprintln!("tracing already initialized: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_directive_falls_back_to_info() {
        assert_eq!(default_directive("fftt=debug").to_string(), "fftt=debug");
        assert_eq!(default_directive("fftt=loud").to_string(), "info");
    }
}
