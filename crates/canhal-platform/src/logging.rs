//! 日志初始化
//!
//! 设置了 `RUST_LOG` 时完全按它过滤；未设置（或无法解析）时使用默认指令，
//! canhal 各 crate 为 `info` 级别。

use tracing_subscriber::EnvFilter;

/// 默认过滤指令
pub const DEFAULT_DIRECTIVE: &str = "canhal=info";

/// 安装全局 fmt subscriber
///
/// 可以重复调用：已经安装过（包括宿主程序自己安装的）时返回 `false`。
pub fn init() -> bool {
    init_with_directive(DEFAULT_DIRECTIVE)
}

/// `directive` 只在 `RUST_LOG` 未设置时生效
pub fn init_with_directive(directive: &str) -> bool {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    tracing_subscriber::fmt()
        .with_env_filter(filter_for(env.as_deref(), directive))
        .try_init()
        .is_ok()
}

fn filter_for(env: Option<&str>, directive: &str) -> EnvFilter {
    if let Some(spec) = env.filter(|s| !s.trim().is_empty()) {
        match EnvFilter::try_new(spec) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("Ignoring invalid {}: {}", EnvFilter::DEFAULT_ENV, e),
        }
    }
    EnvFilter::new(directive)
}
