use oscmuis_core::config::load_config;
use std::path::PathBuf;

mod runner;

/// Environment variable naming an alternative config file.
const CONFIG_ENV: &str = "OSCMUIS_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 初始化日志（这是入口点的职责）
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // 2. 配置文件：命令行参数优先，其次是环境变量，否则使用内置默认值
    let config_path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from);

    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // 3. 处理顶层错误
    if let Err(e) = runner::run(config).await {
        tracing::error!("❌ OSC-Muis failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
