pub mod catalog;
pub mod config;
pub mod conversation;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod logging;
pub mod usage;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let pool = Arc::new(credential::CredentialPool::new(&cfg.api_keys));
    if pool.is_empty() {
        tracing::warn!("未配置任何 API Key（GEMINI_API_KEYS / GEMINI_API_KEY），聊天请求将返回 500");
    } else {
        let masked: Vec<String> = pool.iter().map(|c| c.masked()).collect();
        tracing::info!(count = pool.len(), keys = ?masked, "已加载 API Key");
    }

    let catalog = Arc::new(
        catalog::ModelCatalog::from_pairs(cfg.models.iter().map(|(id, l)| (id.clone(), *l)))
            .context("初始化模型目录失败")?,
    );
    for (i, b) in catalog.backends().iter().enumerate() {
        tracing::info!(priority = i, backend = %b.id, daily_limit = b.daily_limit, "模型目录");
    }

    let usage = Arc::new(usage::UsageTracker::new(
        &catalog,
        cfg.quota_reset_utc_offset,
    ));

    let client = gemini::GeminiClient::new(&cfg).context("初始化 GeminiClient 失败")?;

    let engine = dispatch::DispatchEngine::new(client, pool, catalog, usage)
        .with_attempt_timeout(Some(Duration::from_millis(cfg.attempt_timeout_ms)));

    let state = Arc::new(gateway::AppState {
        cfg: cfg.clone(),
        engine,
    });
    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // 默认把依赖库日志控制在 warn，但确保本项目自身日志至少为 info，
    // 以免环境中预设的 RUST_LOG=warn 把调度日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,gemini_relay=info")
        } else if env.contains("gemini_relay") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},gemini_relay=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
