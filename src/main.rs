use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 解析命令行参数（缺少必需的环境变量时直接退出）
    let args = hls2tg::cli::parse_args();

    info!("Starting HLS to Telegram mirror...");
    info!("M3U8 URL: {}", args.url);
    info!("Telegram channel: {}", args.channel_id);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, shutting down...");
                shutdown.cancel();
            }
        });
    }

    match hls2tg::run(args, shutdown).await {
        Ok(reason) => info!("Stopped: {:?}", reason),
        Err(e) => {
            error!("An error occurred: {:#}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
