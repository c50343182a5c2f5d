// SSH Manager
// 命令行入口：初始化目录与 Include 行，输出连接列表与校验结果

use anyhow::Context;
use serde_json::json;

use ssh_manager::services::storage;
use ssh_manager::SshManager;

fn main() -> anyhow::Result<()> {
    // 通过 RUST_LOG 控制日志级别，例如：RUST_LOG=debug ssh-manager
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = storage::load_settings()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ssh-manager-worker")
        .build()
        .context("Failed to create Tokio runtime")?;

    runtime.block_on(async move {
        let manager = SshManager::new(settings);
        let init = manager
            .initialize()
            .await
            .context("Initialization failed")?;
        let listing = manager.list_connections(None).await?;
        let groups = manager.list_groups().await?;
        let integrity = manager.verify_integrity().await;

        let output = json!({
            "init": init,
            "groups": groups,
            "connections": listing.connections,
            "problems": listing.problems,
            "integrity": integrity,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok::<(), anyhow::Error>(())
    })
}
