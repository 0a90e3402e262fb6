//! blesync Daemon
//!
//! 后台守护进程，负责：
//! - 在本地 BlueZ 适配器上运行角色协调器
//! - 记录同步事件
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use blesync_core::SyncSettings;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（blesync-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,blesync_core=debug")),
        )
        .try_init();

    tracing::info!("blesync daemon starting...");

    let settings = SyncSettings::load();
    let (service, mut service_handle) = service::Service::start(settings);

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(service.clone()));

    // 等待任一任务完成
    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        res = &mut service_handle => {
            tracing::error!("Core service exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            if service.handle.shutdown().is_ok() {
                let _ = service_handle.await;
            }
        }
    }

    let _ = std::fs::remove_file(blesync_core::ipc::socket_path());
    Ok(())
}
