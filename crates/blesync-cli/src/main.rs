//! blesync CLI
//!
//! 命令行客户端：
//! - 通过 Unix Socket 控制守护进程
//! - 直接连接服务端读写特征
//! - 在本进程中运行演示端或跟随端

mod client;
mod standalone;

use anyhow::Result;
use blesync_core::SyncSettings;
use blesync_core::ipc::{IpcRequest, IpcResponse};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blesync", version, about = "BLE 广播状态同步工具")]
struct Cli {
    /// 输出详细日志
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 进入服务端角色 (守护进程)
    Serve {
        /// 广播的值，默认沿用当前值
        value: Option<String>,
    },
    /// 更新广播的值 (守护进程)
    Update { value: String },
    /// 广播页码 (守护进程，从 0 开始)
    Page { page: u32 },
    /// 进入客户端角色 (守护进程)
    Scan,
    /// 停止当前角色 (守护进程)
    Stop,
    /// 查看当前状态 (守护进程)
    Status,
    /// 查看最近的事件 (守护进程)
    Events {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// 扫描附近的服务端
    Discover {
        /// 扫描超时时间 (秒)
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
    /// 连接服务端并读取当前值
    Read {
        /// 服务端地址 (可选，不指定则连接第一个发现的服务端)
        #[arg(short, long)]
        device: Option<String>,
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
    /// 连接服务端并写入新值
    Write {
        value: String,
        #[arg(short, long)]
        device: Option<String>,
        /// 使用无响应写入
        #[arg(long)]
        no_response: bool,
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
    /// 订阅服务端的值变化
    Follow {
        #[arg(short, long)]
        device: Option<String>,
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
    /// 演示文档，从标准输入翻页
    Present {
        /// 文档路径
        file: PathBuf,
        /// 文档页数
        #[arg(short, long)]
        pages: u32,
    },
    /// 跟随演示端
    Listen {
        /// 本地文档页数
        #[arg(short, long, default_value = "100")]
        pages: u32,
    },
    /// 查看或保存设置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印当前设置
    Show,
    /// 打印配置文件路径
    Path,
    /// 把当前设置（含默认值）写入配置文件
    Save,
}

fn init_logging(verbose: bool) {
    let _ = tracing_log::LogTracer::init();
    let default_filter = if verbose {
        "info,blesync_core=debug"
    } else {
        "warn"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = SyncSettings::load();
    init_logging(cli.verbose || settings.verbose);

    match cli.command {
        Commands::Serve { value } => {
            client::send_request(IpcRequest::Serve { value }).await?;
        }
        Commands::Update { value } => {
            client::send_request(IpcRequest::Update { value }).await?;
        }
        Commands::Page { page } => {
            client::send_request(IpcRequest::Page { page }).await?;
        }
        Commands::Scan => {
            client::send_request(IpcRequest::Scan).await?;
        }
        Commands::Stop => {
            client::send_request(IpcRequest::Stop).await?;
        }
        Commands::Status => {
            let resp = client::send_request(IpcRequest::Status).await?;
            if let IpcResponse::Status { status } = resp {
                println!("Role:        {}", status.role);
                println!("Value:       {}", status.current_value);
                println!("Advertising: {}", status.advertising);
                println!("Scanning:    {}", status.scanning);
                println!(
                    "GATT:        {} ({} peer(s))",
                    if status.gatt_open { "open" } else { "closed" },
                    status.connected_peers.len()
                );
                println!("Limit:       {} bytes", status.payload_limit);
                if let Some(received) = status.last_received {
                    println!("Received:    {} from {}", received.value, received.peer);
                }
            }
        }
        Commands::Events { limit } => {
            let resp = client::send_request(IpcRequest::Events { limit }).await?;
            if let IpcResponse::Events { events } = resp {
                if events.is_empty() {
                    println!("   No events");
                }
                for event in events {
                    println!("{}", event);
                }
            }
        }
        Commands::Discover { timeout } => {
            standalone::discover(&settings, Duration::from_secs(timeout)).await?;
        }
        Commands::Read { device, timeout } => {
            standalone::read(&settings, device.as_deref(), Duration::from_secs(timeout)).await?;
        }
        Commands::Write {
            value,
            device,
            no_response,
            timeout,
        } => {
            standalone::write(
                &settings,
                &value,
                device.as_deref(),
                !no_response,
                Duration::from_secs(timeout),
            )
            .await?;
        }
        Commands::Follow { device, timeout } => {
            standalone::follow(&settings, device.as_deref(), Duration::from_secs(timeout)).await?;
        }
        Commands::Present { file, pages } => {
            standalone::present(&settings, file, pages).await?;
        }
        Commands::Listen { pages } => {
            standalone::listen(&settings, pages).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", settings.to_toml()?),
            ConfigAction::Path => println!("{}", SyncSettings::config_path().display()),
            ConfigAction::Save => {
                settings.save()?;
                println!("✅ Saved to {}", SyncSettings::config_path().display());
            }
        },
    }

    Ok(())
}
