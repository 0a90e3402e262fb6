//! 独立模式 - 不经过守护进程，直接使用本机适配器

use anyhow::{Context, Result, bail, ensure};
use blesync_core::sync::NoticeReceiver;
use blesync_core::{
    BleClient, BluerRadio, Document, DocumentSource, Follower, Launched, Presenter, Renderer,
    StaticPermissions, SyncNotice, SyncSettings, launch,
};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn discover(settings: &SyncSettings, timeout: Duration) -> Result<()> {
    let client = BleClient::new(settings).await?;
    println!("🔍 Scanning ({}s)...", timeout.as_secs());
    let servers = client.discover(timeout).await?;
    if servers.is_empty() {
        println!("   No servers found");
    }
    for (i, server) in servers.iter().enumerate() {
        let signal = server
            .signal()
            .map(|s| format!(" [{}]", s.name()))
            .unwrap_or_default();
        println!(
            "   [{}] {} {}{} -> {}",
            i,
            server.address,
            server.name.as_deref().unwrap_or("(unnamed)"),
            signal,
            server.value.as_deref().unwrap_or("?")
        );
    }
    Ok(())
}

pub async fn read(settings: &SyncSettings, device: Option<&str>, timeout: Duration) -> Result<()> {
    let client = BleClient::new(settings).await?;
    let connection = client.connect(device, timeout).await?;
    let value = connection.read_state().await?;
    println!("📖 {}: {}", connection.address(), value);
    connection.disconnect().await?;
    Ok(())
}

pub async fn write(
    settings: &SyncSettings,
    value: &str,
    device: Option<&str>,
    with_response: bool,
    timeout: Duration,
) -> Result<()> {
    let client = BleClient::new(settings).await?;
    let connection = client.connect(device, timeout).await?;
    let written = connection.write_state(value, with_response).await?;
    if written != value {
        println!("⚠️  Value truncated to '{}'", written);
    }
    println!("✅ Wrote '{}' to {}", written, connection.address());
    connection.disconnect().await?;
    Ok(())
}

pub async fn follow(
    settings: &SyncSettings,
    device: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    let client = BleClient::new(settings).await?;
    let connection = client.connect(device, timeout).await?;
    println!("📡 {}: {}", connection.address(), connection.read_state().await?);

    let mut values = connection.follow().await?;
    loop {
        tokio::select! {
            value = values.next() => match value {
                Some(value) => println!("📡 {}", value),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    drop(values);
    connection.disconnect().await?;
    Ok(())
}

/// 本地文件作为文档来源
struct FileSource {
    path: PathBuf,
    pages: u32,
}

impl DocumentSource for FileSource {
    fn pick(&self) -> Result<Option<Document>> {
        ensure!(self.path.exists(), "{} does not exist", self.path.display());
        let name = self
            .path
            .file_name()
            .context("Path has no file name")?
            .to_string_lossy()
            .to_string();
        Ok(Some(Document {
            name,
            page_count: self.pages,
        }))
    }
}

fn start(settings: &SyncSettings) -> Launched<BluerRadio> {
    let permissions = Arc::new(StaticPermissions::new(settings.capabilities.iter().copied()));
    let radio_settings = settings.clone();
    launch(settings.clone(), permissions, move |sink| {
        BluerRadio::spawn(&radio_settings, sink)
    })
}

fn print_notices(mut notices: NoticeReceiver) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            println!("{}", notice.to_log_entry());
        }
    })
}

/// 演示端：广播文档名称，从标准输入翻页
pub async fn present(settings: &SyncSettings, path: PathBuf, pages: u32) -> Result<()> {
    let Launched {
        handle,
        notices,
        task,
        ..
    } = start(settings);
    let printer = print_notices(notices);

    let mut presenter = Presenter::new(handle.clone());
    if !presenter.open_from(&FileSource { path, pages })? {
        bail!("No document selected");
    }
    presenter.start()?;
    println!("Commands: n = next, p = previous, <number> = go to page, q = quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let moved = match line.trim() {
            "q" => break,
            "n" | "" => presenter.next_page()?,
            "p" => presenter.previous_page()?,
            other => match other.parse::<u32>() {
                Ok(page) if page > 0 => presenter.go_to_page(page - 1)?,
                _ => {
                    println!("Unknown command '{}'", other);
                    continue;
                }
            },
        };
        if moved {
            println!("📄 Page {}/{}", presenter.current_page() + 1, pages);
        }
    }

    presenter.stop()?;
    handle.shutdown()?;
    task.await?;
    printer.await?;
    Ok(())
}

/// 只打印的文档显示
struct TerminalRenderer {
    document: Option<String>,
    pages: u32,
}

impl Renderer for TerminalRenderer {
    fn open_document(&mut self, name: &str) {
        println!("📂 {}", name);
        self.document = Some(name.to_string());
    }

    fn jump_to(&mut self, page: u32) {
        if let Some(document) = &self.document {
            println!("📄 {} page {}/{}", document, page + 1, self.pages);
        }
    }

    fn page_count(&self) -> Option<u32> {
        self.document.as_ref().map(|_| self.pages)
    }
}

/// 跟随端：扫描并显示收到的文档和页码
pub async fn listen(settings: &SyncSettings, pages: u32) -> Result<()> {
    let Launched {
        handle,
        mut notices,
        task,
        ..
    } = start(settings);
    let mut follower = Follower::new(TerminalRenderer {
        document: None,
        pages,
    })
    .ignoring(settings.initial_value.clone());

    handle.scan()?;
    println!("👂 Listening, Ctrl+C to stop");
    loop {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                if !follower.apply(&notice) && !matches!(notice, SyncNotice::ValueReceived(_)) {
                    println!("{}", notice.to_log_entry());
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // 协调器可能已经退出
    let _ = handle.shutdown();
    task.await?;
    Ok(())
}
