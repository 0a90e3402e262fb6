//! IPC Server - Unix Domain Socket 通信

use anyhow::Result;
use blesync_core::SyncValue;
use blesync_core::ipc::{IpcRequest, IpcResponse, socket_path};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::service::Service;

pub async fn run_ipc_server(service: Arc<Service>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC server listening on {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, &service).await {
                        tracing::debug!("Client connection closed: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, service: &Service) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                tracing::debug!("Request: {:?}", request);
                dispatch(request, service).await
            }
            Err(e) => IpcResponse::error(format!("Invalid request: {}", e)),
        };

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
        line.clear();
    }

    Ok(())
}

/// 把请求转发给协调器
///
/// 命令只是入队，执行结果记录在事件日志中。
pub async fn dispatch(request: IpcRequest, service: &Service) -> IpcResponse {
    let handle = &service.handle;
    let result = match request {
        IpcRequest::Status => {
            return match handle.status().await {
                Ok(status) => IpcResponse::Status { status },
                Err(e) => IpcResponse::error(e.to_string()),
            };
        }
        IpcRequest::Events { limit } => {
            return IpcResponse::Events {
                events: service.recent_events(limit),
            };
        }
        IpcRequest::Serve { value: Some(value) } => {
            tracing::info!("Serve '{}'", value);
            handle.serve(value).map(|()| "Serving")
        }
        IpcRequest::Serve { value: None } => {
            tracing::info!("Serve current value");
            handle.serve_current().map(|()| "Serving")
        }
        IpcRequest::Update { value } => {
            tracing::info!("Update '{}'", value);
            handle.update(value).map(|()| "Value updated")
        }
        IpcRequest::Page { page } => {
            let value = SyncValue::Page(page).to_string();
            tracing::info!("Update '{}'", value);
            handle.update(value).map(|()| "Page updated")
        }
        IpcRequest::Scan => {
            tracing::info!("Scan");
            handle.scan().map(|()| "Scanning")
        }
        IpcRequest::Stop => {
            tracing::info!("Stop");
            handle.stop().map(|()| "Stopped")
        }
    };

    match result {
        Ok(message) => IpcResponse::ok(message),
        Err(e) => IpcResponse::error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blesync_core::{MockRadio, Role, SyncSettings};
    use std::time::Duration;

    async fn wait_for_role(service: &Service, role: Role) {
        for _ in 0..100 {
            if service.handle.status().await.unwrap().role == role {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("role never became {}", role);
    }

    #[tokio::test]
    async fn test_serve_page_and_status() {
        let (service, _task) = Service::start_with(SyncSettings::default(), MockRadio::new);

        let response = dispatch(IpcRequest::Serve { value: None }, &service).await;
        assert_eq!(response, IpcResponse::ok("Serving"));
        wait_for_role(&service, Role::Serving).await;

        dispatch(IpcRequest::Page { page: 4 }, &service).await;
        let IpcResponse::Status { status } = dispatch(IpcRequest::Status, &service).await else {
            panic!("expected status");
        };
        assert_eq!(status.current_value, "PAGE:4");
    }

    #[tokio::test]
    async fn test_events_are_journaled() {
        let (service, _task) = Service::start_with(SyncSettings::default(), MockRadio::new);
        dispatch(IpcRequest::Serve { value: Some("slides.pdf".into()) }, &service).await;
        wait_for_role(&service, Role::Serving).await;

        let mut messages = Vec::new();
        for _ in 0..100 {
            let IpcResponse::Events { events } =
                dispatch(IpcRequest::Events { limit: 10 }, &service).await
            else {
                panic!("expected events");
            };
            messages = events.into_iter().map(|e| e.message).collect();
            if messages.iter().any(|m| m == "Advertising: slides.pdf") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("advertising not journaled: {:?}", messages);
    }

    #[tokio::test]
    async fn test_stop_after_shutdown_is_an_error() {
        let (service, task) = Service::start_with(SyncSettings::default(), MockRadio::new);
        service.handle.shutdown().unwrap();
        task.await.unwrap();

        let response = dispatch(IpcRequest::Stop, &service).await;
        assert!(matches!(response, IpcResponse::Error { .. }));
    }
}
