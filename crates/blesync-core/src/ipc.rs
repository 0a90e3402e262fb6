//! 守护进程 IPC 协议
//!
//! Unix Domain Socket 上每行一个 JSON 对象，请求和响应都以 `type` 字段区分。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::logging::LogEntry;
use crate::sync::SyncStatus;

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("blesync.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "serve")]
    Serve { value: Option<String> },
    #[serde(rename = "update")]
    Update { value: String },
    #[serde(rename = "page")]
    Page { page: u32 },
    #[serde(rename = "scan")]
    Scan,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "events")]
    Events { limit: usize },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "status")]
    Status { status: SyncStatus },
    #[serde(rename = "events")]
    Events { events: Vec<LogEntry> },
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        IpcResponse::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        IpcResponse::Error {
            message: message.into(),
        }
    }
}
