//! blesync Core Library
//!
//! 通过 BLE 广播同步一个短字符串（文档名称、页码），服务端同时提供
//! 可读写的 GATT 特征。
//!
//! # 模块
//!
//! - **codec**: 载荷编码、截断和解码
//! - **sync**: 广播引擎、扫描引擎、GATT 桥接和角色协调器
//! - **ble**: 无线电抽象、BlueZ 后端、内存后端和 GATT 客户端
//! - **workflow**: 演示端和跟随端
//! - **config**: 设置的读取和保存
//!
//! # 使用示例
//!
//! ## 服务端
//!
//! ```ignore
//! use blesync_core::{AllowAll, BluerRadio, SyncSettings, launch};
//!
//! let settings = SyncSettings::load();
//! let app = launch(settings.clone(), Arc::new(AllowAll), |sink| {
//!     BluerRadio::spawn(&settings, sink)
//! });
//! app.handle.serve("slides.pdf")?;
//! app.handle.update("PAGE:3")?;
//! ```
//!
//! ## 客户端
//!
//! ```ignore
//! app.handle.scan()?;
//! while let Some(notice) = app.notices.recv().await {
//!     if let SyncNotice::ValueReceived(received) = notice {
//!         println!("{}", received.value);
//!     }
//! }
//! ```

pub mod ble;
pub mod codec;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod permissions;
pub mod sync;
pub mod workflow;

// BLE re-exports
pub use ble::{
    BleClient, BleClientError, BluerRadio, CHARACTERISTIC_UUID, DiscoveredServer,
    MANUFACTURER_ID, MockAir, MockRadio, PeerAddress, Radio, SERVICE_UUID,
};

// Codec re-exports
pub use codec::{PayloadCodec, TruncationMode};

// Config re-exports
pub use config::{AdvertiserBackend, SyncSettings};

// Error re-exports
pub use error::{FailureCause, SyncError};

// Permission re-exports
pub use permissions::{AllowAll, Capability, PermissionGate, StaticPermissions};

// Sync re-exports
pub use sync::{
    Launched, ReceivedValue, Role, RoleCoordinator, SyncHandle, SyncNotice, SyncStatus, launch,
};

// Workflow re-exports
pub use workflow::{Document, DocumentSource, Follower, Presenter, Renderer, SyncValue};
