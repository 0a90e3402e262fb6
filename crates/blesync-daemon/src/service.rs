//! Core Service - 协调器与事件日志

use blesync_core::ble::EventSink;
use blesync_core::logging::{EventJournal, LogEntry, LogLevel};
use blesync_core::sync::NoticeReceiver;
use blesync_core::{
    BluerRadio, Launched, PermissionGate, Radio, StaticPermissions, SyncHandle, SyncSettings,
    launch,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// 守护进程持有的共享状态
pub struct Service {
    pub handle: SyncHandle,
    journal: Arc<Mutex<EventJournal>>,
}

impl Service {
    /// 在本地 BlueZ 适配器上启动协调器
    pub fn start(settings: SyncSettings) -> (Arc<Self>, JoinHandle<()>) {
        let radio_settings = settings.clone();
        Self::start_with(settings, move |sink| {
            BluerRadio::spawn(&radio_settings, sink)
        })
    }

    pub fn start_with<R, F>(settings: SyncSettings, make_radio: F) -> (Arc<Self>, JoinHandle<()>)
    where
        R: Radio + 'static,
        F: FnOnce(EventSink) -> R,
    {
        tracing::info!(
            "Starting coordinator: device={}, backend={:?}, hci{}",
            settings.device_name,
            settings.backend,
            settings.controller_index
        );
        let permissions: Arc<dyn PermissionGate> =
            Arc::new(StaticPermissions::new(settings.capabilities.iter().copied()));
        let journal = Arc::new(Mutex::new(EventJournal::new(settings.journal_capacity)));

        let Launched {
            handle,
            notices,
            task,
            ..
        } = launch(settings, permissions, make_radio);

        let recorder = tokio::spawn(record_notices(notices, journal.clone()));
        let service = Arc::new(Self { handle, journal });

        // 协调器退出后通知通道关闭，记录任务随之结束
        let joined = tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::error!("Coordinator task failed: {}", e);
            }
            let _ = recorder.await;
        });
        (service, joined)
    }

    pub fn recent_events(&self, limit: usize) -> Vec<LogEntry> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(limit)
    }
}

async fn record_notices(mut notices: NoticeReceiver, journal: Arc<Mutex<EventJournal>>) {
    while let Some(notice) = notices.recv().await {
        let entry = notice.to_log_entry();
        match entry.level {
            LogLevel::Error => tracing::error!("{}", entry.message),
            LogLevel::Warn => tracing::warn!("{}", entry.message),
            LogLevel::Info => tracing::info!("{}", entry.message),
            LogLevel::Debug => tracing::debug!("{}", entry.message),
        }
        journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
    tracing::info!("Notice channel closed");
}
