//! 广播引擎（服务端角色）
//!
//! 持有当前值，把它编码后交给无线电广播。更新值时先停止旧广播，
//! 等到停止确认后再等待一小段时间，然后以新值重新开始：
//!
//! ```text
//! Active → StopPending → Settling → Starting → Active
//! ```
//!
//! 重启过程中到达的更新会合并，总是广播最新的值。

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::{AdvertiseEvent, AdvertisementPacket, EventSink, Radio};
use crate::codec::{Encoded, PayloadCodec};
use crate::config::SyncSettings;
use crate::error::{FailureCause, SyncError};
use crate::sync::{NoticeSink, Operation, Role, SyncNotice};

/// 广播阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisePhase {
    Idle,
    Starting,
    Active,
    /// 已请求停止；`restart` 表示停止确认后重新开始
    StopPending { restart: bool },
    /// 已停止，等待重启延迟结束
    Settling,
}

pub struct AdvertisingEngine {
    radio: Arc<dyn Radio>,
    sink: EventSink,
    notices: NoticeSink,
    codec: PayloadCodec,
    service_uuid: Uuid,
    vendor_id: u16,
    local_name: Option<String>,
    include_tx_power: bool,
    connectable: bool,
    settle_delay: Duration,
    retry_limit: u8,

    phase: AdvertisePhase,
    current_value: String,
    /// 最近一次提交给无线电的值
    broadcast_value: String,
    restart_after_start: bool,
    retries_left: u8,
    generation: u64,
}

impl AdvertisingEngine {
    pub fn new(
        settings: &SyncSettings,
        radio: Arc<dyn Radio>,
        sink: EventSink,
        notices: NoticeSink,
    ) -> Self {
        Self {
            radio,
            sink,
            notices,
            codec: PayloadCodec::from_settings(settings),
            service_uuid: settings.service_uuid,
            vendor_id: settings.vendor_id,
            local_name: settings.local_name(),
            include_tx_power: settings.include_tx_power,
            connectable: settings.connectable,
            settle_delay: settings.restart_settle(),
            retry_limit: settings.retry_limit,
            phase: AdvertisePhase::Idle,
            current_value: String::new(),
            broadcast_value: String::new(),
            restart_after_start: false,
            retries_left: 0,
            generation: 0,
        }
    }

    pub fn phase(&self) -> AdvertisePhase {
        self.phase
    }

    /// 只有收到无线电的启动确认后才为 `true`
    pub fn is_active(&self) -> bool {
        self.phase == AdvertisePhase::Active
    }

    pub fn is_idle(&self) -> bool {
        self.phase == AdvertisePhase::Idle
    }

    pub fn current_value(&self) -> &str {
        &self.current_value
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    /// 只记录值，不触发广播
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.current_value = value.into();
    }

    /// 开始广播
    ///
    /// 返回本次编码结果；广播在收到 [`AdvertiseEvent::Started`] 后才算生效。
    pub fn start(&mut self, value: impl Into<String>) -> Result<Encoded, SyncError> {
        if !self.is_idle() {
            return Err(SyncError::AlreadyActive(Role::Serving));
        }
        self.current_value = value.into();
        self.retries_left = self.retry_limit;
        Ok(self.request_start(true))
    }

    /// 以新值重新广播
    pub fn update(&mut self, value: impl Into<String>) {
        self.current_value = value.into();
        match self.phase {
            AdvertisePhase::Idle | AdvertisePhase::Settling => {}
            AdvertisePhase::Starting => self.restart_after_start = true,
            AdvertisePhase::Active => self.begin_restart(),
            AdvertisePhase::StopPending { .. } => {
                self.phase = AdvertisePhase::StopPending { restart: true };
            }
        }
    }

    /// 停止广播，可重复调用
    pub fn stop(&mut self) {
        self.restart_after_start = false;
        match self.phase {
            AdvertisePhase::Idle => {}
            AdvertisePhase::Settling => {
                // 无线电已经停止，只需作废定时器
                self.generation += 1;
                self.phase = AdvertisePhase::Idle;
                self.notify(SyncNotice::AdvertisingStopped);
            }
            AdvertisePhase::Starting | AdvertisePhase::Active => {
                debug!("Stopping advertising");
                self.phase = AdvertisePhase::StopPending { restart: false };
                self.radio.stop_advertising();
            }
            AdvertisePhase::StopPending { .. } => {
                self.phase = AdvertisePhase::StopPending { restart: false };
            }
        }
    }

    /// 处理广播事件，返回最终的启动失败原因
    pub fn handle_event(&mut self, event: AdvertiseEvent) -> Option<FailureCause> {
        match event {
            AdvertiseEvent::Started => {
                if self.phase != AdvertisePhase::Starting {
                    debug!("Ignoring start confirmation in phase {:?}", self.phase);
                    return None;
                }
                self.phase = AdvertisePhase::Active;
                info!("Advertising '{}'", self.broadcast_value);
                self.notify(SyncNotice::AdvertisingStarted {
                    value: self.broadcast_value.clone(),
                });
                if self.restart_after_start {
                    self.restart_after_start = false;
                    self.begin_restart();
                }
                None
            }
            AdvertiseEvent::StartFailed(cause) => {
                if self.phase != AdvertisePhase::Starting {
                    debug!("Ignoring start failure ({}) in phase {:?}", cause, self.phase);
                    return None;
                }
                if cause.is_retryable() && self.retries_left > 0 {
                    self.retries_left -= 1;
                    warn!("Advertising failed: {}, retrying once", cause);
                    self.request_start(false);
                    return None;
                }
                error!("Advertising failed: {}", cause);
                self.phase = AdvertisePhase::Idle;
                self.restart_after_start = false;
                self.notify(SyncNotice::Failed {
                    operation: Operation::Advertise,
                    cause,
                });
                Some(cause)
            }
            AdvertiseEvent::Stopped => {
                match self.phase {
                    AdvertisePhase::StopPending { restart: true } => self.settle(),
                    AdvertisePhase::StopPending { restart: false } => {
                        info!("Advertising stopped");
                        self.phase = AdvertisePhase::Idle;
                        self.notify(SyncNotice::AdvertisingStopped);
                    }
                    phase => debug!("Ignoring stop confirmation in phase {:?}", phase),
                }
                None
            }
            AdvertiseEvent::SettleElapsed(generation) => {
                if self.phase == AdvertisePhase::Settling && generation == self.generation {
                    self.retries_left = self.retry_limit;
                    self.request_start(true);
                } else {
                    debug!("Ignoring stale restart timer {}", generation);
                }
                None
            }
        }
    }

    fn begin_restart(&mut self) {
        debug!("Restarting advertising with '{}'", self.current_value);
        self.phase = AdvertisePhase::StopPending { restart: true };
        self.radio.stop_advertising();
    }

    fn settle(&mut self) {
        self.phase = AdvertisePhase::Settling;
        self.generation += 1;
        let generation = self.generation;

        if self.settle_delay.is_zero() {
            self.handle_event(AdvertiseEvent::SettleElapsed(generation));
            return;
        }

        let sink = self.sink.clone();
        let delay = self.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.emit(AdvertiseEvent::SettleElapsed(generation));
        });
    }

    fn request_start(&mut self, announce: bool) -> Encoded {
        let encoded = self.codec.encode(&self.current_value);
        if encoded.truncated && announce {
            warn!(
                "Value truncated from {} to {} bytes",
                encoded.original_len,
                encoded.len()
            );
            self.notify(SyncNotice::PayloadTruncated {
                original_len: encoded.original_len,
                sent_len: encoded.len(),
            });
        }

        let packet = AdvertisementPacket {
            service_uuid: self.service_uuid,
            vendor_id: self.vendor_id,
            payload: encoded.bytes.clone(),
            local_name: self.local_name.clone(),
            include_tx_power: self.include_tx_power,
            connectable: self.connectable,
        };
        debug!(
            "Requesting advertisement: vendor=0x{:04X}, payload={} bytes",
            self.vendor_id,
            packet.payload.len()
        );

        self.phase = AdvertisePhase::Starting;
        self.broadcast_value.clone_from(&self.current_value);
        self.radio.start_advertising(packet);
        encoded
    }

    fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice);
    }
}
