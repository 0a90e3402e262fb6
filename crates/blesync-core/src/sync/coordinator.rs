//! 角色协调器
//!
//! 同一时刻只允许一个角色：
//!
//! ```text
//! Idle ⇄ Serving      (广播 + GATT 服务)
//! Idle ⇄ Scanning     (被动扫描)
//! ```
//!
//! 切换时先停止当前角色的所有活动，等无线电确认全部停止后才进入新角色。

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::ble::{EventInbox, EventSink, GattEvent, Radio};
use crate::config::SyncSettings;
use crate::error::FailureCause;
use crate::permissions::{self, Capability, PermissionGate};
use crate::sync::{
    AdvertisingEngine, Command, GattBridge, NoticeReceiver, NoticeSink, Operation, Role,
    ScanningEngine, SyncEvent, SyncNotice, SyncStatus,
};

/// 等待进入的角色
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Serve(String),
    Scan,
}

impl Target {
    fn role(&self) -> Role {
        match self {
            Target::Serve(_) => Role::Serving,
            Target::Scan => Role::Scanning,
        }
    }

    fn operation(&self) -> Operation {
        match self {
            Target::Serve(_) => Operation::Serve,
            Target::Scan => Operation::Scan,
        }
    }

    fn capabilities(&self, connectable: bool) -> &'static [Capability] {
        match self {
            Target::Serve(_) if connectable => &[Capability::Advertise, Capability::Connect],
            Target::Serve(_) => &[Capability::Advertise],
            Target::Scan => &[Capability::Scan],
        }
    }
}

pub struct RoleCoordinator {
    settings: SyncSettings,
    permissions: Arc<dyn PermissionGate>,
    inbox: EventInbox,
    notices: NoticeSink,
    role: Role,
    pending: Option<Target>,
    advertising: AdvertisingEngine,
    scanning: ScanningEngine,
    gatt: GattBridge,
}

impl RoleCoordinator {
    pub fn new(
        settings: SyncSettings,
        radio: Arc<dyn Radio>,
        permissions: Arc<dyn PermissionGate>,
        sink: EventSink,
        inbox: EventInbox,
    ) -> (Self, NoticeReceiver) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let mut advertising =
            AdvertisingEngine::new(&settings, radio.clone(), sink, notices.clone());
        advertising.set_value(settings.initial_value.clone());
        let scanning = ScanningEngine::new(&settings, radio.clone(), notices.clone());
        let gatt = GattBridge::new(&settings, radio, notices.clone());

        let coordinator = Self {
            settings,
            permissions,
            inbox,
            notices,
            role: Role::Idle,
            pending: None,
            advertising,
            scanning,
            gatt,
        };
        (coordinator, notice_rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn advertising(&self) -> &AdvertisingEngine {
        &self.advertising
    }

    pub fn scanning(&self) -> &ScanningEngine {
        &self.scanning
    }

    pub fn gatt(&self) -> &GattBridge {
        &self.gatt
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            role: self.role,
            advertising: self.advertising.is_active(),
            scanning: self.scanning.is_active(),
            gatt_open: self.gatt.is_open(),
            current_value: self.advertising.current_value().to_string(),
            last_received: self.scanning.last_delivered().cloned(),
            connected_peers: self.gatt.peers(),
            payload_limit: self.settings.payload_limit(),
        }
    }

    /// 事件循环，收到 [`Command::Shutdown`] 后退出
    pub async fn run(mut self) {
        info!("Role coordinator running");
        while let Some(event) = self.inbox.recv().await {
            if !self.dispatch(event).await {
                break;
            }
        }
        info!("Role coordinator stopped");
    }

    /// 处理一个事件，返回 `false` 表示应当退出
    pub async fn dispatch(&mut self, event: SyncEvent) -> bool {
        match event {
            SyncEvent::Command(command) => match command {
                Command::Serve(Some(value)) => self.serve(value).await,
                Command::Serve(None) => self.switch_to(Role::Serving).await,
                Command::Update(value) => self.update(value),
                Command::Scan => self.switch_to(Role::Scanning).await,
                Command::Stop => self.switch_to(Role::Idle).await,
                Command::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown => {
                    self.stop();
                    return false;
                }
            },
            SyncEvent::Advertise(event) => {
                if self.advertising.handle_event(event).is_some() && self.role == Role::Serving {
                    warn!("Advertising could not start, leaving serving role");
                    self.gatt.close();
                    self.set_role(Role::Idle);
                }
            }
            SyncEvent::Scan(event) => {
                let failure = self.scanning.handle_event(event);
                if self.role == Role::Scanning && self.scanning.is_idle() {
                    if failure.is_none() {
                        warn!("Scan session ended, leaving scanning role");
                    }
                    self.set_role(Role::Idle);
                }
            }
            SyncEvent::Gatt(event) => self.handle_gatt(event),
        }
        self.advance_pending();
        true
    }

    /// 切换到指定角色
    ///
    /// 进入 `Serving` 时广播当前值（没有则使用配置的初始值）。
    pub async fn switch_to(&mut self, role: Role) {
        match role {
            Role::Idle => self.stop(),
            Role::Serving => {
                let value = match self.advertising.current_value() {
                    "" => self.settings.initial_value.clone(),
                    value => value.to_string(),
                };
                self.serve(value).await;
            }
            Role::Scanning => self.request(Target::Scan).await,
        }
    }

    /// 以 `value` 进入服务端角色
    pub async fn serve(&mut self, value: String) {
        self.request(Target::Serve(value)).await;
    }

    /// 停止所有活动，可重复调用
    pub fn stop(&mut self) {
        self.pending = None;
        self.teardown();
    }

    async fn request(&mut self, target: Target) {
        let operation = target.operation();
        let capabilities = target.capabilities(self.settings.connectable);
        if let Err(e) = permissions::require(self.permissions.as_ref(), capabilities).await {
            warn!("{} refused: {}", operation, e);
            self.notify(SyncNotice::Failed {
                operation,
                cause: e.cause(),
            });
            return;
        }

        if self.role == target.role() {
            warn!("{} role already active", self.role);
            self.notify(SyncNotice::Failed {
                operation,
                cause: FailureCause::AlreadyActive,
            });
            return;
        }

        self.teardown();
        debug!("Switching to {}", target.role());
        self.pending = Some(target);
        self.advance_pending();
    }

    fn update(&mut self, value: String) {
        if self.role == Role::Serving {
            self.advertising.update(value);
            self.gatt.notify_value(self.advertising.current_value());
        } else if let Some(Target::Serve(pending)) = &mut self.pending {
            *pending = value;
        } else {
            debug!("Not serving, keeping '{}' for the next broadcast", value);
            self.advertising.set_value(value);
        }
    }

    fn handle_gatt(&mut self, event: GattEvent) {
        match event {
            GattEvent::Read {
                peer,
                offset,
                mtu,
                reply,
            } => {
                let result = self
                    .gatt
                    .read(&peer, offset, mtu, self.advertising.current_value());
                let _ = reply.send(result);
            }
            GattEvent::Write {
                peer,
                data,
                with_response,
                reply,
            } => match self.gatt.write(&peer, &data) {
                Ok(value) => {
                    let _ = reply.send(Ok(()));
                    debug!(
                        "Applying write from {} (with_response={})",
                        peer, with_response
                    );
                    self.advertising.update(value.clone());
                    self.gatt.notify_value(&value);
                    self.notify(SyncNotice::StateWritten { peer, value });
                }
                Err(status) => {
                    let _ = reply.send(Err(status));
                }
            },
            other => {
                if let Some(cause) = self.gatt.handle_event(other) {
                    warn!("GATT server unavailable ({}), broadcasting only", cause);
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.advertising.stop();
        self.gatt.close();
        self.scanning.stop();
        self.set_role(Role::Idle);
    }

    /// 旧角色全部停止后进入等待中的角色
    fn advance_pending(&mut self) {
        if !self.is_quiet() {
            return;
        }
        let Some(target) = self.pending.take() else {
            return;
        };
        match target {
            Target::Serve(value) => self.enter_serving(value),
            Target::Scan => self.enter_scanning(),
        }
    }

    fn is_quiet(&self) -> bool {
        self.advertising.is_idle() && self.gatt.is_closed() && self.scanning.is_idle()
    }

    fn enter_serving(&mut self, value: String) {
        self.set_role(Role::Serving);
        if self.settings.connectable {
            self.gatt.open();
        }
        if let Err(e) = self.advertising.start(value) {
            error!("Failed to start advertising: {}", e);
            self.notify(SyncNotice::Failed {
                operation: Operation::Serve,
                cause: e.cause(),
            });
            self.teardown();
        }
    }

    fn enter_scanning(&mut self) {
        self.set_role(Role::Scanning);
        if let Err(e) = self.scanning.start() {
            error!("Failed to start scan: {}", e);
            self.notify(SyncNotice::Failed {
                operation: Operation::Scan,
                cause: e.cause(),
            });
            self.teardown();
        }
    }

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            info!("Role: {} -> {}", self.role, role);
            self.role = role;
            self.notify(SyncNotice::RoleChanged(role));
        }
    }

    fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{AdvertiseEvent, ScanEvent, event_channel};
    use crate::ble::mock::{MockRadio, RadioCall};
    use crate::permissions::{AllowAll, StaticPermissions};
    use crate::sync::{Launched, launch};
    use std::time::Duration;

    fn start(settings: SyncSettings, permissions: Arc<dyn PermissionGate>) -> Launched<MockRadio> {
        launch(settings, permissions, MockRadio::new)
    }

    /// 不启动事件循环的协调器，无线电事件由测试逐个分发
    fn manual_coordinator() -> (RoleCoordinator, Arc<MockRadio>) {
        let (sink, inbox) = event_channel();
        let radio = Arc::new(MockRadio::manual(sink.clone()));
        let (coordinator, _notices) = RoleCoordinator::new(
            SyncSettings::default(),
            radio.clone(),
            Arc::new(AllowAll),
            sink,
            inbox,
        );
        (coordinator, radio)
    }

    fn started_scan(radio: &MockRadio) -> bool {
        radio.calls().iter().any(|c| matches!(c, RadioCall::StartScan(_)))
    }

    /// 收集通知直到满足条件，返回期间收到的所有通知
    async fn collect_until(
        notices: &mut NoticeReceiver,
        done: impl Fn(&SyncNotice) -> bool,
    ) -> Vec<SyncNotice> {
        let mut seen = Vec::new();
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
                .await
                .expect("timed out waiting for notice")
                .expect("notice channel closed");
            let finished = done(&notice);
            seen.push(notice);
            if finished {
                return seen;
            }
        }
    }

    fn is_advertising(value: &str) -> impl Fn(&SyncNotice) -> bool + '_ {
        move |n| matches!(n, SyncNotice::AdvertisingStarted { value: v } if v == value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_opens_gatt_and_advertises() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.handle.serve("report.pdf").unwrap();
        let seen = collect_until(&mut app.notices, is_advertising("report.pdf")).await;
        assert!(seen.contains(&SyncNotice::RoleChanged(Role::Serving)));

        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Serving);
        assert!(status.advertising);
        assert!(status.gatt_open);
        assert_eq!(status.current_value, "report.pdf");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_stays_idle() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.handle.serve("a").unwrap();
        collect_until(&mut app.notices, is_advertising("a")).await;

        app.handle.stop().unwrap();
        assert_eq!(app.handle.status().await.unwrap().role, Role::Idle);
        app.handle.stop().unwrap();
        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Idle);
        assert!(!status.advertising);

        // 空闲状态下停止不会产生任何无线电请求
        let calls = app.radio.take_calls();
        app.handle.stop().unwrap();
        app.handle.status().await.unwrap();
        assert!(!calls.is_empty());
        assert!(app.radio.take_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_stops_advertising_before_scanning() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.handle.serve("a").unwrap();
        collect_until(&mut app.notices, is_advertising("a")).await;
        app.radio.take_calls();

        app.handle.scan().unwrap();
        let seen = collect_until(&mut app.notices, |n| *n == SyncNotice::ScanStarted).await;

        let stopped = seen
            .iter()
            .position(|n| *n == SyncNotice::AdvertisingStopped)
            .expect("advertising never stopped");
        let closed = seen
            .iter()
            .position(|n| *n == SyncNotice::GattClosed)
            .expect("GATT server never closed");
        let scanning = seen.len() - 1;
        assert!(stopped < scanning);
        assert!(closed < scanning);

        let calls = app.radio.take_calls();
        let stop_at = calls.iter().position(|c| *c == RadioCall::StopAdvertising).unwrap();
        let scan_at = calls
            .iter()
            .position(|c| matches!(c, RadioCall::StartScan(_)))
            .unwrap();
        assert!(stop_at < scan_at);

        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Scanning);
        assert!(status.scanning);
        assert!(!status.advertising);
        assert!(!status.gatt_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_permission_never_touches_radio() {
        let permissions = StaticPermissions::new([Capability::Scan]);
        let mut app = start(SyncSettings::default(), Arc::new(permissions));

        app.handle.serve("a").unwrap();
        let failed = |n: &SyncNotice| matches!(n, SyncNotice::Failed { .. });
        let seen = collect_until(&mut app.notices, failed).await;
        assert_eq!(
            seen.last(),
            Some(&SyncNotice::Failed {
                operation: Operation::Serve,
                cause: FailureCause::PermissionDenied
            })
        );
        assert!(app.radio.calls().is_empty());
        assert_eq!(app.handle.status().await.unwrap().role, Role::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_only_server_needs_no_connect_permission() {
        let settings = SyncSettings {
            connectable: false,
            ..Default::default()
        };
        let permissions = StaticPermissions::new([Capability::Advertise]);
        let mut app = start(settings, Arc::new(permissions));

        app.handle.serve("a").unwrap();
        collect_until(&mut app.notices, is_advertising("a")).await;
        assert!(!app.handle.status().await.unwrap().gatt_open);
        assert!(
            !app.radio
                .calls()
                .iter()
                .any(|c| matches!(c, RadioCall::OpenGattServer(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertise_failure_leaves_idle() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.radio.fail_next_advertise(FailureCause::PayloadTooLarge);

        app.handle.serve("a").unwrap();
        let seen = collect_until(&mut app.notices, |n| *n == SyncNotice::GattClosed).await;
        assert!(seen.contains(&SyncNotice::Failed {
            operation: Operation::Advertise,
            cause: FailureCause::PayloadTooLarge
        }));

        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Idle);
        assert!(!status.gatt_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_while_serving_is_rejected() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.handle.serve("a").unwrap();
        collect_until(&mut app.notices, is_advertising("a")).await;

        app.handle.serve("b").unwrap();
        let failed = |n: &SyncNotice| matches!(n, SyncNotice::Failed { .. });
        let seen = collect_until(&mut app.notices, failed).await;
        assert_eq!(
            seen.last(),
            Some(&SyncNotice::Failed {
                operation: Operation::Serve,
                cause: FailureCause::AlreadyActive
            })
        );
        assert_eq!(app.handle.status().await.unwrap().current_value, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gatt_write_restarts_broadcast() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.handle.serve("PAGE:0").unwrap();
        collect_until(&mut app.notices, is_advertising("PAGE:0")).await;
        app.radio.take_calls();

        app.radio.write("AA:BB:CC:DD:EE:FF", b"PAGE:5").await.unwrap();
        let seen = collect_until(&mut app.notices, is_advertising("PAGE:5")).await;
        assert!(seen.contains(&SyncNotice::StateWritten {
            peer: crate::ble::PeerAddress::new("AA:BB:CC:DD:EE:FF"),
            value: "PAGE:5".to_string()
        }));

        assert_eq!(app.handle.status().await.unwrap().current_value, "PAGE:5");

        let calls = app.radio.take_calls();
        let stop_at = calls.iter().position(|c| *c == RadioCall::StopAdvertising).unwrap();
        let start_at = calls
            .iter()
            .position(|c| matches!(c, RadioCall::StartAdvertising(p) if p.payload == b"PAGE:5"))
            .unwrap();
        assert!(stop_at < start_at);
        assert!(calls.contains(&RadioCall::NotifyValue(b"PAGE:5".to_vec())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gatt_read_sees_latest_value() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        let name = "A rather long document name.pdf";
        app.handle.serve(name).unwrap();
        collect_until(&mut app.notices, is_advertising(name)).await;

        let data = app.radio.read("AA:BB:CC:DD:EE:FF", 0).await.unwrap();
        assert_eq!(data, name.as_bytes());

        app.handle.update("PAGE:2").unwrap();
        let data = app.radio.read("AA:BB:CC:DD:EE:FF", 0).await.unwrap();
        assert_eq!(data, b"PAGE:2");

        let status = app.handle.status().await.unwrap();
        assert_eq!(status.connected_peers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_while_idle_is_served_later() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.handle.update("PAGE:9").unwrap();
        assert_eq!(app.handle.status().await.unwrap().current_value, "PAGE:9");
        assert!(app.radio.calls().is_empty());

        app.handle.scan().unwrap();
        collect_until(&mut app.notices, |n| *n == SyncNotice::ScanStarted).await;
        assert_eq!(app.handle.status().await.unwrap().role, Role::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_leaves_idle() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.radio.fail_next_scan(FailureCause::Unsupported);

        app.handle.scan().unwrap();
        let idle = |n: &SyncNotice| *n == SyncNotice::RoleChanged(Role::Idle);
        let seen = collect_until(&mut app.notices, idle).await;
        assert!(seen.contains(&SyncNotice::Failed {
            operation: Operation::Scan,
            cause: FailureCause::Unsupported
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_stops_scanning_before_advertising() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.handle.scan().unwrap();
        collect_until(&mut app.notices, |n| *n == SyncNotice::ScanStarted).await;
        app.radio.take_calls();

        app.handle.serve("a").unwrap();
        let seen = collect_until(&mut app.notices, is_advertising("a")).await;
        let stopped = seen
            .iter()
            .position(|n| *n == SyncNotice::ScanStopped)
            .expect("scan never stopped");
        let serving = seen
            .iter()
            .position(|n| *n == SyncNotice::RoleChanged(Role::Serving))
            .expect("never entered serving role");
        assert!(stopped < serving);

        let calls = app.radio.take_calls();
        assert_eq!(calls.first(), Some(&RadioCall::StopScan));
        assert_eq!(calls.iter().filter(|c| **c == RadioCall::StopScan).count(), 1);

        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Serving);
        assert!(!status.scanning);
        assert!(status.advertising);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gatt_failure_keeps_broadcasting() {
        let mut app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.radio.fail_next_gatt(FailureCause::Internal);

        app.handle.serve("a").unwrap();
        let seen = collect_until(&mut app.notices, is_advertising("a")).await;
        assert!(seen.contains(&SyncNotice::Failed {
            operation: Operation::GattServer,
            cause: FailureCause::Internal
        }));

        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Serving);
        assert!(status.advertising);
        assert!(!status.gatt_open);

        // 没有 GATT 服务时停止也不会等待关闭确认
        app.handle.stop().unwrap();
        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Idle);
        assert!(!status.advertising);
        assert!(!app.radio.calls().contains(&RadioCall::CloseGattServer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_after_rejected_scan_stop() {
        let app = launch(SyncSettings::default(), Arc::new(AllowAll), MockRadio::manual);
        app.handle.scan().unwrap();
        app.handle.serve("a").unwrap();
        assert_eq!(app.handle.status().await.unwrap().role, Role::Idle);

        // 扫描尚未确认启动就被停止，随后适配器拒绝了这次启动
        app.radio.emit(ScanEvent::StartFailed(FailureCause::Internal));
        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Serving);
        assert!(!status.scanning);

        let calls = app.radio.take_calls();
        assert!(matches!(calls[0], RadioCall::StartScan(_)));
        assert_eq!(calls[1], RadioCall::StopScan);
        assert!(calls[2..].iter().any(|c| matches!(c, RadioCall::StartAdvertising(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_session_ended_by_radio() {
        let mut app = launch(SyncSettings::default(), Arc::new(AllowAll), MockRadio::manual);
        app.handle.scan().unwrap();
        app.radio.emit(ScanEvent::Started);
        collect_until(&mut app.notices, |n| *n == SyncNotice::ScanStarted).await;

        // 发现流中断，没有经过 stop_scan
        app.radio.emit(ScanEvent::Stopped);
        let idle = |n: &SyncNotice| *n == SyncNotice::RoleChanged(Role::Idle);
        let seen = collect_until(&mut app.notices, idle).await;
        assert!(seen.contains(&SyncNotice::ScanStopped));
        let status = app.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Idle);
        assert!(!status.scanning);

        app.radio.take_calls();
        app.handle.serve("a").unwrap();
        assert_eq!(app.handle.status().await.unwrap().role, Role::Serving);
        let calls = app.radio.take_calls();
        assert!(!calls.contains(&RadioCall::StopScan));
        assert!(calls.iter().any(|c| matches!(c, RadioCall::StartAdvertising(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_to_waits_for_stop_confirmations() {
        let (mut coordinator, radio) = manual_coordinator();
        coordinator.switch_to(Role::Serving).await;
        coordinator.dispatch(GattEvent::Opened.into()).await;
        coordinator.dispatch(AdvertiseEvent::Started.into()).await;
        assert_eq!(coordinator.role(), Role::Serving);
        assert!(coordinator.advertising().is_active());
        assert_eq!(coordinator.status().current_value, "server-ready");

        coordinator.switch_to(Role::Scanning).await;
        assert!(!coordinator.advertising().is_active());
        assert!(!coordinator.scanning().is_active());
        assert_eq!(coordinator.role(), Role::Idle);

        // 广播停止了，但 GATT 服务还没关闭
        coordinator.dispatch(AdvertiseEvent::Stopped.into()).await;
        assert!(!started_scan(&radio));
        coordinator.dispatch(GattEvent::Closed.into()).await;
        assert!(started_scan(&radio));
        assert!(!coordinator.scanning().is_active());

        coordinator.dispatch(ScanEvent::Started.into()).await;
        assert!(coordinator.scanning().is_active());
        assert!(!coordinator.advertising().is_active());
        assert_eq!(coordinator.role(), Role::Scanning);

        coordinator.switch_to(Role::Idle).await;
        coordinator.dispatch(ScanEvent::Stopped.into()).await;
        assert_eq!(coordinator.role(), Role::Idle);
        assert!(coordinator.scanning().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_event_loop() {
        let app = start(SyncSettings::default(), Arc::new(AllowAll));
        app.handle.shutdown().unwrap();
        app.task.await.unwrap();
        assert!(app.handle.status().await.is_err());
    }
}
