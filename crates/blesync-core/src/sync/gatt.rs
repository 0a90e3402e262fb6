//! GATT 桥接
//!
//! 一个服务、一个特征（读/写/通知），给已连接的对端提供与广播并行的
//! 同步通道：读取返回当前值的完整编码（不受广播容量限制），写入则按
//! 广播的截断规则成为新的当前值。
//!
//! 每个对端的状态：
//!
//! ```text
//! Disconnected → Connected → {Reading | Writing}* → Disconnected
//! ```

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ble::{GattEvent, GattServiceSpec, GattStatus, PeerAddress, Radio};
use crate::codec::{self, PayloadCodec};
use crate::config::SyncSettings;
use crate::error::FailureCause;
use crate::sync::{NoticeSink, Operation, SyncNotice};

/// ATT 读响应的头部开销
const ATT_READ_OVERHEAD: usize = 1;

/// GATT 服务阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattPhase {
    Closed,
    Opening,
    Open,
    Closing,
}

/// 对端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Reading,
    Writing,
}

#[derive(Debug, Clone)]
struct PeerSession {
    state: PeerState,
    reads: u32,
    writes: u32,
}

pub struct GattBridge {
    radio: Arc<dyn Radio>,
    notices: NoticeSink,
    service: GattServiceSpec,
    read_codec: PayloadCodec,
    write_codec: PayloadCodec,
    phase: GattPhase,
    peers: BTreeMap<PeerAddress, PeerSession>,
}

impl GattBridge {
    pub fn new(settings: &SyncSettings, radio: Arc<dyn Radio>, notices: NoticeSink) -> Self {
        Self {
            radio,
            notices,
            service: GattServiceSpec {
                service_uuid: settings.service_uuid,
                characteristic_uuid: settings.characteristic_uuid,
            },
            read_codec: PayloadCodec::unbounded(),
            write_codec: PayloadCodec::from_settings(settings),
            phase: GattPhase::Closed,
            peers: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> GattPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == GattPhase::Open
    }

    pub fn is_closed(&self) -> bool {
        self.phase == GattPhase::Closed
    }

    pub fn peers(&self) -> Vec<PeerAddress> {
        self.peers.keys().cloned().collect()
    }

    pub fn peer_state(&self, peer: &PeerAddress) -> Option<PeerState> {
        self.peers.get(peer).map(|session| session.state)
    }

    /// (读次数, 写次数)
    pub fn peer_stats(&self, peer: &PeerAddress) -> Option<(u32, u32)> {
        self.peers
            .get(peer)
            .map(|session| (session.reads, session.writes))
    }

    pub fn open(&mut self) {
        if self.phase != GattPhase::Closed {
            debug!("GATT server already {:?}", self.phase);
            return;
        }
        debug!(
            "Opening GATT server: service={}, characteristic={}",
            self.service.service_uuid, self.service.characteristic_uuid
        );
        self.phase = GattPhase::Opening;
        self.radio.open_gatt_server(self.service);
    }

    /// 关闭服务，可重复调用
    pub fn close(&mut self) {
        match self.phase {
            GattPhase::Closed | GattPhase::Closing => {}
            GattPhase::Opening | GattPhase::Open => {
                debug!("Closing GATT server");
                self.phase = GattPhase::Closing;
                self.radio.close_gatt_server();
                self.drop_peers();
            }
        }
    }

    /// 处理连接和服务生命周期事件，返回打开失败的原因
    pub fn handle_event(&mut self, event: GattEvent) -> Option<FailureCause> {
        match event {
            GattEvent::Opened => {
                if self.phase == GattPhase::Opening {
                    info!("GATT server ready");
                    self.phase = GattPhase::Open;
                    self.notify(SyncNotice::GattOpened);
                }
                None
            }
            GattEvent::OpenFailed(cause) => {
                if self.phase != GattPhase::Opening {
                    return None;
                }
                warn!("GATT server failed to open: {}", cause);
                self.phase = GattPhase::Closed;
                self.notify(SyncNotice::Failed {
                    operation: Operation::GattServer,
                    cause,
                });
                Some(cause)
            }
            GattEvent::Closed => {
                if self.phase != GattPhase::Closed {
                    info!("GATT server closed");
                    self.phase = GattPhase::Closed;
                    self.drop_peers();
                    self.notify(SyncNotice::GattClosed);
                }
                None
            }
            GattEvent::Connected(peer) => {
                if self.is_open() {
                    self.ensure_connected(&peer);
                }
                None
            }
            GattEvent::Disconnected(peer) => {
                if self.peers.remove(&peer).is_some() {
                    info!("Peer disconnected: {}", peer);
                    self.notify(SyncNotice::PeerDisconnected(peer));
                }
                None
            }
            GattEvent::Read { reply, .. } => {
                let _ = reply.send(Err(GattStatus::NotPermitted));
                None
            }
            GattEvent::Write { reply, .. } => {
                let _ = reply.send(Err(GattStatus::NotPermitted));
                None
            }
        }
    }

    /// 读取：返回 `value` 的完整编码，从 `offset` 开始，不超过 MTU
    pub fn read(
        &mut self,
        peer: &PeerAddress,
        offset: usize,
        mtu: Option<u16>,
        value: &str,
    ) -> Result<Vec<u8>, GattStatus> {
        if !self.is_open() {
            return Err(GattStatus::NotPermitted);
        }
        self.ensure_connected(peer);
        self.set_state(peer, PeerState::Reading);

        let encoded = self.read_codec.encode(value);
        debug!(
            "Characteristic read by {}: offset={}, data_len={}",
            peer,
            offset,
            encoded.len()
        );
        let mut chunk = if offset >= encoded.len() {
            Vec::new()
        } else {
            encoded.bytes[offset..].to_vec()
        };
        if let Some(mtu) = mtu {
            chunk.truncate(usize::from(mtu).saturating_sub(ATT_READ_OVERHEAD).max(1));
        }

        if let Some(session) = self.peers.get_mut(peer) {
            session.reads += 1;
            session.state = PeerState::Connected;
        }
        Ok(chunk)
    }

    /// 写入：解码并按广播规则截断，返回新的当前值
    pub fn write(&mut self, peer: &PeerAddress, data: &[u8]) -> Result<String, GattStatus> {
        if !self.is_open() {
            return Err(GattStatus::NotPermitted);
        }
        self.ensure_connected(peer);
        self.set_state(peer, PeerState::Writing);

        let result = match codec::try_decode(data) {
            Ok(text) => {
                let value = self.write_codec.clamp(&text);
                if value.len() < text.len() {
                    warn!(
                        "Write from {} truncated from {} to {} bytes",
                        peer,
                        text.len(),
                        value.len()
                    );
                }
                info!("Characteristic written by {}: '{}'", peer, value);
                Ok(value)
            }
            Err(e) => {
                warn!("Rejecting write from {}: {}", peer, e);
                Err(GattStatus::Failed)
            }
        };

        if let Some(session) = self.peers.get_mut(peer) {
            if result.is_ok() {
                session.writes += 1;
            }
            session.state = PeerState::Connected;
        }
        result
    }

    /// 把新值推送给已订阅的对端
    pub fn notify_value(&self, value: &str) {
        if self.is_open() {
            self.radio
                .notify_value(self.read_codec.encode(value).bytes);
        }
    }

    fn ensure_connected(&mut self, peer: &PeerAddress) {
        if self.peers.contains_key(peer) {
            return;
        }
        info!("Peer connected: {}", peer);
        self.peers.insert(
            peer.clone(),
            PeerSession {
                state: PeerState::Connected,
                reads: 0,
                writes: 0,
            },
        );
        self.notify(SyncNotice::PeerConnected(peer.clone()));
    }

    fn set_state(&mut self, peer: &PeerAddress, state: PeerState) {
        if let Some(session) = self.peers.get_mut(peer) {
            session.state = state;
        }
    }

    fn drop_peers(&mut self) {
        for peer in std::mem::take(&mut self.peers).into_keys() {
            self.notify(SyncNotice::PeerDisconnected(peer));
        }
    }

    fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::event_channel;
    use crate::ble::mock::{MockRadio, RadioCall};
    use crate::sync::NoticeReceiver;
    use tokio::sync::{mpsc, oneshot};

    fn open_bridge() -> (GattBridge, Arc<MockRadio>, NoticeReceiver) {
        let (sink, _inbox) = event_channel();
        let radio = Arc::new(MockRadio::manual(sink));
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let mut bridge = GattBridge::new(&SyncSettings::default(), radio.clone(), notice_tx);
        bridge.open();
        bridge.handle_event(GattEvent::Opened);
        assert_eq!(notice_rx.try_recv().unwrap(), SyncNotice::GattOpened);
        radio.take_calls();
        (bridge, radio, notice_rx)
    }

    fn peer() -> PeerAddress {
        PeerAddress::new("11:22:33:44:55:66")
    }

    #[test]
    fn test_read_returns_full_current_value() {
        let (mut bridge, _radio, _notices) = open_bridge();
        let long = "Quarterly report final version.pdf";

        let data = bridge.read(&peer(), 0, None, long).unwrap();
        assert_eq!(data, long.as_bytes());

        let tail = bridge.read(&peer(), 10, None, long).unwrap();
        assert_eq!(tail, &long.as_bytes()[10..]);

        assert!(bridge.read(&peer(), 100, None, long).unwrap().is_empty());
        assert_eq!(bridge.peer_stats(&peer()), Some((3, 0)));
        assert_eq!(bridge.peer_state(&peer()), Some(PeerState::Connected));
    }

    #[test]
    fn test_read_respects_mtu() {
        let (mut bridge, _radio, _notices) = open_bridge();
        let data = bridge.read(&peer(), 0, Some(23), &"x".repeat(40)).unwrap();
        assert_eq!(data.len(), 22);
    }

    #[test]
    fn test_write_is_clamped_like_the_broadcast() {
        let (mut bridge, _radio, mut notices) = open_bridge();
        let value = bridge.write(&peer(), b"Hello from Android!").unwrap();
        assert_eq!(value, "Hello from Android");
        assert_eq!(
            notices.try_recv().unwrap(),
            SyncNotice::PeerConnected(peer())
        );
        assert_eq!(bridge.peer_stats(&peer()), Some((0, 1)));
    }

    #[test]
    fn test_invalid_write_is_rejected() {
        let (mut bridge, _radio, _notices) = open_bridge();
        assert_eq!(bridge.write(&peer(), &[0xFF, 0xFE]), Err(GattStatus::Failed));
        assert_eq!(bridge.peer_stats(&peer()), Some((0, 0)));
        assert_eq!(bridge.peer_state(&peer()), Some(PeerState::Connected));
    }

    #[test]
    fn test_requests_rejected_when_closed() {
        let (sink, _inbox) = event_channel();
        let radio = Arc::new(MockRadio::manual(sink));
        let (notice_tx, _notice_rx) = mpsc::unbounded_channel();
        let mut bridge = GattBridge::new(&SyncSettings::default(), radio, notice_tx);

        assert_eq!(bridge.read(&peer(), 0, None, "x"), Err(GattStatus::NotPermitted));
        assert_eq!(bridge.write(&peer(), b"x"), Err(GattStatus::NotPermitted));

        let (reply, mut rx) = oneshot::channel();
        bridge.handle_event(GattEvent::Write {
            peer: peer(),
            data: b"x".to_vec(),
            with_response: true,
            reply,
        });
        assert_eq!(rx.try_recv().unwrap(), Err(GattStatus::NotPermitted));
    }

    #[test]
    fn test_close_disconnects_peers() {
        let (mut bridge, radio, mut notices) = open_bridge();
        bridge.handle_event(GattEvent::Connected(peer()));
        assert_eq!(bridge.peers(), vec![peer()]);

        bridge.close();
        bridge.close();
        assert_eq!(radio.take_calls(), vec![RadioCall::CloseGattServer]);
        assert!(bridge.peers().is_empty());

        bridge.handle_event(GattEvent::Closed);
        assert!(bridge.is_closed());

        let received: Vec<_> = std::iter::from_fn(|| notices.try_recv().ok()).collect();
        assert_eq!(
            received,
            vec![
                SyncNotice::PeerConnected(peer()),
                SyncNotice::PeerDisconnected(peer()),
                SyncNotice::GattClosed,
            ]
        );
    }

    #[test]
    fn test_notify_only_when_open() {
        let (mut bridge, radio, _notices) = open_bridge();
        bridge.notify_value("PAGE:7");
        assert_eq!(radio.take_calls(), vec![RadioCall::NotifyValue(b"PAGE:7".to_vec())]);

        bridge.close();
        radio.take_calls();
        bridge.notify_value("PAGE:8");
        assert!(radio.take_calls().is_empty());
    }
}
