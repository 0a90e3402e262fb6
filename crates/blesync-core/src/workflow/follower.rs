//! 跟随端工作流
//!
//! 把协调器通知中的新值交给 [`Renderer`]：`PAGE:<n>` 跳到对应页，
//! 其他值视为文档名称。扫描收到的值和 GATT 写入都会被处理。
//!
//! 服务端在演示端选好文档前广播的是占位值（默认 `server-ready`），
//! 用 [`Follower::ignoring`] 登记后不会被当作文档打开。空值同样忽略。

use log::{debug, info};

use crate::sync::{NoticeReceiver, SyncNotice};
use crate::workflow::SyncValue;

/// 文档显示
pub trait Renderer: Send {
    fn open_document(&mut self, name: &str);
    fn jump_to(&mut self, page: u32);
    /// 当前文档页数，未打开文档时为 `None`
    fn page_count(&self) -> Option<u32>;
}

pub struct Follower<R: Renderer> {
    renderer: R,
    placeholders: Vec<String>,
}

impl<R: Renderer> Follower<R> {
    pub fn new(renderer: R) -> Self {
        Self {
            renderer,
            placeholders: Vec::new(),
        }
    }

    /// 不把 `value` 当作文档名称
    pub fn ignoring(mut self, value: impl Into<String>) -> Self {
        self.placeholders.push(value.into());
        self
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn into_renderer(self) -> R {
        self.renderer
    }

    /// 处理一个通知，返回是否改变了显示
    pub fn apply(&mut self, notice: &SyncNotice) -> bool {
        match notice {
            SyncNotice::ValueReceived(received) => self.apply_value(&received.value),
            SyncNotice::StateWritten { value, .. } => self.apply_value(value),
            _ => false,
        }
    }

    pub fn apply_value(&mut self, value: &str) -> bool {
        match SyncValue::parse(value) {
            SyncValue::Page(page) => match self.renderer.page_count() {
                Some(count) if page < count => {
                    info!("Jumping to page {}", page + 1);
                    self.renderer.jump_to(page);
                    true
                }
                Some(count) => {
                    debug!("Ignoring page {} of {}", page, count);
                    false
                }
                None => {
                    debug!("No document open, ignoring page {}", page);
                    false
                }
            },
            SyncValue::Text(name) if name.is_empty() || self.placeholders.contains(&name) => {
                debug!("Ignoring placeholder '{}'", name);
                false
            }
            SyncValue::Text(name) => {
                info!("Opening '{}'", name);
                self.renderer.open_document(&name);
                true
            }
        }
    }

    /// 一直处理通知，直到协调器退出
    pub async fn run(mut self, notices: &mut NoticeReceiver) -> R {
        while let Some(notice) = notices.recv().await {
            self.apply(&notice);
        }
        self.renderer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::PeerAddress;
    use crate::sync::ReceivedValue;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Screen {
        document: Option<String>,
        page: u32,
        pages: u32,
    }

    impl Renderer for Screen {
        fn open_document(&mut self, name: &str) {
            self.document = Some(name.to_string());
            self.page = 0;
            self.pages = 10;
        }

        fn jump_to(&mut self, page: u32) {
            self.page = page;
        }

        fn page_count(&self) -> Option<u32> {
            self.document.as_ref().map(|_| self.pages)
        }
    }

    fn received(value: &str) -> SyncNotice {
        SyncNotice::ValueReceived(ReceivedValue {
            value: value.to_string(),
            peer: PeerAddress::new("AA:BB:CC:DD:EE:01"),
            rssi: Some(-60),
        })
    }

    #[test]
    fn test_pages_need_an_open_document() {
        let mut follower = Follower::new(Screen::default());
        assert!(!follower.apply(&received("PAGE:3")));

        assert!(follower.apply(&received("slides.pdf")));
        assert!(follower.apply(&received("PAGE:3")));
        assert_eq!(follower.renderer().page, 3);

        assert!(!follower.apply(&received("PAGE:10")));
        assert_eq!(follower.renderer().page, 3);
    }

    #[test]
    fn test_gatt_writes_are_followed() {
        let mut follower = Follower::new(Screen::default());
        follower.apply(&received("slides.pdf"));
        let written = SyncNotice::StateWritten {
            peer: PeerAddress::new("AA:BB:CC:DD:EE:02"),
            value: "PAGE:7".to_string(),
        };
        assert!(follower.apply(&written));
        assert_eq!(follower.renderer().page, 7);
        assert!(!follower.apply(&SyncNotice::ScanStarted));
    }

    #[test]
    fn test_placeholder_values_are_not_opened() {
        let mut follower = Follower::new(Screen::default()).ignoring("server-ready");
        assert!(!follower.apply(&received("server-ready")));
        assert!(!follower.apply(&received("")));
        assert_eq!(follower.renderer().document, None);

        assert!(follower.apply(&received("slides.pdf")));
        assert!(follower.apply(&received("PAGE:2")));

        // 演示端回到占位值时保持当前文档
        assert!(!follower.apply(&received("server-ready")));
        assert_eq!(follower.renderer().document.as_deref(), Some("slides.pdf"));
        assert_eq!(follower.renderer().page, 2);
    }

    #[tokio::test]
    async fn test_run_until_channel_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(received("notes.pdf")).unwrap();
        tx.send(received("PAGE:4")).unwrap();
        drop(tx);

        let screen = Follower::new(Screen::default()).run(&mut rx).await;
        assert_eq!(screen.document.as_deref(), Some("notes.pdf"));
        assert_eq!(screen.page, 4);
    }
}
