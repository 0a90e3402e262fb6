//! 演示端工作流
//!
//! 1. 从 [`DocumentSource`] 选择文档
//! 2. 进入服务端角色，广播文档名称
//! 3. 翻页时广播 `PAGE:<n>`

use anyhow::{Context, bail};
use log::{debug, info};

use crate::sync::SyncHandle;
use crate::workflow::SyncValue;

/// 已选择的文档
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// 显示名称
    pub name: String,
    pub page_count: u32,
}

/// 文档来源（文件选择器）
pub trait DocumentSource: Send + Sync {
    /// 选择一个文档，用户取消时返回 `None`
    fn pick(&self) -> anyhow::Result<Option<Document>>;
}

pub struct Presenter {
    handle: SyncHandle,
    document: Option<Document>,
    current_page: u32,
    serving: bool,
}

impl Presenter {
    pub fn new(handle: SyncHandle) -> Self {
        Self {
            handle,
            document: None,
            current_page: 0,
            serving: false,
        }
    }

    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn is_serving(&self) -> bool {
        self.serving
    }

    /// 打开文档并回到第一页；正在广播时改为广播新文档名称
    pub fn open(&mut self, document: Document) -> anyhow::Result<()> {
        info!(
            "Opened '{}' ({} pages)",
            document.name, document.page_count
        );
        if self.serving {
            self.handle.update(document.name.clone())?;
        }
        self.document = Some(document);
        self.current_page = 0;
        Ok(())
    }

    /// 从来源选择文档，返回是否选择了文档
    pub fn open_from(&mut self, source: &dyn DocumentSource) -> anyhow::Result<bool> {
        match source.pick().context("Failed to pick document")? {
            Some(document) => {
                self.open(document)?;
                Ok(true)
            }
            None => {
                debug!("Document selection cancelled");
                Ok(false)
            }
        }
    }

    /// 开始广播文档名称
    pub fn start(&mut self) -> anyhow::Result<()> {
        let Some(document) = &self.document else {
            bail!("No document selected");
        };
        self.handle.serve(document.name.clone())?;
        self.serving = true;
        Ok(())
    }

    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.handle.stop()?;
        self.serving = false;
        Ok(())
    }

    /// 跳到指定页，越界时返回 `false`
    pub fn go_to_page(&mut self, page: u32) -> anyhow::Result<bool> {
        let Some(document) = &self.document else {
            bail!("No document selected");
        };
        if page >= document.page_count {
            debug!(
                "Page {} out of range (0..{})",
                page, document.page_count
            );
            return Ok(false);
        }

        self.current_page = page;
        if self.serving {
            self.handle.update(SyncValue::Page(page).to_string())?;
        }
        Ok(true)
    }

    pub fn next_page(&mut self) -> anyhow::Result<bool> {
        self.go_to_page(self.current_page.saturating_add(1))
    }

    pub fn previous_page(&mut self) -> anyhow::Result<bool> {
        match self.current_page.checked_sub(1) {
            Some(page) => self.go_to_page(page),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::MockRadio;
    use crate::config::SyncSettings;
    use crate::permissions::AllowAll;
    use crate::sync::{Launched, SyncNotice, launch};
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedSource(Option<Document>);

    impl DocumentSource for FixedSource {
        fn pick(&self) -> anyhow::Result<Option<Document>> {
            Ok(self.0.clone())
        }
    }

    fn slides() -> Document {
        Document {
            name: "slides.pdf".to_string(),
            page_count: 3,
        }
    }

    async fn wait_for_value(app: &mut Launched<MockRadio>, value: &str) {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), app.notices.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(&notice, SyncNotice::AdvertisingStarted { value: v } if v == value) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_start_requires_document() {
        let app = launch(SyncSettings::default(), Arc::new(AllowAll), MockRadio::new);
        let mut presenter = Presenter::new(app.handle.clone());
        assert!(presenter.start().is_err());
        assert!(presenter.go_to_page(0).is_err());

        assert!(!presenter.open_from(&FixedSource(None)).unwrap());
        assert!(presenter.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_navigation_is_broadcast() {
        let mut app = launch(SyncSettings::default(), Arc::new(AllowAll), MockRadio::new);
        let mut presenter = Presenter::new(app.handle.clone());
        assert!(presenter.open_from(&FixedSource(Some(slides()))).unwrap());
        presenter.start().unwrap();
        wait_for_value(&mut app, "slides.pdf").await;

        assert!(presenter.next_page().unwrap());
        wait_for_value(&mut app, "PAGE:1").await;
        assert_eq!(presenter.current_page(), 1);

        assert!(presenter.go_to_page(2).unwrap());
        assert!(!presenter.next_page().unwrap());
        assert_eq!(presenter.current_page(), 2);
        wait_for_value(&mut app, "PAGE:2").await;
    }

    #[tokio::test]
    async fn test_navigation_bounds() {
        let app = launch(SyncSettings::default(), Arc::new(AllowAll), MockRadio::new);
        let mut presenter = Presenter::new(app.handle.clone());
        presenter.open(slides()).unwrap();

        assert!(!presenter.previous_page().unwrap());
        assert!(!presenter.go_to_page(3).unwrap());
        assert!(presenter.next_page().unwrap());
        assert!(presenter.previous_page().unwrap());
        assert_eq!(presenter.current_page(), 0);

        // 未开始广播时翻页不触发无线电请求
        app.handle.status().await.unwrap();
        assert!(app.radio.calls().is_empty());
    }
}
