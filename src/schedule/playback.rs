use std::collections::BTreeMap;

use serde::Serialize;

use crate::xmds::{DefaultLayout, Layout};

/// Layout id of the built-in splash screen.
pub const SPLASH_LAYOUT_ID: i64 = 0;

/// File the renderer loads for the splash screen.
pub const SPLASH_FILE: &str = "0.xlf";

const SPLASH_DURATION_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopItemKind {
    Scheduled,
    Default,
    Splash,
}

/// One position in the playback loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopItem {
    pub kind: LoopItemKind,
    pub layout: Layout,
}

impl LoopItem {
    pub fn scheduled(layout: Layout) -> Self {
        Self { kind: LoopItemKind::Scheduled, layout }
    }

    pub fn default_layout(default: &DefaultLayout) -> Self {
        Self { kind: LoopItemKind::Default, layout: default.to_layout() }
    }

    pub fn splash() -> Self {
        let default = DefaultLayout {
            file: SPLASH_LAYOUT_ID,
            duration: SPLASH_DURATION_SECS,
            dependants: Vec::new(),
        };
        Self { kind: LoopItemKind::Splash, layout: default.to_layout() }
    }

    pub fn layout_id(&self) -> i64 {
        self.layout.file
    }

    pub fn is_splash(&self) -> bool {
        self.kind == LoopItemKind::Splash
    }

    pub fn hash(&self) -> String {
        match self.kind {
            LoopItemKind::Default => format!("{} (D)", self.layout.file),
            _ => self.layout.hash(),
        }
    }
}

/// Ordered, never-empty sequence of layouts to play.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackLoop {
    items: Vec<LoopItem>,
}

impl PlaybackLoop {
    pub fn splash() -> Self {
        Self::from_items(Vec::new())
    }

    /// Index the items in order. An empty list becomes the splash loop.
    pub fn from_items(items: Vec<LoopItem>) -> Self {
        let mut items = if items.is_empty() { vec![LoopItem::splash()] } else { items };
        for (i, item) in items.iter_mut().enumerate() {
            item.layout.index = i;
        }
        Self { items }
    }

    pub fn items(&self) -> &[LoopItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn layout_ids(&self) -> Vec<i64> {
        self.items.iter().map(LoopItem::layout_id).collect()
    }

    pub fn is_splash_only(&self) -> bool {
        self.items.len() == 1 && self.items[0].is_splash()
    }

    /// Human-readable summary, e.g. `12, 14 (I), 3 (D)`.
    pub fn status(&self) -> String {
        if self.is_splash_only() {
            return "Splash only".to_string();
        }
        self.items.iter().map(LoopItem::hash).collect::<Vec<_>>().join(", ")
    }
}

/// What the renderer receives for one loop position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererEntry {
    pub layout_id: i64,
    /// URL under the local file server.
    pub path: String,
    /// Library file name.
    pub short_path: String,
    /// Raw schedule attributes of the layout.
    pub response: BTreeMap<String, String>,
}

impl RendererEntry {
    pub fn splash() -> Self {
        Self {
            layout_id: SPLASH_LAYOUT_ID,
            path: SPLASH_FILE.to_string(),
            short_path: SPLASH_FILE.to_string(),
            response: BTreeMap::new(),
        }
    }
}
