// Typed view of the CMS schedule document.
//
// A `Schedule` is an immutable snapshot: the engine replaces it wholesale
// whenever a new one arrives.

use std::collections::BTreeMap;

use roxmltree::Node;
use serde::Serialize;
use time::PrimitiveDateTime;

use super::response::{
    attr, attr_flag, attr_i64, child, children, extract_payload, parse_doc, parse_purge, text_of,
    PurgeItem,
};
use super::XmdsMethod;
use crate::clock::parse_cms_date;
use crate::error::XmdsError;

/// A single scheduling criterion (`<criteria metric condition type>value</criteria>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Criteria {
    pub metric: String,
    pub condition: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

fn parse_criteria(node: Node<'_, '_>) -> Vec<Criteria> {
    children(node, "criteria")
        .map(|c| Criteria {
            metric: attr(c, "metric").to_string(),
            condition: attr(c, "condition").to_string(),
            kind: attr(c, "type").to_string(),
            value: text_of(c).trim().to_string(),
        })
        .collect()
}

fn attrs_of(node: Node<'_, '_>) -> BTreeMap<String, String> {
    node.attributes()
        .map(|a| (a.name().to_string(), a.value().to_string()))
        .collect()
}

fn dependant_files(node: Node<'_, '_>, wrapper: &str) -> Vec<String> {
    children(node, wrapper)
        .flat_map(|d| children(d, "file").map(|f| text_of(f).trim().to_string()))
        .filter(|f| !f.is_empty())
        .collect()
}

fn nested<'a, 'i>(root: Node<'a, 'i>, wrapper: &str, item: &'a str) -> Vec<Node<'a, 'i>> {
    child(root, wrapper)
        .map(|w| children(w, item).collect())
        .unwrap_or_default()
}

/// A scheduled layout event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layout {
    /// Layout id (the CMS calls it `file`).
    pub file: i64,
    /// Seconds.
    pub duration: u64,
    pub priority: i64,
    /// 0 for normal layouts; > 0 marks an interrupt.
    pub share_of_voice: u64,
    pub max_plays_per_hour: u32,
    pub from_dt: String,
    pub to_dt: String,
    pub is_geo_aware: bool,
    pub geo_location: String,
    pub criteria: Vec<Criteria>,
    pub schedule_id: i64,
    pub cycle_playback: bool,
    pub group_key: i64,
    pub play_count: i64,
    pub sync_event: bool,
    /// Every attribute as sent, handed to the renderer untouched.
    pub response: BTreeMap<String, String>,
    /// Seconds allocated to this layout in the hour being woven.
    #[serde(skip)]
    pub interrupt_committed_duration: u64,
    /// Position in the emitted loop.
    pub index: usize,
}

impl Layout {
    fn from_node(n: Node<'_, '_>) -> Self {
        Self {
            file: attr_i64(n, "file"),
            duration: attr(n, "duration").trim().parse().unwrap_or(0),
            priority: attr_i64(n, "priority"),
            share_of_voice: attr(n, "shareOfVoice").trim().parse().unwrap_or(0),
            max_plays_per_hour: attr(n, "maxPlaysPerHour").trim().parse().unwrap_or(0),
            from_dt: attr(n, "fromdt").to_string(),
            to_dt: attr(n, "todt").to_string(),
            is_geo_aware: attr_flag(n, "isGeoAware"),
            geo_location: attr(n, "geoLocation").to_string(),
            criteria: parse_criteria(n),
            schedule_id: attr_i64(n, "scheduleid"),
            cycle_playback: attr_flag(n, "cyclePlayback"),
            group_key: attr_i64(n, "groupKey"),
            play_count: attr_i64(n, "playCount"),
            sync_event: attr_flag(n, "syncEvent"),
            response: attrs_of(n),
            interrupt_committed_duration: 0,
            index: 0,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.share_of_voice > 0
    }

    pub fn has_criteria(&self) -> bool {
        !self.criteria.is_empty()
    }

    pub fn from(&self) -> Option<PrimitiveDateTime> {
        parse_cms_date(&self.from_dt)
    }

    pub fn to(&self) -> Option<PrimitiveDateTime> {
        parse_cms_date(&self.to_dt)
    }

    /// `now` inside `[fromDt, toDt)`. Unparseable bounds never match.
    pub fn is_current(&self, now: PrimitiveDateTime) -> bool {
        match (self.from(), self.to()) {
            (Some(from), Some(to)) => from <= now && now < to,
            _ => false,
        }
    }

    /// Short identity used in status lines, e.g. `12` or `12 (I)`.
    pub fn hash(&self) -> String {
        if self.is_interrupt() {
            format!("{} (I)", self.file)
        } else {
            self.file.to_string()
        }
    }
}

/// Schedule-level fallback layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DefaultLayout {
    pub file: i64,
    pub duration: u64,
    pub dependants: Vec<String>,
}

impl DefaultLayout {
    fn from_node(n: Node<'_, '_>) -> Self {
        let mut dependants = dependant_files(n, "dependants");
        dependants.extend(dependant_files(n, "dependents"));
        Self {
            file: attr_i64(n, "file"),
            duration: attr(n, "duration").trim().parse().unwrap_or(0),
            dependants,
        }
    }

    /// A default layout is usable when it points at a real layout id.
    pub fn is_valid(&self) -> bool {
        self.file > 0
    }

    pub fn hash(&self) -> String {
        format!("{} (D)", self.file)
    }

    /// The default as a normal-pool layout (always current, priority 0).
    pub fn to_layout(&self) -> Layout {
        let mut response = BTreeMap::new();
        response.insert("file".to_string(), self.file.to_string());
        response.insert("duration".to_string(), self.duration.to_string());
        Layout {
            file: self.file,
            duration: self.duration,
            priority: 0,
            share_of_voice: 0,
            max_plays_per_hour: 0,
            from_dt: String::new(),
            to_dt: String::new(),
            is_geo_aware: false,
            geo_location: String::new(),
            criteria: Vec::new(),
            schedule_id: 0,
            cycle_playback: false,
            group_key: 0,
            play_count: 0,
            sync_event: false,
            response,
            interrupt_committed_duration: 0,
            index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayLayout {
    pub file: i64,
    pub duration: u64,
    pub priority: i64,
    pub from_dt: String,
    pub to_dt: String,
    pub is_geo_aware: bool,
    pub geo_location: String,
    pub schedule_id: i64,
    pub criteria: Vec<Criteria>,
}

impl OverlayLayout {
    fn from_node(n: Node<'_, '_>) -> Self {
        Self {
            file: attr_i64(n, "file"),
            duration: attr(n, "duration").trim().parse().unwrap_or(0),
            priority: attr_i64(n, "priority"),
            from_dt: attr(n, "fromdt").to_string(),
            to_dt: attr(n, "todt").to_string(),
            is_geo_aware: attr_flag(n, "isGeoAware"),
            geo_location: attr(n, "geoLocation").to_string(),
            schedule_id: attr_i64(n, "scheduleid"),
            criteria: parse_criteria(n),
        }
    }
}

/// Interactive action (trigger code bound to a layout or command).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub action_type: String,
    pub command_code: String,
    pub layout_code: String,
    pub trigger_code: String,
    pub duration: u64,
    pub priority: i64,
    pub from_dt: String,
    pub to_dt: String,
    pub is_geo_aware: bool,
    pub geo_location: String,
    pub schedule_id: i64,
    pub criteria: Vec<Criteria>,
}

impl Action {
    fn from_node(n: Node<'_, '_>) -> Self {
        Self {
            action_type: attr(n, "actionType").to_string(),
            command_code: attr(n, "commandCode").to_string(),
            layout_code: attr(n, "layoutCode").to_string(),
            trigger_code: attr(n, "triggerCode").to_string(),
            duration: attr(n, "duration").trim().parse().unwrap_or(0),
            priority: attr_i64(n, "priority"),
            from_dt: attr(n, "fromdt").to_string(),
            to_dt: attr(n, "todt").to_string(),
            is_geo_aware: attr_flag(n, "isGeoAware"),
            geo_location: attr(n, "geoLocation").to_string(),
            schedule_id: attr_i64(n, "scheduleid"),
            criteria: parse_criteria(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataConnector {
    pub data_set_id: i64,
    pub data_params: String,
    pub js: String,
    pub duration: u64,
    pub priority: i64,
    pub from_dt: String,
    pub to_dt: String,
    pub is_geo_aware: bool,
    pub geo_location: String,
    pub schedule_id: i64,
    pub criteria: Vec<Criteria>,
}

impl DataConnector {
    fn from_node(n: Node<'_, '_>) -> Self {
        Self {
            data_set_id: attr_i64(n, "dataSetId"),
            data_params: attr(n, "dataParams").to_string(),
            js: attr(n, "js").to_string(),
            duration: attr(n, "duration").trim().parse().unwrap_or(0),
            priority: attr_i64(n, "priority"),
            from_dt: attr(n, "fromdt").to_string(),
            to_dt: attr(n, "todt").to_string(),
            is_geo_aware: attr_flag(n, "isGeoAware"),
            geo_location: attr(n, "geoLocation").to_string(),
            schedule_id: attr_i64(n, "scheduleid"),
            criteria: parse_criteria(n),
        }
    }
}

/// Scheduled command to run on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    pub code: Option<String>,
    pub date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Schedule {
    pub generated: String,
    pub filter_from: String,
    pub filter_to: String,
    pub default_layout: Option<DefaultLayout>,
    pub layouts: Vec<Layout>,
    pub overlays: Vec<OverlayLayout>,
    pub actions: Vec<Action>,
    pub data_connectors: Vec<DataConnector>,
    pub dependants: Vec<String>,
    pub command: Option<Command>,
    pub purge: Vec<PurgeItem>,
}

impl Schedule {
    /// Parse a full `Schedule` SOAP response.
    pub fn parse(body: &str) -> Result<Self, XmdsError> {
        let inner = extract_payload(body, XmdsMethod::Schedule, "ScheduleXml")?;
        Self::parse_schedule(&inner)
    }

    /// Parse the decoded `<schedule>` document.
    pub fn parse_schedule(xml: &str) -> Result<Self, XmdsError> {
        let doc = parse_doc(xml)?;
        let root = doc.root_element();
        if root.tag_name().name() != "schedule" {
            return Err(XmdsError::Malformed(format!(
                "expected <schedule>, got <{}>",
                root.tag_name().name()
            )));
        }

        let command = child(root, "command").map(|c| Command {
            code: c
                .attribute("command")
                .or_else(|| c.attribute("code"))
                .map(str::to_string)
                .filter(|s| !s.is_empty()),
            date: attr(c, "date").to_string(),
        });

        Ok(Self {
            generated: attr(root, "generated").to_string(),
            filter_from: attr(root, "filterFrom").to_string(),
            filter_to: attr(root, "filterTo").to_string(),
            default_layout: child(root, "default").map(DefaultLayout::from_node),
            layouts: children(root, "layout").map(Layout::from_node).collect(),
            overlays: nested(root, "overlays", "overlay").into_iter().map(OverlayLayout::from_node).collect(),
            actions: nested(root, "actions", "action").into_iter().map(Action::from_node).collect(),
            data_connectors: nested(root, "dataConnectors", "connector")
                .into_iter()
                .map(DataConnector::from_node)
                .collect(),
            dependants: dependant_files(root, "dependants"),
            command,
            purge: parse_purge(root),
        })
    }

    /// True when there is nothing to resolve at all.
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty() && self.default_layout.is_none()
    }
}
