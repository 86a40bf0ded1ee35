use std::collections::HashMap;

use roxmltree::{Document, Node};
use serde::Serialize;

use super::XmdsMethod;
use crate::error::XmdsError;

/// Longest slice of a raw body we keep inside `XmdsError::Malformed`.
const MAX_RAW_ERROR_LEN: usize = 512;

// --- Envelope helpers -----------------------------------------------------

pub(crate) fn parse_doc(xml: &str) -> Result<Document<'_>, XmdsError> {
    Document::parse(xml.trim()).map_err(|e| XmdsError::Malformed(format!("{e}: {}", clip(xml))))
}

fn clip(raw: &str) -> String {
    if raw.len() <= MAX_RAW_ERROR_LEN {
        return raw.to_string();
    }
    let mut end = MAX_RAW_ERROR_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

pub(crate) fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|n| n.is_element() && n.tag_name().name() == name)
}

pub(crate) fn children<'a, 'i>(
    node: Node<'a, 'i>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'i>> + 'a {
    node.children().filter(move |n| n.is_element() && n.tag_name().name() == name)
}

/// Concatenated text of a node's direct text children (entities decoded).
pub(crate) fn text_of(node: Node<'_, '_>) -> String {
    node.children().filter(|n| n.is_text()).filter_map(|n| n.text()).collect()
}

pub(crate) fn attr<'a>(node: Node<'a, '_>, name: &str) -> &'a str {
    node.attribute(name).unwrap_or("")
}

pub(crate) fn attr_i64(node: Node<'_, '_>, name: &str) -> i64 {
    attr(node, name).trim().parse().unwrap_or(0)
}

pub(crate) fn attr_opt_i64(node: Node<'_, '_>, name: &str) -> Option<i64> {
    attr(node, name).trim().parse().ok()
}

pub(crate) fn attr_flag(node: Node<'_, '_>, name: &str) -> bool {
    attr(node, name).trim() == "1"
}

fn fault_in(doc: &Document<'_>) -> Option<XmdsError> {
    let fault = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Fault")?;
    let code = child(fault, "faultcode").map(text_of).unwrap_or_default();
    let message = child(fault, "faultstring").map(text_of).unwrap_or_default();
    Some(XmdsError::from_fault(code.trim(), message.trim()))
}

/// Turn an error body (non-2xx) into the most specific error we can.
pub fn error_from_body(body: &str) -> XmdsError {
    match Document::parse(body.trim()) {
        Ok(doc) => fault_in(&doc).unwrap_or_else(|| XmdsError::Malformed(clip(body))),
        Err(_) if body.trim() == crate::error::NOT_AUTHORISED_MSG => {
            XmdsError::NotAuthorized(body.trim().to_string())
        }
        Err(_) => XmdsError::Malformed(clip(body)),
    }
}

/// Pull the text of `{Method}Response/{field}` out of a SOAP response.
pub fn extract_payload(body: &str, method: XmdsMethod, field: &str) -> Result<String, XmdsError> {
    let doc = parse_doc(body)?;
    if let Some(fault) = fault_in(&doc) {
        return Err(fault);
    }

    let wrapper_name = method.response_element();
    let wrapper = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == wrapper_name)
        .ok_or_else(|| XmdsError::Malformed(format!("missing {wrapper_name}: {}", clip(body))))?;
    let node = child(wrapper, field)
        .ok_or_else(|| XmdsError::Malformed(format!("missing {wrapper_name}/{field}")))?;

    Ok(text_of(node))
}

/// `SubmitLog`/`SubmitStats` only count as delivered on an explicit `true`.
pub fn parse_success(body: &str, method: XmdsMethod) -> Result<bool, XmdsError> {
    let text = extract_payload(body, method, "success")?;
    Ok(text.trim().eq_ignore_ascii_case("true") || text.trim() == "1")
}

// --- RegisterDisplay ------------------------------------------------------

/// Authorisation state of this display as last reported by the CMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisplayStatus {
    Unregistered,
    AwaitingAuthorization,
    Ready,
}

impl DisplayStatus {
    pub fn from_code(status: i64) -> Self {
        match status {
            0 => DisplayStatus::Ready,
            1 | 2 => DisplayStatus::AwaitingAuthorization,
            _ => DisplayStatus::Unregistered,
        }
    }

    /// Numeric form used in NotifyStatus.
    pub fn code(self) -> i64 {
        match self {
            DisplayStatus::Ready => 0,
            DisplayStatus::AwaitingAuthorization => 1,
            DisplayStatus::Unregistered => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDisplay {
    pub status: i64,
    pub code: String,
    pub message: String,
    pub check_schedule: String,
    pub check_rf: String,
    pub date: String,
    pub timezone: String,
    pub version_instructions: String,
    /// Settings child nodes, keyed by lower-cased element name.
    settings: HashMap<String, String>,
}

impl RegisterDisplay {
    pub fn parse(body: &str) -> Result<Self, XmdsError> {
        let inner = extract_payload(body, XmdsMethod::RegisterDisplay, "ActivationMessage")?;
        Self::parse_activation(&inner)
    }

    /// Parse the decoded `<display .../>` document.
    pub fn parse_activation(xml: &str) -> Result<Self, XmdsError> {
        let doc = parse_doc(xml)?;
        let display = doc.root_element();
        if display.tag_name().name() != "display" {
            return Err(XmdsError::Malformed(format!(
                "expected <display>, got <{}>",
                display.tag_name().name()
            )));
        }

        let settings = display
            .children()
            .filter(|n| n.is_element())
            .map(|n| (n.tag_name().name().to_ascii_lowercase(), text_of(n).trim().to_string()))
            .collect();

        Ok(Self {
            status: attr_i64(display, "status"),
            code: attr(display, "code").to_string(),
            message: attr(display, "message").to_string(),
            check_schedule: attr(display, "checkSchedule").to_string(),
            check_rf: attr(display, "checkRf").to_string(),
            date: attr(display, "date").to_string(),
            timezone: attr(display, "timezone").to_string(),
            version_instructions: attr(display, "version_instructions").to_string(),
            settings,
        })
    }

    pub fn display_status(&self) -> DisplayStatus {
        DisplayStatus::from_code(self.status)
    }

    /// Setting value by (case-insensitive) name, or `default`.
    pub fn get_setting(&self, name: &str, default: &str) -> String {
        self.settings
            .get(&name.to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Requested collection interval in seconds, if the CMS sent a usable one.
    pub fn collect_interval(&self) -> Option<u64> {
        self.get_setting("collectInterval", "")
            .parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }
}

// --- RequiredFiles --------------------------------------------------------

/// One entry of the CMS's required-files list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequiredFile {
    /// `media`, `layout`, `resource`, `dependency`, ...
    pub file_type: String,
    pub id: String,
    pub size: u64,
    pub md5: String,
    /// `http` or `xmds`.
    pub download: String,
    /// Source URL for http downloads.
    pub path: String,
    pub save_as: String,
    /// The CMS's `fileType` attribute (e.g. `fontCss`, `bundle`).
    pub sub_type: String,
    pub layout_id: Option<i64>,
    pub region_id: Option<String>,
    pub media_id: Option<String>,
    pub updated: Option<String>,
    pub update_interval: Option<u64>,
    pub code: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl RequiredFile {
    fn from_node(n: Node<'_, '_>) -> Self {
        let opt = |name: &str| Some(attr(n, name).trim().to_string()).filter(|s| !s.is_empty());
        Self {
            file_type: attr(n, "type").to_string(),
            id: attr(n, "id").to_string(),
            size: attr(n, "size").trim().parse().unwrap_or(0),
            md5: attr(n, "md5").to_string(),
            download: attr(n, "download").to_string(),
            path: attr(n, "path").to_string(),
            save_as: attr(n, "saveAs").to_string(),
            sub_type: attr(n, "fileType").to_string(),
            layout_id: attr_opt_i64(n, "layoutid").or_else(|| attr_opt_i64(n, "layoutId")),
            region_id: opt("regionid").or_else(|| opt("regionId")),
            media_id: opt("mediaid").or_else(|| opt("mediaId")),
            updated: opt("updated"),
            update_interval: attr(n, "updateInterval").trim().parse().ok(),
            code: opt("code"),
            width: attr(n, "width").trim().parse().ok(),
            height: attr(n, "height").trim().parse().ok(),
        }
    }

    pub fn is_resource(&self) -> bool {
        self.file_type == "resource"
    }

    /// Name the file is stored under in the library.
    pub fn save_name(&self) -> String {
        if !self.save_as.is_empty() {
            return self.save_as.clone();
        }
        if self.is_resource() {
            return resource_name(
                self.layout_id.unwrap_or(0),
                self.region_id.as_deref().unwrap_or(""),
                self.media_id.as_deref().unwrap_or(""),
            );
        }
        format!("{}_{}", self.file_type, self.id)
    }

    /// Content token used for change detection: the MD5 when the CMS sends
    /// one, otherwise the `updated` stamp (resources).
    pub fn declared_hash(&self) -> String {
        if !self.md5.is_empty() {
            return self.md5.clone();
        }
        self.updated.clone().unwrap_or_default()
    }
}

/// Deterministic library name of a rendered widget resource.
pub fn resource_name(layout_id: i64, region_id: &str, media_id: &str) -> String {
    format!("{layout_id}_{region_id}_{media_id}.html")
}

/// A file the CMS wants removed from the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeItem {
    pub id: Option<i64>,
    pub stored_as: String,
}

pub(crate) fn parse_purge(parent: Node<'_, '_>) -> Vec<PurgeItem> {
    let mut out = Vec::new();
    for purge in children(parent, "purge") {
        let items: Vec<_> = children(purge, "item").collect();
        if items.is_empty() {
            if purge.attribute("storedAs").is_some() || purge.attribute("id").is_some() {
                out.push(PurgeItem {
                    id: attr_opt_i64(purge, "id"),
                    stored_as: attr(purge, "storedAs").to_string(),
                });
            }
            continue;
        }
        for item in items {
            out.push(PurgeItem {
                id: attr_opt_i64(item, "id"),
                stored_as: attr(item, "storedAs").to_string(),
            });
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequiredFiles {
    pub generated: String,
    pub filter_from: String,
    pub filter_to: String,
    pub files: Vec<RequiredFile>,
    pub purge: Vec<PurgeItem>,
}

impl RequiredFiles {
    pub fn parse(body: &str) -> Result<Self, XmdsError> {
        let inner = extract_payload(body, XmdsMethod::RequiredFiles, "RequiredFilesXml")?;
        Self::parse_files(&inner)
    }

    /// Parse the decoded `<files>` document.
    pub fn parse_files(xml: &str) -> Result<Self, XmdsError> {
        let doc = parse_doc(xml)?;
        let root = doc.root_element();
        if root.tag_name().name() != "files" {
            return Err(XmdsError::Malformed(format!(
                "expected <files>, got <{}>",
                root.tag_name().name()
            )));
        }

        // Some CMS versions misspell the filter attributes.
        let filter = |good: &str, typo: &str| {
            root.attribute(good).or_else(|| root.attribute(typo)).unwrap_or("").to_string()
        };

        Ok(Self {
            generated: attr(root, "generated").to_string(),
            filter_from: filter("filterFrom", "fitlerFrom"),
            filter_to: filter("filterTo", "fitlerTo"),
            files: children(root, "file").map(RequiredFile::from_node).collect(),
            purge: parse_purge(root),
        })
    }
}

/// `GetResource` returns the rendered widget HTML.
pub fn parse_resource(body: &str) -> Result<String, XmdsError> {
    extract_payload(body, XmdsMethod::GetResource, "resource")
}
