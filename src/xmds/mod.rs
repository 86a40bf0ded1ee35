// --- XMDS (CMS protocol) --------------------------------------------------
//
// SOAP over HTTP. Every call is a POST to
//   {cms}/xmds.php?v={version}&method={method}
// with a fixed envelope. Responses wrap an escaped XML document inside a
// named child of `{Method}Response`, which we decode and parse again.

pub mod client;
pub mod envelope;
pub mod response;
pub mod schedule;
pub mod transport;

pub use client::{XmdsClient, XmdsIdentity};
pub use response::{DisplayStatus, PurgeItem, RegisterDisplay, RequiredFile, RequiredFiles};
pub use schedule::{
    Action, Command, Criteria, DataConnector, DefaultLayout, Layout, OverlayLayout, Schedule,
};
pub use transport::{HttpTransport, XmdsTransport};

/// The subset of XMDS the engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XmdsMethod {
    RegisterDisplay,
    RequiredFiles,
    Schedule,
    MediaInventory,
    SubmitLog,
    SubmitStats,
    NotifyStatus,
    GetResource,
    SubmitScreenShot,
}

impl XmdsMethod {
    /// Value of the `method=` query parameter.
    pub fn query_name(self) -> &'static str {
        match self {
            XmdsMethod::RegisterDisplay => "registerDisplay",
            XmdsMethod::RequiredFiles => "requiredFiles",
            XmdsMethod::Schedule => "schedule",
            XmdsMethod::MediaInventory => "mediaInventory",
            XmdsMethod::SubmitLog => "submitLog",
            XmdsMethod::SubmitStats => "submitStats",
            XmdsMethod::NotifyStatus => "notifyStatus",
            XmdsMethod::GetResource => "getResource",
            XmdsMethod::SubmitScreenShot => "submitScreenShot",
        }
    }

    /// Element name inside the SOAP body, e.g. `tns:RegisterDisplay`.
    pub fn element(self) -> &'static str {
        match self {
            XmdsMethod::RegisterDisplay => "RegisterDisplay",
            XmdsMethod::RequiredFiles => "RequiredFiles",
            XmdsMethod::Schedule => "Schedule",
            XmdsMethod::MediaInventory => "MediaInventory",
            XmdsMethod::SubmitLog => "SubmitLog",
            XmdsMethod::SubmitStats => "SubmitStats",
            XmdsMethod::NotifyStatus => "NotifyStatus",
            XmdsMethod::GetResource => "GetResource",
            XmdsMethod::SubmitScreenShot => "SubmitScreenShot",
        }
    }

    /// Local name of the response wrapper, e.g. `RegisterDisplayResponse`.
    pub fn response_element(self) -> String {
        format!("{}Response", self.element())
    }
}
