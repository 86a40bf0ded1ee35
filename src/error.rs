use thiserror::Error;

/// The exact fault string the CMS sends when a display has not been authorised.
pub const NOT_AUTHORISED_MSG: &str = "This Display is not authorised.";

/// Failures talking to the CMS.
///
/// Only `NotAuthorized` changes control flow (it ends the current collection
/// cycle early). Everything else is logged and treated as "no new data".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XmdsError {
    /// Connection refused/reset, timeouts, TLS problems.
    #[error("transport error: {0}")]
    Transport(String),
    /// The CMS knows the display but has not authorised it yet.
    #[error("not authorised: {0}")]
    NotAuthorized(String),
    /// A well-formed SOAP fault.
    #[error("xmds fault [{code}]: {message}")]
    Fault { code: String, message: String },
    /// Anything we could not make sense of. Carries the raw text.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl XmdsError {
    pub fn is_not_authorized(&self) -> bool {
        matches!(self, XmdsError::NotAuthorized(_))
    }

    /// Build the right variant from a fault code/message pair.
    pub fn from_fault(code: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim() == NOT_AUTHORISED_MSG {
            XmdsError::NotAuthorized(message)
        } else {
            XmdsError::Fault { code: code.into(), message }
        }
    }
}

impl From<reqwest::Error> for XmdsError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_connect() {
            "connect"
        } else if e.is_timeout() {
            "timeout"
        } else {
            "request"
        };
        XmdsError::Transport(format!("{kind}: {e}"))
    }
}
