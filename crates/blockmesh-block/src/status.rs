//! Journal vocabulary: well-known keys, entry states and per-host states
//!
//! The string forms below are the on-disk format. They only appear when a
//! journal line is written or replayed; everywhere else the closed enums are
//! matched exhaustively.

use std::fmt;

/// Well-known journal keys. Any other key is a host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    Volume,
    Gbid,
    Size,
    Ha,
    EntryCreate,
    EntryDelete,
    Password,
    RingBuffer,
    BlkSize,
    IoTimeout,
    PrioPath,
}

impl MetaKey {
    /// Journal spelling of the key
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Volume => "VOLUME",
            Self::Gbid => "GBID",
            Self::Size => "SIZE",
            Self::Ha => "HA",
            Self::EntryCreate => "ENTRYCREATE",
            Self::EntryDelete => "ENTRYDELETE",
            Self::Password => "PASSWORD",
            Self::RingBuffer => "RINGBUFFER",
            Self::BlkSize => "BLKSIZE",
            Self::IoTimeout => "IOTIMEOUT",
            Self::PrioPath => "PRIOPATH",
        }
    }

    /// Parse a journal key, `None` for host addresses
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "VOLUME" => Self::Volume,
            "GBID" => Self::Gbid,
            "SIZE" => Self::Size,
            "HA" => Self::Ha,
            "ENTRYCREATE" => Self::EntryCreate,
            "ENTRYDELETE" => Self::EntryDelete,
            "PASSWORD" => Self::Password,
            "RINGBUFFER" => Self::RingBuffer,
            "BLKSIZE" => Self::BlkSize,
            "IOTIMEOUT" => Self::IoTimeout,
            "PRIOPATH" => Self::PrioPath,
            _ => return None,
        })
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the block data object (ENTRYCREATE / ENTRYDELETE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    InProgress,
    Success,
    Fail,
}

impl EntryState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "INPROGRESS",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INPROGRESS" => Some(Self::InProgress),
            "SUCCESS" => Some(Self::Success),
            "FAIL" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one host for one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    ConfigInProgress,
    ConfigSuccess,
    ConfigFail,
    CleanupInProgress,
    CleanupSuccess,
    CleanupFail,
    AuthEnforcing,
    AuthEnforced,
    AuthEnforceFail,
    AuthClearEnforcing,
    AuthClearEnforced,
    AuthClearEnforceFail,
    ReplaceInProgress,
    ReplaceSuccess,
    ReplaceFail,
    ResizeInProgress(Option<u64>),
    ResizeSuccess(Option<u64>),
    ResizeFail(Option<u64>),
    /// Anything not recognised, kept verbatim
    Unknown(String),
}

impl NodeState {
    /// Parse a journal value. Never fails: unrecognised text is preserved.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "CONFIGINPROGRESS" => return Self::ConfigInProgress,
            "CONFIGSUCCESS" => return Self::ConfigSuccess,
            "CONFIGFAIL" => return Self::ConfigFail,
            "CLEANUPINPROGRESS" => return Self::CleanupInProgress,
            "CLEANUPSUCCESS" => return Self::CleanupSuccess,
            "CLEANUPFAIL" => return Self::CleanupFail,
            "AUTHENFORCEING" => return Self::AuthEnforcing,
            "AUTHENFORCED" => return Self::AuthEnforced,
            "AUTHENFORCEFAIL" => return Self::AuthEnforceFail,
            "AUTHCLEARENFORCEING" => return Self::AuthClearEnforcing,
            "AUTHCLEARENFORCED" => return Self::AuthClearEnforced,
            "AUTHCLEARENFORCEFAIL" => return Self::AuthClearEnforceFail,
            "RPINPROGRESS" => return Self::ReplaceInProgress,
            "RPSUCCESS" => return Self::ReplaceSuccess,
            "RPFAIL" => return Self::ReplaceFail,
            _ => {}
        }

        let (head, size) = match value.split_once('-') {
            Some((head, size)) => match size.parse::<u64>() {
                Ok(size) => (head, Some(size)),
                Err(_) => return Self::Unknown(value.to_string()),
            },
            None => (value, None),
        };
        match head {
            "RSINPROGRESS" => Self::ResizeInProgress(size),
            "RSSUCCESS" => Self::ResizeSuccess(size),
            "RSFAIL" => Self::ResizeFail(size),
            _ => Self::Unknown(value.to_string()),
        }
    }

    /// Host currently exposes the block
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        matches!(
            self,
            Self::ConfigSuccess
                | Self::CleanupInProgress
                | Self::AuthEnforcing
                | Self::AuthEnforced
                | Self::AuthEnforceFail
                | Self::AuthClearEnforcing
                | Self::AuthClearEnforced
                | Self::AuthClearEnforceFail
                | Self::ReplaceInProgress
                | Self::ReplaceSuccess
                | Self::ReplaceFail
                | Self::ResizeInProgress(_)
                | Self::ResizeSuccess(_)
                | Self::ResizeFail(_)
        )
    }

    /// Last operation on this host failed
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConfigFail
                | Self::CleanupFail
                | Self::AuthEnforceFail
                | Self::AuthClearEnforceFail
                | Self::ReplaceFail
                | Self::ResizeFail(_)
        )
    }

    #[must_use]
    pub const fn is_replace(&self) -> bool {
        matches!(
            self,
            Self::ReplaceInProgress | Self::ReplaceSuccess | Self::ReplaceFail
        )
    }

    #[must_use]
    pub const fn is_resize(&self) -> bool {
        matches!(
            self,
            Self::ResizeInProgress(_) | Self::ResizeSuccess(_) | Self::ResizeFail(_)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (head, size) = match self {
            Self::ConfigInProgress => ("CONFIGINPROGRESS", None),
            Self::ConfigSuccess => ("CONFIGSUCCESS", None),
            Self::ConfigFail => ("CONFIGFAIL", None),
            Self::CleanupInProgress => ("CLEANUPINPROGRESS", None),
            Self::CleanupSuccess => ("CLEANUPSUCCESS", None),
            Self::CleanupFail => ("CLEANUPFAIL", None),
            Self::AuthEnforcing => ("AUTHENFORCEING", None),
            Self::AuthEnforced => ("AUTHENFORCED", None),
            Self::AuthEnforceFail => ("AUTHENFORCEFAIL", None),
            Self::AuthClearEnforcing => ("AUTHCLEARENFORCEING", None),
            Self::AuthClearEnforced => ("AUTHCLEARENFORCED", None),
            Self::AuthClearEnforceFail => ("AUTHCLEARENFORCEFAIL", None),
            Self::ReplaceInProgress => ("RPINPROGRESS", None),
            Self::ReplaceSuccess => ("RPSUCCESS", None),
            Self::ReplaceFail => ("RPFAIL", None),
            Self::ResizeInProgress(size) => ("RSINPROGRESS", *size),
            Self::ResizeSuccess(size) => ("RSSUCCESS", *size),
            Self::ResizeFail(size) => ("RSFAIL", *size),
            Self::Unknown(text) => (text.as_str(), None),
        };
        match size {
            Some(size) => write!(f, "{head}-{size}"),
            None => f.write_str(head),
        }
    }
}
