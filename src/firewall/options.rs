//! Actions and request options produced by the address firewall.

use std::time::Duration;

use serde::Deserialize;

/// Default maximum size of a response body.
pub const DEFAULT_MAX_DOWNLOAD: u64 = 16 * 1024 * 1024;

/// Default maximum size of a request, including headers.
pub const DEFAULT_MAX_UPLOAD: u64 = 4 * 1024 * 1024;

/// Default request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default maximum size of a single websocket message.
pub const DEFAULT_MAX_WEBSOCKET_MESSAGE: usize = 128 * 1024;

/// Whether a connection to an address is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// The connection may proceed.
    Allow,
    /// The connection is refused.
    Deny,
}

/// Options contributed by a single rule.
///
/// Every field is optional. When several rules match an address, each field is
/// taken from the first matching rule which sets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialOptions {
    /// Allow or deny. A rule without an action is a partial rule.
    pub action: Option<Action>,
    /// Maximum upload size in bytes.
    pub max_upload: Option<u64>,
    /// Maximum download size in bytes.
    pub max_download: Option<u64>,
    /// Timeout in milliseconds, 0 for unlimited.
    pub timeout_ms: Option<u64>,
    /// Maximum websocket message size in bytes.
    pub max_websocket_message: Option<usize>,
}

impl PartialOptions {
    /// Options which only carry an action.
    pub fn action(action: Action) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    /// Whether this carries an allow/deny verdict.
    pub fn is_full(&self) -> bool {
        self.action.is_some()
    }

    /// Fill every unset field from `other`.
    pub fn merge(&mut self, other: &PartialOptions) {
        self.action = self.action.or(other.action);
        self.max_upload = self.max_upload.or(other.max_upload);
        self.max_download = self.max_download.or(other.max_download);
        self.timeout_ms = self.timeout_ms.or(other.timeout_ms);
        self.max_websocket_message = self.max_websocket_message.or(other.max_websocket_message);
    }

    /// Resolve into concrete options, applying defaults.
    ///
    /// A missing action resolves to [`Action::Deny`].
    pub fn to_options(&self) -> Options {
        let timeout_ms = self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        Options {
            action: self.action.unwrap_or(Action::Deny),
            max_upload: self.max_upload.unwrap_or(DEFAULT_MAX_UPLOAD),
            max_download: self.max_download.unwrap_or(DEFAULT_MAX_DOWNLOAD),
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            max_websocket_message: self
                .max_websocket_message
                .unwrap_or(DEFAULT_MAX_WEBSOCKET_MESSAGE),
        }
    }
}

/// The final decision for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Whether the connection is permitted.
    pub action: Action,
    /// Maximum upload size in bytes (0 = unlimited).
    pub max_upload: u64,
    /// Maximum download size in bytes (0 = unlimited).
    pub max_download: u64,
    /// Request timeout, `None` for unlimited.
    pub timeout: Option<Duration>,
    /// Maximum websocket message size in bytes.
    pub max_websocket_message: usize,
}

impl Options {
    /// Check if the connection is permitted.
    pub fn is_allowed(&self) -> bool {
        self.action == Action::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_partial_resolves_to_deny() {
        let options = PartialOptions::default().to_options();
        assert_eq!(options.action, Action::Deny);
        assert_eq!(options.max_download, DEFAULT_MAX_DOWNLOAD);
        assert_eq!(options.max_upload, DEFAULT_MAX_UPLOAD);
        assert_eq!(options.timeout, Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)));
    }

    #[test]
    fn test_merge_keeps_earlier_fields() {
        let mut first = PartialOptions {
            max_download: Some(1024),
            ..PartialOptions::default()
        };
        let second = PartialOptions {
            action: Some(Action::Allow),
            max_download: Some(4096),
            max_upload: Some(10),
            ..PartialOptions::default()
        };

        first.merge(&second);
        assert_eq!(first.action, Some(Action::Allow));
        assert_eq!(first.max_download, Some(1024));
        assert_eq!(first.max_upload, Some(10));
    }

    #[test]
    fn test_zero_timeout_is_unlimited() {
        let options = PartialOptions {
            action: Some(Action::Allow),
            timeout_ms: Some(0),
            ..PartialOptions::default()
        }
        .to_options();
        assert!(options.is_allowed());
        assert_eq!(options.timeout, None);
    }
}
