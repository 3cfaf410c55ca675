//! Deployment configuration for the sync layer.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{SyncError, SyncResult};
use crate::path::CollectionPath;

/// Names and limits shared by presence and notification components.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Collection holding notification records for every recipient
    pub notifications_collection: String,
    /// Page size used when `NotificationOptions::limit` is not set
    pub notification_limit: usize,
    /// Collection holding one presence record per session
    pub presence_namespace: String,
    /// Online records older than this are counted offline (None = never stale)
    pub presence_stale_after_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            notifications_collection: "notifications".to_string(),
            notification_limit: 50,
            presence_namespace: "presence".to_string(),
            presence_stale_after_secs: None,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.notifications_path()?;
        self.presence_path()?;
        if self.notification_limit == 0 {
            return Err(SyncError::MalformedConstraints(
                "notificationLimit must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn notifications_path(&self) -> SyncResult<CollectionPath> {
        CollectionPath::parse(&self.notifications_collection)
    }

    pub fn presence_path(&self) -> SyncResult<CollectionPath> {
        CollectionPath::parse(&self.presence_namespace)
    }

    pub fn presence_stale_after(&self) -> Option<Duration> {
        self.presence_stale_after_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.notification_limit, 50);
        assert_eq!(config.notifications_path().unwrap().to_string(), "notifications");
        assert_eq!(config.presence_stale_after(), None);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = SyncConfig::from_json_str(
            r#"{"presenceNamespace": "tenants/t1/presence", "presenceStaleAfterSecs": 90}"#,
        )
        .unwrap();
        assert_eq!(config.presence_path().unwrap().to_string(), "tenants/t1/presence");
        assert_eq!(config.presence_stale_after(), Some(Duration::from_secs(90)));
        assert_eq!(config.notifications_collection, "notifications");
    }

    #[test]
    fn test_rejects_document_path_namespace() {
        let err = SyncConfig::from_json_str(r#"{"presenceNamespace": "presence/p1"}"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath(_)));
    }

    #[test]
    fn test_rejects_zero_limit() {
        assert!(SyncConfig::from_json_str(r#"{"notificationLimit": 0}"#).is_err());
    }

    #[test]
    fn test_bad_json_is_decode_error() {
        let err = SyncConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }
}
