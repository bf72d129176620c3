use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::NotifyError;

/// Wire field carrying the photo location, as published to `/topic/alarms`.
pub const DOGE_PHOTO_URI_FIELD: &str = "dogePhotoUri";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DogePhotoPayload {
    pub doge_photo_uri: String,
}

/// A validated "new image" event. The URI is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    image_uri: String,
}

impl Notification {
    pub fn new(image_uri: impl Into<String>) -> Result<Self, NotifyError> {
        let image_uri = image_uri.into();
        if image_uri.trim().is_empty() {
            return Err(NotifyError::DecodeError("image URI is empty".to_string()));
        }
        Ok(Self { image_uri })
    }

    pub fn image_uri(&self) -> &str {
        &self.image_uri
    }

    /// Resolve a relative image URI against `base`; absolute URIs are returned as-is.
    pub fn resolve(&self, base: &Url) -> Result<Url, NotifyError> {
        base.join(&self.image_uri).map_err(|e| {
            NotifyError::DecodeError(format!(
                "cannot resolve image URI {:?}: {}",
                self.image_uri, e
            ))
        })
    }
}

impl From<Notification> for DogePhotoPayload {
    fn from(notification: Notification) -> Self {
        DogePhotoPayload {
            doge_photo_uri: notification.image_uri,
        }
    }
}

/// How a MESSAGE body becomes a [`Notification`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DecodeStrategy {
    /// JSON object with a required string field.
    Json {
        #[serde(default = "default_field")]
        field: String,
    },
    /// The trimmed body is the URI.
    PlainText,
}

fn default_field() -> String {
    DOGE_PHOTO_URI_FIELD.to_string()
}

impl Default for DecodeStrategy {
    fn default() -> Self {
        DecodeStrategy::Json {
            field: default_field(),
        }
    }
}

impl DecodeStrategy {
    pub fn decode(&self, body: &[u8]) -> Result<Notification, NotifyError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| NotifyError::DecodeError("body is not valid UTF-8".to_string()))?;

        match self {
            DecodeStrategy::Json { field } => {
                let value: Value = serde_json::from_str(text)?;
                let uri = match value.get(field) {
                    Some(Value::String(uri)) => uri,
                    Some(other) => {
                        return Err(NotifyError::DecodeError(format!(
                            "field {:?} is not a string: {}",
                            field, other
                        )))
                    }
                    None => {
                        return Err(NotifyError::DecodeError(format!(
                            "missing required field {:?}",
                            field
                        )))
                    }
                };
                Notification::new(uri.as_str())
            }
            DecodeStrategy::PlainText => Notification::new(text.trim()),
        }
    }
}
