//! Viewer wire protocol
//!
//! JSON text messages over the WebSocket:
//!
//! ```text
//! client → server   {"action":"subscribe","cameraName":"plate_0"}
//!                   {"action":"unsubscribe"}
//!
//! server → client   {"type":"available_cameras","cameras":["plate_0",...]}
//!                   {"type":"subscribed","camera":"plate_0"}
//!                   {"type":"unsubscribed","camera":"plate_0"}
//!                   {"type":"frame","camera":"plate_0","data":"<base64 JPEG>"}
//!                   {"type":"error","camera":"plate_0","message":"..."}
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use super::error::HubError;

/// Message shown to subscribers when their extractor fails
pub const STREAM_ERROR_MESSAGE: &str = "Stream error occurred.";

/// Request sent by a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    /// Watch one camera, replacing any current subscription
    Subscribe {
        #[serde(rename = "cameraName")]
        camera_name: String,
    },
    /// Stop watching
    Unsubscribe,
}

impl ClientAction {
    /// Parse a text message
    ///
    /// Anything that is not JSON is [`HubError::InvalidMessage`]; JSON that
    /// does not name a known action (or a subscribe without a camera) is
    /// [`HubError::UnknownAction`].
    pub fn parse(text: &str) -> Result<Self, HubError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| HubError::InvalidMessage)?;
        let action: ClientAction =
            serde_json::from_value(value).map_err(|_| HubError::UnknownAction)?;

        match &action {
            ClientAction::Subscribe { camera_name } if camera_name.is_empty() => {
                Err(HubError::UnknownAction)
            }
            _ => Ok(action),
        }
    }
}

/// Message sent to a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on connect
    AvailableCameras { cameras: Vec<String> },
    /// Subscription confirmed
    Subscribed { camera: String },
    /// Subscription removed
    Unsubscribed { camera: String },
    /// One JPEG image, base64 encoded
    Frame { camera: String, data: String },
    /// Request failed or stream broke
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        camera: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    /// Frame message for `image`
    pub fn frame(camera: &str, image: &[u8]) -> Self {
        ServerMessage::Frame {
            camera: camera.to_string(),
            data: STANDARD.encode(image),
        }
    }

    /// Error reply for a failed request
    pub fn from_error(err: &HubError) -> Self {
        ServerMessage::Error {
            camera: err.camera().map(str::to_string),
            message: err.to_string(),
        }
    }

    /// Encode as a WebSocket text message
    pub fn to_message(&self) -> serde_json::Result<Message> {
        Ok(Message::text(serde_json::to_string(self)?))
    }
}
