//! Session, authentication and storage server payloads.

use super::{StorageServer, StorageServerId};
use serde::{Deserialize, Serialize};

/// Generic failure report sent in place of the expected response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub subsystem: String,
    pub details: String,
}

impl From<&crate::BvmError> for Error {
    fn from(err: &crate::BvmError) -> Self {
        match err {
            crate::BvmError::Remote { subsystem, details } => Self {
                subsystem: subsystem.clone(),
                details: details.clone(),
            },
            other => Self {
                subsystem: other.subsystem().to_string(),
                details: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResponse {
    /// `auth_ok` or `auth_wrong`.
    pub result: String,
    #[serde(default)]
    pub user_details: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReauthenticationRequest {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageServerRegistrationRequest {
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerRegistrationResponse {
    #[serde(rename = "assignedID")]
    pub assigned_id: StorageServerId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerListRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerListResponse {
    pub servers: Vec<StorageServer>,
}
