//! Caller identity
//!
//! Authentication happens upstream; the gateway forwards the authenticated
//! user, organization and device as headers and the engine trusts them as
//! given.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts, http::HeaderMap};

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ORGANIZATION_ID_HEADER: &str = "x-organization-id";
pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const PLATFORM_HEADER: &str = "x-platform";
pub const APP_VERSION_HEADER: &str = "x-app-version";

/// Authenticated user, optionally acting from a known device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub organization_id: String,
    pub device_id: Option<String>,
    pub platform: Option<String>,
    pub app_version: Option<String>,
}

/// Identity for sync calls, where the device is mandatory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub organization_id: String,
    pub device_id: String,
    pub platform: Option<String>,
    pub app_version: Option<String>,
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AppError> {
        let user_id = header_value(headers, USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized("missing user identity".to_string()))?;
        let organization_id = header_value(headers, ORGANIZATION_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized("missing organization identity".to_string()))?;

        Ok(Self {
            user_id,
            organization_id,
            device_id: header_value(headers, DEVICE_ID_HEADER),
            platform: header_value(headers, PLATFORM_HEADER),
            app_version: header_value(headers, APP_VERSION_HEADER),
        })
    }

    /// Require a device identifier
    pub fn with_device(self) -> Result<DeviceIdentity, AppError> {
        let device_id = self.device_id.ok_or(AppError::DeviceIdRequired)?;
        Ok(DeviceIdentity {
            user_id: self.user_id,
            organization_id: self.organization_id,
            device_id,
            platform: self.platform,
            app_version: self.app_version,
        })
    }
}

/// Non-empty, trimmed header value
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Identity::from_headers(&parts.headers)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for DeviceIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Identity::from_headers(&parts.headers)?.with_device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_device_identity_requires_device_id() {
        let map = headers(&[(USER_ID_HEADER, "user-1"), (ORGANIZATION_ID_HEADER, "org-1")]);

        let identity = Identity::from_headers(&map).unwrap();
        assert!(identity.device_id.is_none());
        assert!(matches!(identity.with_device(), Err(AppError::DeviceIdRequired)));
    }

    #[test]
    fn test_blank_headers_count_as_missing() {
        let map = headers(&[
            (USER_ID_HEADER, "user-1"),
            (ORGANIZATION_ID_HEADER, "org-1"),
            (DEVICE_ID_HEADER, "   "),
        ]);
        let identity = Identity::from_headers(&map).unwrap();
        assert!(identity.device_id.is_none());

        let anonymous = headers(&[(DEVICE_ID_HEADER, "device-a")]);
        assert!(matches!(
            Identity::from_headers(&anonymous),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_device_metadata_is_carried() {
        let map = headers(&[
            (USER_ID_HEADER, "user-1"),
            (ORGANIZATION_ID_HEADER, "org-1"),
            (DEVICE_ID_HEADER, "device-a"),
            (PLATFORM_HEADER, "ios"),
            (APP_VERSION_HEADER, "2.4.0"),
        ]);

        let device = Identity::from_headers(&map).unwrap().with_device().unwrap();
        assert_eq!(device.device_id, "device-a");
        assert_eq!(device.platform.as_deref(), Some("ios"));
        assert_eq!(device.app_version.as_deref(), Some("2.4.0"));
    }
}
