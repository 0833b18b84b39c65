//! HTTP routes
//!
//! Every successful response uses the `{success, data, meta}` envelope;
//! failures use the body produced by [`crate::error::AppError`].

pub mod entities;
pub mod health;
pub mod sync;

use axum::Json;
use serde::Serialize;
use serde_json::Value;

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            meta: None,
        })
    }

    pub fn with_meta(data: T, meta: Value) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            meta: Some(meta),
        })
    }
}
