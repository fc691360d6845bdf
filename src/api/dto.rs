//! Response envelope and shared request types.
//!
//! Every panel endpoint answers `{code, msg, data}` with HTTP 200;
//! `code = 0` means success. Business failures keep the 200 status so
//! panel front-ends and peers only have to look at the envelope.

use axum::{response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The panel envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct R<T = serde_json::Value> {
    pub code: i32,
    pub msg: String,
    pub data: Option<T>,
}

impl<T: Serialize> R<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 0,
            msg: "success".into(),
            data: Some(data),
        }
    }
}

impl R<serde_json::Value> {
    pub fn ok_empty() -> Self {
        Self {
            code: 0,
            msg: "success".into(),
            data: None,
        }
    }

    pub fn err(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for R<T> {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tunnel surface
// ---------------------------------------------------------------------------

/// One hop of a tunnel-create request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HopSpec {
    pub node_id: i64,
    pub protocol: String,
    pub strategy: String,
    /// Requested port; absent or 0 lets the panel pick.
    #[serde(default)]
    pub port: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelRequest {
    pub name: String,
    #[serde(rename = "type", default)]
    pub tunnel_type: i64,
    #[serde(default)]
    pub flow: i64,
    #[serde(default)]
    pub status: i64,
    /// Entry hops.
    #[serde(rename = "inNodeId", default)]
    pub in_nodes: Vec<HopSpec>,
    /// Middle chain: one sublist per position, members are parallel hops.
    #[serde(rename = "chainNodes", default)]
    pub chain_nodes: Vec<Vec<HopSpec>>,
    /// Exit hops.
    #[serde(rename = "outNodeId", default)]
    pub out_nodes: Vec<HopSpec>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IdRequest {
    pub id: i64,
}

// ---------------------------------------------------------------------------
// Share admin surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePeerShareRequest {
    pub name: String,
    pub node_id: i64,
    #[serde(default)]
    pub max_bandwidth: i64,
    #[serde(default)]
    pub expiry_time: i64,
    pub port_range_start: i64,
    pub port_range_end: i64,
    #[serde(default)]
    pub allowed_domains: Option<String>,
    #[serde(default)]
    pub allowed_ips: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePeerShareResponse {
    pub id: i64,
    pub token: String,
}

// ---------------------------------------------------------------------------
// Consumer federation surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportNodeRequest {
    pub remote_url: String,
    pub token: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportNodeResponse {
    pub node_id: i64,
}
