//! OpenAPI document for the federation surface.

use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::api::dto;
use crate::services::federation_client;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::handlers::shares::create_share,
        crate::api::handlers::shares::share_info,
        crate::api::handlers::shares::reserve,
        crate::api::handlers::shares::commit,
        crate::api::handlers::shares::release,
        crate::api::handlers::federation::import_node,
        crate::api::handlers::tunnels::create_tunnel,
        crate::api::handlers::tunnels::delete_tunnel,
    ),
    components(schemas(
        dto::CreatePeerShareRequest,
        dto::CreatePeerShareResponse,
        dto::CreateTunnelRequest,
        dto::HopSpec,
        dto::IdRequest,
        dto::ImportNodeRequest,
        dto::ImportNodeResponse,
        federation_client::ReservationRef,
        federation_client::ReserveRequest,
        federation_client::ReserveResponse,
        federation_client::ShareInfo,
    )),
    modifiers(&SecuritySchemes),
    tags(
        (name = "federation", description = "Cross-panel share and reservation protocol"),
        (name = "tunnel", description = "Tunnel lifecycle"),
    )
)]
struct ApiDoc;

struct SecuritySchemes;

impl Modify for SecuritySchemes {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
        components.add_security_scheme(
            "share_token",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
    }
}

/// Build the OpenAPI document.
pub fn build_openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_document_builds() {
        let doc = build_openapi();
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["paths"]["/api/v1/federation/reserve"].is_object());
        assert!(json["components"]["schemas"]["ReserveRequest"].is_object());
    }
}
