use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Code Room Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::websocket::ws_handler,
        crate::routes::sandbox::languages,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::sandbox::LanguagesResponse,
            crate::dto::sandbox::LanguageInfo,
            crate::dto::sandbox::ExecutionReport,
            crate::dto::sandbox::RunStatus,
            crate::dto::ws::ClientEvent,
            crate::dto::ws::ServerMessage,
            crate::dto::ws::AckFrame,
            crate::dto::ws::ErrorBody,
            crate::dto::room::JoinRoomResponse,
            crate::dto::room::RequestExecutionResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "rooms", description = "WebSocket protocol of shared coding rooms"),
        (name = "sandbox", description = "Program execution sandbox"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in ["/healthcheck", "/ws", "/sandbox/languages"] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
