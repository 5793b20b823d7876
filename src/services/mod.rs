/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Identity token verification.
pub mod identity;
/// Execution sandbox client.
pub mod sandbox;
/// Storage connection supervisor toggling degraded mode.
pub mod storage_supervisor;
/// WebSocket connection and frame handling service.
pub mod websocket_service;
