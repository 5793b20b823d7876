use axum::{Json, Router, extract::State, routing::get};

use crate::{dto::sandbox::LanguagesResponse, state::SharedState};

#[utoipa::path(
    get,
    path = "/sandbox/languages",
    tag = "sandbox",
    responses((status = 200, description = "Languages accepted by `run-execution`", body = LanguagesResponse))
)]
/// List the languages the execution sandbox can run.
pub async fn languages(State(state): State<SharedState>) -> Json<LanguagesResponse> {
    let sandbox = state.sandbox();
    Json(LanguagesResponse {
        enabled: sandbox.is_enabled(),
        languages: sandbox.languages(),
    })
}

/// Configure the sandbox routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sandbox/languages", get(languages))
}
