use axum::extract::State;
use axum::Json;
use time::OffsetDateTime;

use poolgate_protocol::models::{ModelEntry, ModelList};

use crate::GatewayState;

pub(crate) async fn list(State(state): State<GatewayState>) -> Json<ModelList> {
    let created = OffsetDateTime::now_utc().unix_timestamp();
    let entries = state
        .gateway
        .supported_models()
        .into_iter()
        .map(|model| ModelEntry::new(model, created))
        .collect();
    Json(ModelList::new(entries))
}
