use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RetrievalConfig;
use crate::services::conversation::ConversationStore;
use crate::services::images::ConversationImageStore;
use crate::services::retrieval::{RetrievalEngine, ThreadGroup};
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RetrieveResponse {
    pub groups: Vec<ThreadGroup>,
    pub context: String,
    pub images: Vec<String>,
}

pub async fn search_handler(
    Extension(engine): Extension<Arc<RetrievalEngine>>,
    Extension(image_store): Extension<Arc<ConversationImageStore>>,
    Extension(conversations): Extension<Arc<ConversationStore>>,
    Extension(cfg): Extension<RetrievalConfig>,
    Json(request): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>, ApiError> {
    info!(query = %request.query, "retrieval request");

    let result = engine.retrieve(&request.query, &cfg).await?;

    if let Some(conversation_id) = &request.conversation_id {
        image_store.record(conversation_id, result.images.clone());
        conversations.record_turn(conversation_id, request.query.clone(), result.context.clone());
    }

    Ok(Json(RetrieveResponse {
        groups: result.groups,
        context: result.context,
        images: result.images,
    }))
}
