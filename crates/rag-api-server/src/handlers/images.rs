use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::services::images::{ConversationImageStore, ImagePage};

#[derive(Debug, Deserialize)]
pub struct ListImagesQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

pub async fn list_images_handler(
    Extension(store): Extension<Arc<ConversationImageStore>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<ListImagesQuery>,
) -> Json<ImagePage> {
    Json(store.list(&conversation_id, query.offset, query.limit))
}
