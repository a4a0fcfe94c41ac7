use std::sync::Arc;

use axum::extract::Path;
use axum::{Extension, Json};
use serde::Serialize;

use crate::services::conversation::{ConversationLifecycle, ConversationStore};
use crate::services::images::ConversationImageStore;

#[derive(Debug, Serialize)]
pub struct DeleteConversationResponse {
    pub conversation_id: String,
    pub lifecycle: ConversationLifecycle,
}

/// Deletes a conversation: transitions it to `Cleared` and evicts its
/// image list, same as the teacher ties session removal to cache eviction.
pub async fn delete_conversation_handler(
    Extension(conversations): Extension<Arc<ConversationStore>>,
    Extension(image_store): Extension<Arc<ConversationImageStore>>,
    Path(conversation_id): Path<String>,
) -> Json<DeleteConversationResponse> {
    conversations.clear(&conversation_id);
    image_store.clear(&conversation_id);

    Json(DeleteConversationResponse {
        lifecycle: conversations.lifecycle(&conversation_id),
        conversation_id,
    })
}
