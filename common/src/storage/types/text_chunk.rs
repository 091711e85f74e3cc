use crate::stored_object;
use uuid::Uuid;

stored_object!(TextChunk, "text_chunk", {
    /// Knowledge base the chunk belongs to
    kb_id: String,
    /// Document the chunk was cut from
    doc_id: String,
    content: String,
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: Option<serde_json::Value>
});

impl TextChunk {
    pub fn new(kb_id: String, doc_id: String, content: String, embedding: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kb_id,
            doc_id,
            content,
            embedding,
            metadata: None,
        }
    }

    /// Same as [`TextChunk::new`] but with a caller-chosen id, the id shared with the graph store.
    pub fn with_id(
        id: impl Into<String>,
        kb_id: impl Into<String>,
        doc_id: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: id.into(),
            kb_id: kb_id.into(),
            doc_id: doc_id.into(),
            content: content.into(),
            embedding,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
