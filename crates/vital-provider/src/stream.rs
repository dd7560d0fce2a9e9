/// Events emitted during an LLM streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    Chunk { text: String },

    /// Stream completed successfully, with final token usage.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
    },

    /// Error during streaming.
    Error { message: String },
}
