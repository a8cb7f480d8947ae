//! Plan text helpers: the completion prompt, location extraction and the
//! template fallback.

mod extract;
mod fallback;
mod prompt;

pub use extract::{display_text, extract_locations, extract_marked};
pub use fallback::template_plan;
pub use prompt::{
    build_prompt, completion_request, CompletionSettings, PROMPT_TEMPLATE_ID, SYSTEM_PROMPT,
};
