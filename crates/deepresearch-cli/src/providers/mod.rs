//! Network and filesystem bindings for the engine's model and tool seams.

mod local_docs;
mod openai;
mod tavily;

pub use local_docs::local_docs_tools;
pub use openai::OpenAiCompatible;
pub use tavily::TavilySearch;
