//! tomehub-engine: epistemic answer generation over the retrieval core.
//!
//! Assembles evidence (context.rs), classifies it (epistemic.rs), builds the
//! mode-specific prompt (prompts.rs) and invokes a provider-routed LLM with
//! a fallback ladder (llm.rs, providers/).

pub mod analytics;
pub mod answer;
pub mod context;
pub mod epistemic;
pub mod errors;
pub mod llm;
pub mod network;
pub mod prompts;
pub mod providers;

pub use answer::{AnswerEngine, AnswerResponse, SourceRef};
pub use context::{
    AnswerRequest, AssemblyMode, ChatTurn, CompareMode, ContextAssembler, RagContext, ScopeMode,
    USER_NOTES_TARGET,
};
pub use epistemic::{AnnotatedChunk, AnswerMode, Complexity, EpistemicLevel};
pub use errors::{EngineError, EngineResult};
pub use llm::{FallbackState, GenerateOptions, GenerateOutcome, LlmRouter, RouteMode};
pub use network::{NetworkClassifier, NetworkInfo, NetworkStatus};
