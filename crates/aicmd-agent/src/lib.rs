mod chat;
pub mod highlight;
mod pipeline;

pub use chat::{ChatEnd, ChatIo, ChatSession};
pub use highlight::{HighlightStyle, dedup_candidates, highlight_tokens, normalize_command};
pub use pipeline::{
    ALTERNATIVES_OP, Candidate, CommandPipeline, EXPLAIN_OP, GENERATE_OP, PipelineOptions,
    PipelineOutcome, Prompter, is_rejection, parse_choice,
};
