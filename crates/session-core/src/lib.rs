//! Pure game-session logic: document analysis, validator semantics,
//! validator synthesis, document instrumentation, prompt construction, and
//! room lifecycle transitions.
//!
//! Nothing here performs I/O or touches a clock; the async service layer
//! wraps these pieces and supplies timestamps.

pub mod analyzer;
pub mod instrument;
pub mod prompt;
pub mod room;
pub mod rules;
pub mod synthesizer;
