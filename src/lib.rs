//! # Guideline Synth
//!
//! A resumable batch pipeline that turns clinical guideline documents into
//! a supervised training corpus with a chat-completion model.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ extract ┌────────┐  cases  ┌────────┐ reasoning ┌────────────┐
//! │ guidelines │────────▶│ rules  │────────▶│ cases  │──────────▶│ reasoning  │
//! │   (.md)    │         │ (.json)│         │ (.json)│           │   (.json)  │
//! └────────────┘         └────────┘         └────────┘           └────────────┘
//! ```
//!
//! Each stage is prepare → execute → merge. Requests are written to a JSONL
//! manifest keyed by `"<relative path>|<index>"`; the responses come back
//! in any order and are routed to their source record by that key alone.
//!
//! ## Quick Start
//!
//! ```bash
//! gsynth prepare extract         # write batch/extract_input.jsonl
//! # upload, wait, download batch/extract_output.jsonl
//! gsynth merge extract           # write the rules tree
//! gsynth run cases               # or call the model in-process, then merge
//! gsynth status reasoning
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Stage records and wire formats |
//! | [`identity`] | `path|index` request identity |
//! | [`scan`] | Input tree discovery |
//! | [`chunk`] | Heading-boundary document chunking |
//! | [`prompt`] | Prompt rendering per stage |
//! | [`manifest`] | Batch request building and manifest writing |
//! | [`extract`] | JSON recovery from model output |
//! | [`merge`] | Result routing and output assembly |
//! | [`llm`] | Chat-completion provider abstraction |
//! | [`retry`] | Bounded retry with backoff |
//! | [`direct`] | In-process request runner |
//! | [`pipeline`] | Stage orchestration |
//! | [`status`] | Per-stage progress overview |
//! | [`store`] | Stage file and JSONL I/O |
//! | [`error`] | Per-record error taxonomy and error log |
//! | [`progress`] | Run progress reporting |

pub mod chunk;
pub mod config;
pub mod direct;
pub mod error;
pub mod extract;
pub mod identity;
pub mod llm;
pub mod manifest;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod prompt;
pub mod retry;
pub mod scan;
pub mod status;
pub mod store;
