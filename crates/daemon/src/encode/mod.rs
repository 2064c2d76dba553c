//! Video encoding: plan selection, encoder execution and progress parsing.

pub mod plan;
pub mod progress_parser;
pub mod runner;

pub use plan::{build_plan, select_codec, Codec, EncoderPass, EncodingPlan, PlanError, PlanRequest};
pub use progress_parser::ProgressParser;
pub use runner::{EncodeError, EncoderExecutor, ProcessRunner};
