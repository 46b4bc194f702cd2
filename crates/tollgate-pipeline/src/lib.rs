//! The flyer pipeline: plan, generate an image and text in parallel, put each
//! through human review, and compose the approved pieces.

pub mod fields;
pub mod flyer;
pub mod options;
pub mod prompts;
pub mod sink;
pub mod steps;

pub use flyer::{initial_state, FlyerOutcome, FlyerPipeline};
pub use options::PipelineOptions;
pub use sink::JsonFileSink;
pub use steps::TextElements;
