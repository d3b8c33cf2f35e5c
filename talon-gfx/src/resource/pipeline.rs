//! Public name for a built pipeline. The construction logic (including the `derive_builder`
//! pipeline spec, grounded on the original builder) lives in [`crate::builders::pipeline`]; this
//! module just gives callers a name that doesn't expose "builders" as an implementation detail.

pub use crate::builders::pipeline::{CompletePipeline as GraphicsPipeline, PipelineSpec, PipelineSpecBuilder};
