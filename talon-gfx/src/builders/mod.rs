//! Declarative builders for the larger `hal` descriptor structs (render passes, pipelines), kept
//! separate from [`crate::render_pass`]/[`crate::resource::pipeline`] so the "what does this
//! descriptor need" concern stays apart from "what caches/owns the built object" concern.

pub mod pipeline;
pub mod renderpass;
