//! Loom templates: the uniform template model, parameter resolution, `$(expr)$`
//! interpolation, stamping, output extraction, health rules and deployment gating.

#![forbid(unsafe_code)]

mod context;
mod deployment;
mod error;
mod health;
mod interpolate;
pub mod model;
mod outputs;
mod params;
mod stamper;
mod ytt;

pub use context::{runnable_context, StampContext};
pub use deployment::observe;
pub use error::{ObservationError, OutputError, StampError};
pub use health::{evaluate_health, owner_health, Realized};
pub use interpolate::interpolate;
pub use model::{Observation, OutputSpec, ResolvedTemplate, TemplateBody, Variant};
pub use outputs::{extract_output, named_outputs, output_statuses, preview_and_digest, Output, PREVIEW_LIMIT};
pub use params::{resolve_params, Params};
pub use stamper::Stamper;
pub use ytt::{Preprocessor, YttPreprocessor, DEFAULT_YTT_TIMEOUT};
