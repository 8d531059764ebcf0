//! Local feature flag evaluation.
//!
//! Flags are evaluated in-process from definitions fetched by the poller. Evaluation either
//! produces a [`FlagDecision`] or an [`InconclusiveMatchError`] when the definitions reference
//! data that only the server has (unknown cohorts, missing properties, and the like).
mod decision;
mod error;
mod eval;
mod hasher;
mod matcher;
mod models;

pub(crate) use decision::decode_payload;
pub use decision::{
    DecisionSource, EvaluationContext, EvaluationReason, FlagDecision, FlagValue, Properties,
};
pub use error::InconclusiveMatchError;
pub use eval::{evaluate_flag, FlagEvaluator};
pub use hasher::{RolloutHasher, Sha1Hasher};
pub use matcher::match_property;
pub use models::{
    ConditionGroup, FlagDefinition, FlagDefinitionsResponse, FlagFilters, GroupType,
    MultivariateOptions, Operator, PropertyFilter, PropertyGroup, PropertyGroupValues,
    PropertyType, Variant,
};
