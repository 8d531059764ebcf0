use thiserror::Error;

/// A flag (or one of its conditions) can't be decided with the data available locally.
///
/// This is an expected outcome, not a failure: the caller is supposed to fall back to the
/// result cache or to remote evaluation. It must never be treated as "not matched".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InconclusiveMatchError {
    /// The property the condition needs is absent from the context.
    #[error("property `{0}` is not available locally")]
    MissingProperty(String),

    /// The operator needs server-side data (`is_not_set`) or is unknown to this SDK.
    #[error("operator can't be evaluated locally: {0}")]
    UnsupportedOperator(String),

    /// The comparison value or the property value has an invalid format.
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue {
        #[allow(missing_docs)]
        key: String,
        #[allow(missing_docs)]
        reason: &'static str,
    },

    /// The cohort definition wasn't sent with the flag definitions.
    #[error("cohort `{0}` is not available locally")]
    UnknownCohort(String),

    /// A flag this flag depends on is missing, inconclusive, or part of a cycle.
    #[error("dependency on flag `{0}` can't be resolved locally")]
    UnresolvedDependency(String),

    /// The flag targets a group type that is unknown or absent from the context.
    #[error("group `{0}` is not available locally")]
    MissingGroup(String),

    /// The flag requires server-side state (e.g. experience continuity).
    #[error("flag `{0}` requires server-side evaluation")]
    RequiresServer(String),

    /// No definitions are loaded, or the flag isn't among them.
    #[error("flag `{0}` is not defined locally")]
    FlagNotFound(String),
}
