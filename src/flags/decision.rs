use std::collections::HashMap;
use std::fmt;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Free-form properties of a person, a group or an event.
pub type Properties = HashMap<String, serde_json::Value>;

/// Resolved value of a feature flag: either on/off, or the key of a variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    /// A boolean flag, or a multivariate flag that matched no variant.
    Boolean(bool),
    /// The key of the variant assigned to the subject.
    Variant(String),
}

impl FlagValue {
    /// `false` only for `Boolean(false)`. Any variant counts as enabled.
    pub fn is_enabled(&self) -> bool {
        match self {
            FlagValue::Boolean(b) => *b,
            FlagValue::Variant(_) => true,
        }
    }

    /// Return the variant key, if this is a multivariate result.
    pub fn as_variant(&self) -> Option<&str> {
        match self {
            FlagValue::Variant(v) => Some(v),
            FlagValue::Boolean(_) => None,
        }
    }

    /// String form used to look up payloads and to deduplicate telemetry.
    pub(crate) fn lookup_key(&self) -> String {
        self.to_string()
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Variant(value.to_owned())
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Boolean(b) => write!(f, "{b}"),
            FlagValue::Variant(v) => f.write_str(v),
        }
    }
}

/// Payloads are usually served JSON-encoded in a string. Anything that doesn't decode is returned
/// as is.
pub(crate) fn decode_payload(raw: &serde_json::Value) -> serde_json::Value {
    match raw {
        serde_json::Value::String(encoded) => {
            serde_json::from_str(encoded).unwrap_or_else(|_| raw.clone())
        }
        other => other.clone(),
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum EvaluationReason {
    /// The flag is not active.
    Disabled,
    /// Condition group `condition_index` matched.
    ConditionMatch {
        #[allow(missing_docs)]
        condition_index: usize,
    },
    /// No condition group matched. `out_of_rollout` is set when at least one group matched its
    /// properties but excluded the subject by rollout percentage.
    NoConditionMatch {
        #[allow(missing_docs)]
        out_of_rollout: bool,
    },
    /// Decided by the server.
    Remote {
        #[allow(missing_docs)]
        description: Option<String>,
    },
}

impl EvaluationReason {
    pub(crate) fn describe(&self) -> String {
        match self {
            EvaluationReason::Disabled => "flag is disabled".to_owned(),
            EvaluationReason::ConditionMatch { condition_index } => {
                format!("matched condition set {}", condition_index + 1)
            }
            EvaluationReason::NoConditionMatch {
                out_of_rollout: true,
            } => "out of rollout bound".to_owned(),
            EvaluationReason::NoConditionMatch {
                out_of_rollout: false,
            } => "no condition matched".to_owned(),
            EvaluationReason::Remote { description } => description
                .clone()
                .unwrap_or_else(|| "evaluated remotely".to_owned()),
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Computed in-process from flag definitions.
    Local,
    /// Returned by the remote evaluation endpoint.
    Remote,
    /// Served from the flag result cache because neither of the above was available.
    Cache,
}

/// The outcome of evaluating one flag for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDecision {
    /// Flag key.
    pub key: String,
    /// Resolved value.
    pub value: FlagValue,
    /// Payload attached to the resolved value, if any.
    pub payload: Option<serde_json::Value>,
    /// Explanation of the result.
    pub reason: EvaluationReason,
    /// Whether the decision was computed locally, remotely or served from cache.
    pub source: DecisionSource,
}

impl FlagDecision {
    /// Return `true` if the decision was computed in-process.
    pub fn is_locally_evaluated(&self) -> bool {
        self.source == DecisionSource::Local
    }
}

/// Everything known about the subject of an evaluation. Immutable for the duration of a call.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    /// Stable identifier of the person being evaluated.
    pub distinct_id: String,
    /// Person properties available for targeting.
    pub person_properties: Properties,
    /// Group type name (e.g. `"company"`) to group key.
    pub groups: HashMap<String, String>,
    /// Group type name to that group's properties.
    pub group_properties: HashMap<String, Properties>,
    /// If set, only these flags are evaluated by multi-flag operations.
    pub flag_keys: Option<Vec<String>>,
}

impl EvaluationContext {
    /// Create a context for `distinct_id` with no properties.
    pub fn new(distinct_id: impl Into<String>) -> EvaluationContext {
        EvaluationContext {
            distinct_id: distinct_id.into(),
            ..Default::default()
        }
    }

    /// Add a person property.
    pub fn with_person_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> EvaluationContext {
        self.person_properties.insert(key.into(), value.into());
        self
    }

    /// Associate the subject with group `group_key` of type `group_type`.
    pub fn with_group(
        mut self,
        group_type: impl Into<String>,
        group_key: impl Into<String>,
    ) -> EvaluationContext {
        self.groups.insert(group_type.into(), group_key.into());
        self
    }

    /// Add a property of the group of type `group_type`.
    pub fn with_group_property(
        mut self,
        group_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> EvaluationContext {
        self.group_properties
            .entry(group_type.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Restrict multi-flag operations to `keys`.
    pub fn with_flag_keys<I, S>(mut self, keys: I) -> EvaluationContext
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flag_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn includes_flag(&self, key: &str) -> bool {
        self.flag_keys
            .as_ref()
            .map_or(true, |keys| keys.iter().any(|k| k == key))
    }
}
