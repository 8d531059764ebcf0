//! Wire format of the local evaluation endpoint.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Response of the local evaluation endpoint: every flag definition of the project together with
/// the data needed to evaluate them without a network round-trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagDefinitionsResponse {
    /// Flag definitions, in the order served.
    #[serde(default)]
    pub flags: Vec<FlagDefinition>,
    /// Group type index (as a string, e.g. `"0"`) to group type name (e.g. `"company"`).
    #[serde(default)]
    pub group_type_mapping: HashMap<String, String>,
    /// Cohort id (as a string) to cohort definition.
    #[serde(default)]
    pub cohorts: HashMap<String, PropertyGroup>,
}

/// A feature flag as served for local evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDefinition {
    /// Server-side id.
    #[serde(default)]
    pub id: i64,
    /// Human-readable description.
    #[serde(default)]
    pub name: Option<String>,
    /// Key the flag is requested by.
    pub key: String,
    /// Inactive flags evaluate to `false`.
    #[serde(default)]
    pub active: bool,
    /// Deleted flags evaluate to `false`.
    #[serde(default)]
    pub deleted: bool,
    /// Keep the value stable across identity changes. Needs server state, so such flags are
    /// never evaluated locally.
    #[serde(default)]
    pub ensure_experience_continuity: bool,
    /// Targeting rules.
    #[serde(default)]
    pub filters: FlagFilters,
}

/// Targeting rules of a [`FlagDefinition`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagFilters {
    /// Condition groups. Evaluated in order; the first one that matches wins.
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: Vec<ConditionGroup>,
    /// Variants of a multivariate flag. `None` for boolean flags.
    #[serde(default)]
    pub multivariate: Option<MultivariateOptions>,
    /// Resolved value (`"true"` or a variant key) to a JSON-encoded payload.
    #[serde(default, deserialize_with = "null_as_default")]
    pub payloads: HashMap<String, serde_json::Value>,
    /// Set if the flag targets a group entity rather than a person.
    #[serde(default)]
    pub aggregation_group_type_index: Option<i32>,
}

/// A set of filters that must all match, with the share of matching subjects it releases to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Filters, combined with AND. An empty list matches everyone.
    #[serde(default, deserialize_with = "null_as_default")]
    pub properties: Vec<PropertyFilter>,
    /// `None` means 100%.
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    /// Forces this variant when the group matches (if it names an existing variant).
    #[serde(default)]
    pub variant: Option<String>,
}

/// Variants of a multivariate flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultivariateOptions {
    /// Variants in bucket order. Their rollout percentages add up to 100.
    #[serde(default)]
    pub variants: Vec<Variant>,
}

/// One value of a multivariate flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    /// Value returned when the variant is selected.
    pub key: String,
    /// Human-readable description.
    #[serde(default)]
    pub name: Option<String>,
    /// Width of this variant's range, in percent. Ranges are laid out in definition order.
    pub rollout_percentage: f64,
}

/// A single targeting condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    /// Property name, cohort marker or flag key, depending on `property_type`.
    pub key: String,
    /// Value to compare against. Cohort id for cohort filters.
    #[serde(default)]
    pub value: serde_json::Value,
    /// Comparison. Defaults to `exact`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub operator: Operator,
    /// What the filter looks at.
    #[serde(rename = "type", default)]
    pub property_type: PropertyType,
    /// Inverts the result. Only used inside cohorts.
    #[serde(default)]
    pub negation: bool,
    /// Group type of a group property filter.
    #[serde(default)]
    pub group_type_index: Option<i32>,
    /// For `type = "flag"` filters: the flags to evaluate first, in order. An empty chain means
    /// the server found a dependency cycle.
    #[serde(default)]
    pub dependency_chain: Option<Vec<String>>,
}

/// Source of the value a [`PropertyFilter`] is matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    /// A person property from the evaluation context.
    #[default]
    Person,
    /// A property of the group the flag aggregates by.
    Group,
    /// Membership in a cohort served with the definitions.
    Cohort,
    /// The value of another flag.
    Flag,
    /// Anything else. Always inconclusive.
    #[serde(other)]
    Unknown,
}

/// Comparison applied by a [`PropertyFilter`]. Variants map to their snake case wire names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Operator {
    #[default]
    Exact,
    IsNot,
    IsSet,
    IsNotSet,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    IsDateBefore,
    IsDateAfter,
    SemverEq,
    SemverNeq,
    SemverGt,
    SemverGte,
    SemverLt,
    SemverLte,
    FlagEvaluatesTo,
    /// An operator this SDK version doesn't know. Always inconclusive.
    #[serde(other)]
    Unknown,
}

/// A (possibly nested) AND/OR group of property filters. Cohorts are served in this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyGroup {
    /// How members are combined.
    #[serde(rename = "type")]
    pub group_type: GroupType,
    /// Members of the group.
    #[serde(default)]
    pub values: PropertyGroupValues,
}

/// Combinator of a [`PropertyGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupType {
    /// Every member must match.
    #[serde(rename = "AND")]
    And,
    /// At least one member must match.
    #[serde(rename = "OR")]
    Or,
}

/// Members of a [`PropertyGroup`]: either nested groups or leaf filters, never mixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyGroupValues {
    /// Nested groups.
    Groups(Vec<PropertyGroup>),
    /// Leaf filters.
    Filters(Vec<PropertyFilter>),
}

impl Default for PropertyGroupValues {
    fn default() -> Self {
        PropertyGroupValues::Filters(Vec::new())
    }
}

impl FlagDefinition {
    pub(crate) fn variants(&self) -> &[Variant] {
        self.filters
            .multivariate
            .as_ref()
            .map(|m| m.variants.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn has_variant(&self, key: &str) -> bool {
        self.variants().iter().any(|v| v.key == key)
    }
}

/// The server sends `null` for some empty collections.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
