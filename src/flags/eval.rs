use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::definition_store::FlagDefinitions;

use super::{
    decision::{
        decode_payload, DecisionSource, EvaluationContext, EvaluationReason, FlagDecision,
        FlagValue, Properties,
    },
    error::InconclusiveMatchError,
    hasher::{in_rollout, select_variant, RolloutHasher, VARIANT_SALT},
    matcher::{match_property, stringify},
    models::{
        ConditionGroup, FlagDefinition, GroupType, Operator, PropertyFilter, PropertyGroup,
        PropertyGroupValues, PropertyType,
    },
};

/// Evaluate the flag `flag_key` for `context` against `definitions`.
pub fn evaluate_flag<H: RolloutHasher>(
    definitions: &FlagDefinitions,
    hasher: &H,
    flag_key: &str,
    context: &EvaluationContext,
) -> Result<FlagDecision, InconclusiveMatchError> {
    FlagEvaluator::new(definitions, hasher, context).evaluate(flag_key)
}

/// Evaluates flags for a single [`EvaluationContext`].
///
/// Results of flags evaluated as dependencies of other flags are remembered, so evaluating many
/// flags with the same evaluator computes each flag at most once per call to
/// [`FlagEvaluator::evaluate_all`].
pub struct FlagEvaluator<'a, H> {
    definitions: &'a FlagDefinitions,
    hasher: &'a H,
    context: &'a EvaluationContext,
    results: HashMap<String, Evaluation>,
    cohorts_in_progress: HashSet<String>,
}

enum Evaluation {
    /// Currently being computed further up the stack. Seeing it again means a cycle.
    InProgress,
    /// `None` if the flag was inconclusive.
    Done(Option<FlagValue>),
}

enum ConditionOutcome {
    Matched(FlagValue),
    OutOfRollout,
    NotMatched,
}

impl<'a, H: RolloutHasher> FlagEvaluator<'a, H> {
    #[allow(missing_docs)]
    pub fn new(
        definitions: &'a FlagDefinitions,
        hasher: &'a H,
        context: &'a EvaluationContext,
    ) -> FlagEvaluator<'a, H> {
        FlagEvaluator {
            definitions,
            hasher,
            context,
            results: HashMap::new(),
            cohorts_in_progress: HashSet::new(),
        }
    }

    /// Evaluate a single flag.
    pub fn evaluate(&mut self, flag_key: &str) -> Result<FlagDecision, InconclusiveMatchError> {
        let definitions = self.definitions;
        let flag = definitions
            .get(flag_key)
            .ok_or_else(|| InconclusiveMatchError::FlagNotFound(flag_key.to_owned()))?;
        self.evaluate_definition(flag)
    }

    /// Evaluate every defined flag (restricted to [`EvaluationContext::flag_keys`], if set), in
    /// definition order.
    pub fn evaluate_all(&mut self) -> Vec<(String, Result<FlagDecision, InconclusiveMatchError>)> {
        let definitions = self.definitions;
        let context = self.context;
        definitions
            .flags()
            .iter()
            .filter(|flag| context.includes_flag(&flag.key))
            .map(|flag| (flag.key.clone(), self.evaluate_definition(flag)))
            .collect()
    }

    fn evaluate_definition(
        &mut self,
        flag: &FlagDefinition,
    ) -> Result<FlagDecision, InconclusiveMatchError> {
        let result = self.resolve(flag);

        match &result {
            Ok((value, _)) => {
                log::trace!(target: "posthog",
                            flag_key = flag.key.as_str(),
                            distinct_id = self.context.distinct_id.as_str(),
                            value:serde = value;
                            "evaluated a flag locally");
            }
            Err(err) => {
                log::debug!(target: "posthog",
                            flag_key = flag.key.as_str(),
                            distinct_id = self.context.distinct_id.as_str();
                            "flag can't be evaluated locally: {err}");
            }
        }

        let (value, reason) = result?;
        let payload = if value.is_enabled() {
            payload_for(flag, &value)
        } else {
            None
        };

        Ok(FlagDecision {
            key: flag.key.clone(),
            value,
            payload,
            reason,
            source: DecisionSource::Local,
        })
    }

    /// Compute the value of `flag`, recording the result for flags that depend on it.
    fn resolve(
        &mut self,
        flag: &FlagDefinition,
    ) -> Result<(FlagValue, EvaluationReason), InconclusiveMatchError> {
        self.results.insert(flag.key.clone(), Evaluation::InProgress);
        let result = self.compute(flag);
        self.results.insert(
            flag.key.clone(),
            Evaluation::Done(result.as_ref().ok().map(|(value, _)| value.clone())),
        );
        result
    }

    fn compute(
        &mut self,
        flag: &FlagDefinition,
    ) -> Result<(FlagValue, EvaluationReason), InconclusiveMatchError> {
        if !flag.active || flag.deleted {
            return Ok((FlagValue::Boolean(false), EvaluationReason::Disabled));
        }

        if flag.ensure_experience_continuity {
            return Err(InconclusiveMatchError::RequiresServer(flag.key.clone()));
        }

        let definitions = self.definitions;
        let context = self.context;
        let empty = Properties::new();
        let (identifier, properties) = match flag.filters.aggregation_group_type_index {
            None => (context.distinct_id.as_str(), &context.person_properties),
            Some(index) => {
                let group_type = definitions
                    .group_type(index)
                    .ok_or_else(|| InconclusiveMatchError::MissingGroup(index.to_string()))?;
                let group_key = context
                    .groups
                    .get(group_type)
                    .ok_or_else(|| InconclusiveMatchError::MissingGroup(group_type.to_owned()))?;
                let properties = context.group_properties.get(group_type).unwrap_or(&empty);
                (group_key.as_str(), properties)
            }
        };

        let mut out_of_rollout = false;
        let mut inconclusive = None;
        for (condition_index, condition) in flag.filters.groups.iter().enumerate() {
            match self.match_condition(flag, condition, identifier, properties) {
                Ok(ConditionOutcome::Matched(value)) => {
                    return Ok((value, EvaluationReason::ConditionMatch { condition_index }))
                }
                Ok(ConditionOutcome::OutOfRollout) => out_of_rollout = true,
                Ok(ConditionOutcome::NotMatched) => {}
                Err(err) => {
                    inconclusive.get_or_insert(err);
                }
            }
        }

        // "No match" is only definite if every group could be decided.
        if let Some(err) = inconclusive {
            return Err(err);
        }

        Ok((
            FlagValue::Boolean(false),
            EvaluationReason::NoConditionMatch { out_of_rollout },
        ))
    }

    fn match_condition(
        &mut self,
        flag: &FlagDefinition,
        condition: &ConditionGroup,
        identifier: &str,
        properties: &Properties,
    ) -> Result<ConditionOutcome, InconclusiveMatchError> {
        for filter in &condition.properties {
            if !self.match_filter(filter, properties)? {
                return Ok(ConditionOutcome::NotMatched);
            }
        }

        if let Some(rollout_percentage) = condition.rollout_percentage {
            let hash = self.hasher.hash(&flag.key, identifier, "");
            if !in_rollout(hash, rollout_percentage) {
                return Ok(ConditionOutcome::OutOfRollout);
            }
        }

        let value = match condition
            .variant
            .as_deref()
            .filter(|variant| flag.has_variant(variant))
        {
            Some(variant) => FlagValue::Variant(variant.to_owned()),
            None if flag.variants().is_empty() => FlagValue::Boolean(true),
            None => {
                let hash = self.hasher.hash(&flag.key, identifier, VARIANT_SALT);
                select_variant(flag.variants(), hash)
                    .map_or(FlagValue::Boolean(true), |variant| {
                        FlagValue::Variant(variant.key.clone())
                    })
            }
        };

        Ok(ConditionOutcome::Matched(value))
    }

    fn match_filter(
        &mut self,
        filter: &PropertyFilter,
        properties: &Properties,
    ) -> Result<bool, InconclusiveMatchError> {
        match filter.property_type {
            PropertyType::Person | PropertyType::Group => match_property(filter, properties),
            PropertyType::Cohort => self.match_cohort(filter, properties),
            PropertyType::Flag => self.match_dependency(filter),
            PropertyType::Unknown => Err(InconclusiveMatchError::InvalidValue {
                key: filter.key.clone(),
                reason: "unknown property type",
            }),
        }
    }

    fn match_cohort(
        &mut self,
        filter: &PropertyFilter,
        properties: &Properties,
    ) -> Result<bool, InconclusiveMatchError> {
        let cohort_id = stringify(&filter.value);
        let definitions = self.definitions;
        let cohort = definitions
            .cohort(&cohort_id)
            .ok_or_else(|| InconclusiveMatchError::UnknownCohort(cohort_id.clone()))?;

        if !self.cohorts_in_progress.insert(cohort_id.clone()) {
            return Err(InconclusiveMatchError::InvalidValue {
                key: cohort_id,
                reason: "cohort references itself",
            });
        }
        let result = self.match_property_group(cohort, properties);
        self.cohorts_in_progress.remove(&cohort_id);
        result
    }

    fn match_property_group(
        &mut self,
        group: &PropertyGroup,
        properties: &Properties,
    ) -> Result<bool, InconclusiveMatchError> {
        match &group.values {
            PropertyGroupValues::Groups(groups) => combine(
                group.group_type,
                groups
                    .iter()
                    .map(|nested| self.match_property_group(nested, properties)),
            ),
            PropertyGroupValues::Filters(filters) => combine(
                group.group_type,
                filters.iter().map(|filter| {
                    self.match_filter(filter, properties)
                        .map(|matched| matched != filter.negation)
                }),
            ),
        }
    }

    fn match_dependency(&mut self, filter: &PropertyFilter) -> Result<bool, InconclusiveMatchError> {
        let unresolved = || InconclusiveMatchError::UnresolvedDependency(filter.key.clone());

        // An empty chain is how the server reports a cycle.
        let chain = filter.dependency_chain.as_deref().ok_or_else(unresolved)?;
        if chain.is_empty() {
            return Err(unresolved());
        }

        if filter.operator != Operator::FlagEvaluatesTo {
            return Err(InconclusiveMatchError::UnsupportedOperator(format!(
                "{:?} on flag `{}`",
                filter.operator, filter.key
            )));
        }

        // Any disabled flag in the chain fails the condition, whatever value is expected.
        for key in chain {
            if !self.dependency_value(key)?.is_enabled() {
                return Ok(false);
            }
        }

        if filter.value.is_null() {
            return Ok(true);
        }
        let actual = self.dependency_value(&filter.key)?;
        Ok(matches_dependency_value(&filter.value, &actual))
    }

    fn dependency_value(&mut self, flag_key: &str) -> Result<FlagValue, InconclusiveMatchError> {
        let unresolved = || InconclusiveMatchError::UnresolvedDependency(flag_key.to_owned());

        match self.results.get(flag_key) {
            Some(Evaluation::Done(Some(value))) => return Ok(value.clone()),
            Some(Evaluation::Done(None)) | Some(Evaluation::InProgress) => return Err(unresolved()),
            None => {}
        }

        let definitions = self.definitions;
        let flag = definitions.get(flag_key).ok_or_else(unresolved)?;
        self.resolve(flag)
            .map(|(value, _)| value)
            .map_err(|_| unresolved())
    }
}

/// Fold member results of an AND/OR group. A definite answer wins over an inconclusive member
/// (a false member of an AND group, a true member of an OR group).
fn combine(
    group_type: GroupType,
    results: impl Iterator<Item = Result<bool, InconclusiveMatchError>>,
) -> Result<bool, InconclusiveMatchError> {
    let mut inconclusive = None;
    let mut empty = true;

    for result in results {
        empty = false;
        match (group_type, result) {
            (GroupType::And, Ok(false)) => return Ok(false),
            (GroupType::Or, Ok(true)) => return Ok(true),
            (_, Ok(_)) => {}
            (_, Err(err)) => {
                inconclusive.get_or_insert(err);
            }
        }
    }

    match inconclusive {
        Some(err) => Err(err),
        None => Ok(empty || group_type == GroupType::And),
    }
}

/// A variant matches `true` or its own key. A boolean matches the same boolean.
fn matches_dependency_value(expected: &Value, actual: &FlagValue) -> bool {
    match (actual, expected) {
        (FlagValue::Variant(variant), Value::Bool(expected)) => !variant.is_empty() && *expected,
        // Variant keys are case-sensitive.
        (FlagValue::Variant(variant), Value::String(expected)) => variant == expected,
        (FlagValue::Boolean(actual), Value::Bool(expected)) => actual == expected,
        _ => false,
    }
}

fn payload_for(flag: &FlagDefinition, value: &FlagValue) -> Option<Value> {
    flag.filters
        .payloads
        .get(&value.lookup_key())
        .map(decode_payload)
}
