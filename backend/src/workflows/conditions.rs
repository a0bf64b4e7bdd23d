// Workflow Conditions - Evaluates rule conditions against a lead snapshot
//
// Scoring rules, assignment criteria and workflow rules share one condition
// vocabulary. Evaluation is a single match over the closed operator set.

use leadflow_shared::{
    Condition, ConditionGroup, ConditionValue, EngagementKind, Field, Lead, Logic, Operator,
};
use std::fmt;
use thiserror::Error;

use crate::store::EngagementTally;

const NUMBER_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("operator {operator:?} on {field} needs a value")]
    MissingValue { field: Field, operator: Operator },
    #[error("operator {operator:?} cannot compare {field} with {value}")]
    TypeMismatch {
        field: Field,
        operator: Operator,
        value: String,
    },
}

/// A resolved field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Number(n) if n.fract() == 0.0 => write!(f, "{}", *n as i64),
            FieldValue::Number(n) => write!(f, "{}", n),
        }
    }
}

/// What a rule can see of a lead: its columns plus engagement counters
#[derive(Debug, Clone, Copy)]
pub struct LeadFacts<'a> {
    pub lead: &'a Lead,
    pub engagements: &'a [EngagementTally],
}

impl<'a> LeadFacts<'a> {
    pub fn new(lead: &'a Lead, engagements: &'a [EngagementTally]) -> Self {
        Self { lead, engagements }
    }

    fn tally(&self, kind: EngagementKind) -> Option<&EngagementTally> {
        self.engagements.iter().find(|t| t.kind == kind)
    }

    /// `None` when the field is unset or blank
    pub fn value_of(&self, field: Field) -> Option<FieldValue> {
        match field {
            Field::Score => Some(FieldValue::Number(self.lead.score as f64)),
            Field::Owner => self.lead.owner_id.map(|id| FieldValue::Text(id.to_string())),
            Field::Engagement(kind) => {
                let count = self.tally(kind).map(|t| t.count).unwrap_or(0);
                Some(FieldValue::Number(count as f64))
            }
            text => self
                .lead
                .text_value(text)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| FieldValue::Text(v.to_string())),
        }
    }

    /// Latest engagement among the kinds a condition looks at
    pub fn latest_engagement(&self, kinds: &[EngagementKind]) -> Option<chrono::DateTime<chrono::Utc>> {
        kinds
            .iter()
            .filter_map(|kind| self.tally(*kind))
            .map(|t| t.latest_at)
            .max()
    }
}

fn is_numeric(field: Field) -> bool {
    matches!(field, Field::Score | Field::Engagement(_))
}

fn describe(value: &ConditionValue) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}

fn mismatch(condition: &Condition, value: &ConditionValue) -> ConditionError {
    ConditionError::TypeMismatch {
        field: condition.field,
        operator: condition.operator,
        value: describe(value),
    }
}

/// Numeric fields take numbers (or numeric text); text fields take text only
fn expected_number(condition: &Condition, value: &ConditionValue) -> Result<f64, ConditionError> {
    match value {
        ConditionValue::Number(n) => Ok(*n),
        ConditionValue::Text(t) => t.trim().parse().map_err(|_| mismatch(condition, value)),
        _ => Err(mismatch(condition, value)),
    }
}

fn expected_text<'v>(condition: &Condition, value: &'v ConditionValue) -> Result<&'v str, ConditionError> {
    match value {
        ConditionValue::Text(t) => Ok(t),
        _ => Err(mismatch(condition, value)),
    }
}

fn equals(condition: &Condition, actual: &FieldValue, expected: &ConditionValue) -> Result<bool, ConditionError> {
    if is_numeric(condition.field) {
        let expected = expected_number(condition, expected)?;
        return Ok(matches!(actual, FieldValue::Number(n) if (n - expected).abs() < NUMBER_EPSILON));
    }
    let expected = expected_text(condition, expected)?;
    Ok(matches!(actual, FieldValue::Text(s) if s.to_lowercase() == expected.trim().to_lowercase()))
}

fn required<'c>(condition: &'c Condition) -> Result<&'c ConditionValue, ConditionError> {
    condition.value.as_ref().ok_or(ConditionError::MissingValue {
        field: condition.field,
        operator: condition.operator,
    })
}

/// Evaluate one condition. Unset fields never satisfy a comparison except
/// `not_equals` and `is_not_set`.
pub fn evaluate(condition: &Condition, facts: &LeadFacts<'_>) -> Result<bool, ConditionError> {
    let actual = facts.value_of(condition.field);

    match condition.operator {
        Operator::IsSet => Ok(actual.is_some()),
        Operator::IsNotSet => Ok(actual.is_none()),
        Operator::Equals => {
            let expected = required(condition)?;
            match actual {
                Some(actual) => equals(condition, &actual, expected),
                None => equals(condition, &FieldValue::Text(String::new()), expected).map(|_| false),
            }
        }
        Operator::NotEquals => {
            let expected = required(condition)?;
            match actual {
                Some(actual) => equals(condition, &actual, expected).map(|eq| !eq),
                None => equals(condition, &FieldValue::Text(String::new()), expected).map(|_| true),
            }
        }
        Operator::Contains => {
            let expected = required(condition)?;
            if is_numeric(condition.field) {
                return Err(mismatch(condition, expected));
            }
            let needle = expected_text(condition, expected)?.trim().to_lowercase();
            Ok(matches!(actual, Some(FieldValue::Text(s)) if s.to_lowercase().contains(&needle)))
        }
        Operator::GreaterThan | Operator::LessThan => {
            let expected = required(condition)?;
            if !is_numeric(condition.field) {
                return Err(mismatch(condition, expected));
            }
            let bound = expected_number(condition, expected)?;
            Ok(match actual {
                Some(FieldValue::Number(n)) if condition.operator == Operator::GreaterThan => n > bound,
                Some(FieldValue::Number(n)) => n < bound,
                _ => false,
            })
        }
        Operator::InList => {
            let expected = required(condition)?;
            let ConditionValue::List(options) = expected else {
                return Err(mismatch(condition, expected));
            };
            let present = actual.is_some();
            let subject = actual.unwrap_or(FieldValue::Text(String::new()));
            let mut found = false;
            for option in options {
                // Every option is type-checked, even after a hit
                found |= equals(condition, &subject, option)?;
            }
            Ok(found && present)
        }
    }
}

/// Evaluate a group. An empty group matches.
pub fn evaluate_group(group: &ConditionGroup, facts: &LeadFacts<'_>) -> Result<bool, ConditionError> {
    if group.is_empty() {
        return Ok(true);
    }

    let mut results = Vec::with_capacity(group.conditions.len() + group.groups.len());
    for condition in &group.conditions {
        results.push(evaluate(condition, facts)?);
    }
    for nested in &group.groups {
        results.push(evaluate_group(nested, facts)?);
    }

    Ok(match group.logic {
        Logic::All => results.iter().all(|r| *r),
        Logic::Any => results.iter().any(|r| *r),
    })
}

/// Engagement kinds a condition reads
pub fn engagement_kinds(condition: &Condition) -> Vec<EngagementKind> {
    match condition.field {
        Field::Engagement(kind) => vec![kind],
        _ => Vec::new(),
    }
}
