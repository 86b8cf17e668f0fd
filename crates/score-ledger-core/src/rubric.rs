use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{Criteria, ScoreCandidate};
use crate::{FieldIssue, LedgerError, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionSpec {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

/// Which criteria each judge role is responsible for, and their valid ranges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringRubric {
    pub rubric_version: u32,
    pub criteria: Vec<CriterionSpec>,
    pub roles: BTreeMap<String, Vec<String>>,
}

impl ScoringRubric {
    #[must_use]
    pub fn v1() -> Self {
        let criterion = |name: &str| CriterionSpec {
            name: name.to_string(),
            min: 1.0,
            max: 10.0,
        };
        let technical = ["whipStrikes", "rhythm", "tempo"];
        let artistic = ["choreography", "presentation", "difficulty"];

        let mut roles = BTreeMap::new();
        roles.insert(
            "technical".to_string(),
            technical.iter().map(ToString::to_string).collect(),
        );
        roles.insert(
            "artistic".to_string(),
            artistic.iter().map(ToString::to_string).collect(),
        );
        roles.insert(
            "head".to_string(),
            technical
                .iter()
                .chain(artistic.iter())
                .map(ToString::to_string)
                .collect(),
        );

        Self {
            rubric_version: 1,
            criteria: technical
                .iter()
                .chain(artistic.iter())
                .map(|name| criterion(name))
                .collect(),
            roles,
        }
    }

    /// Validates criterion ranges and role assignments.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a range is empty or not
    /// finite, a name repeats, or a role references an unknown criterion.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.rubric_version == 0 {
            return Err(LedgerError::Configuration(
                "rubric_version MUST be >= 1".to_string(),
            ));
        }

        if self.criteria.is_empty() {
            return Err(LedgerError::Configuration(
                "rubric MUST declare at least one criterion".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        for criterion in &self.criteria {
            if criterion.name.trim().is_empty() {
                return Err(LedgerError::Configuration(
                    "criterion name MUST NOT be empty".to_string(),
                ));
            }
            if !names.insert(criterion.name.as_str()) {
                return Err(LedgerError::Configuration(format!(
                    "criterion {} is declared twice",
                    criterion.name
                )));
            }
            if !criterion.min.is_finite()
                || !criterion.max.is_finite()
                || criterion.min > criterion.max
            {
                return Err(LedgerError::Configuration(format!(
                    "criterion {} MUST have finite min <= max",
                    criterion.name
                )));
            }
        }

        if self.roles.is_empty() {
            return Err(LedgerError::Configuration(
                "rubric MUST declare at least one judge role".to_string(),
            ));
        }

        for (role, assigned) in &self.roles {
            if assigned.is_empty() {
                return Err(LedgerError::Configuration(format!(
                    "role {role} MUST be responsible for at least one criterion"
                )));
            }
            let mut seen = BTreeSet::new();
            for name in assigned {
                if !names.contains(name.as_str()) {
                    return Err(LedgerError::Configuration(format!(
                        "role {role} references unknown criterion {name}"
                    )));
                }
                if !seen.insert(name.as_str()) {
                    return Err(LedgerError::Configuration(format!(
                        "role {role} lists criterion {name} twice"
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn criterion(&self, name: &str) -> Option<&CriterionSpec> {
        self.criteria.iter().find(|criterion| criterion.name == name)
    }

    /// Criteria the role is responsible for, or `None` for an unknown role.
    #[must_use]
    pub fn criteria_for_role(&self, role: &str) -> Option<Vec<&CriterionSpec>> {
        let assigned = self.roles.get(role)?;
        Some(
            assigned
                .iter()
                .filter_map(|name| self.criterion(name))
                .collect(),
        )
    }

    /// Decodes and validates a rubric from JSON.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let rubric: Self = serde_json::from_value(value.clone())
            .map_err(|err| LedgerError::Configuration(format!("invalid rubric JSON: {err}")))?;
        rubric.validate()?;
        Ok(rubric)
    }
}

/// Checks that the candidate carries exactly the criteria its judge role
/// scores, each numeric and within range.
///
/// Returns the typed criteria map on success. All issues are collected so the
/// caller can show them inline at once.
///
/// # Errors
/// Returns [`ValidationError`] listing every offending field.
pub fn validate_payload_shape(
    candidate: &ScoreCandidate,
    rubric: &ScoringRubric,
) -> Result<Criteria, ValidationError> {
    let Some(assigned) = rubric.criteria_for_role(&candidate.judge_role) else {
        return Err(ValidationError::single(
            "judge_role",
            &format!("unknown judge role {:?}", candidate.judge_role),
        ));
    };

    let mut issues = Vec::new();
    let mut criteria = Criteria::new();

    for criterion in &assigned {
        let field = format!("criteria.{}", criterion.name);
        match candidate.criteria.get(&criterion.name) {
            None | Some(Value::Null) => issues.push(FieldIssue::new(
                field,
                format!("is required for role {}", candidate.judge_role),
            )),
            Some(value) => match value.as_f64().filter(|number| number.is_finite()) {
                None => issues.push(FieldIssue::new(field, "must be a number")),
                Some(number) if number < criterion.min || number > criterion.max => {
                    issues.push(FieldIssue::new(
                        field,
                        format!("must be within [{}, {}]", criterion.min, criterion.max),
                    ));
                }
                Some(number) => {
                    criteria.insert(criterion.name.clone(), number);
                }
            },
        }
    }

    for name in candidate.criteria.keys() {
        if !assigned.iter().any(|criterion| &criterion.name == name) {
            issues.push(FieldIssue::new(
                format!("criteria.{name}"),
                format!("is not assigned to role {}", candidate.judge_role),
            ));
        }
    }

    if issues.is_empty() {
        Ok(criteria)
    } else {
        Err(ValidationError { issues })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SubjectType;
    use serde_json::json;

    fn candidate(role: &str, criteria: Value) -> ScoreCandidate {
        let criteria = match criteria {
            Value::Object(map) => map.into_iter().collect(),
            other => panic!("fixture criteria must be an object, got {other}"),
        };
        ScoreCandidate {
            subject_type: SubjectType::Individual,
            subject_id: "5".to_string(),
            judge_id: "J1".to_string(),
            judge_role: role.to_string(),
            tournament_id: "1".to_string(),
            criteria,
        }
    }

    #[test]
    fn v1_rubric_is_valid() {
        assert_eq!(ScoringRubric::v1().validate(), Ok(()));
    }

    #[test]
    fn complete_technical_payload_is_accepted() {
        let result = validate_payload_shape(
            &candidate(
                "technical",
                json!({"whipStrikes": 7, "rhythm": 8, "tempo": 6.5}),
            ),
            &ScoringRubric::v1(),
        );
        let criteria = match result {
            Ok(value) => value,
            Err(err) => panic!("expected valid payload: {err}"),
        };
        assert_eq!(criteria.get("tempo"), Some(&6.5));
        assert_eq!(criteria.len(), 3);
    }

    #[test]
    fn partial_payload_is_rejected_per_field() {
        let result = validate_payload_shape(
            &candidate("technical", json!({"whipStrikes": 7, "rhythm": "8"})),
            &ScoringRubric::v1(),
        );
        let err = match result {
            Ok(_) => panic!("partial payload must be rejected"),
            Err(err) => err,
        };
        assert!(err.has_field("criteria.tempo"));
        assert!(err.has_field("criteria.rhythm"));
        assert!(!err.has_field("criteria.whipStrikes"));
    }

    #[test]
    fn out_of_range_and_foreign_criteria_are_rejected() {
        let result = validate_payload_shape(
            &candidate(
                "technical",
                json!({"whipStrikes": 11, "rhythm": 0, "tempo": 6, "choreography": 5}),
            ),
            &ScoringRubric::v1(),
        );
        let err = match result {
            Ok(_) => panic!("payload must be rejected"),
            Err(err) => err,
        };
        assert!(err.has_field("criteria.whipStrikes"));
        assert!(err.has_field("criteria.rhythm"));
        assert!(err.has_field("criteria.choreography"));
        assert_eq!(err.issues.len(), 3);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let result = validate_payload_shape(
            &candidate("timekeeper", json!({"tempo": 5})),
            &ScoringRubric::v1(),
        );
        match result {
            Ok(_) => panic!("unknown role must be rejected"),
            Err(err) => assert!(err.has_field("judge_role")),
        }
    }

    #[test]
    fn rubric_rejects_dangling_role_reference() {
        let mut rubric = ScoringRubric::v1();
        rubric
            .roles
            .insert("sound".to_string(), vec!["volume".to_string()]);
        assert!(matches!(
            rubric.validate(),
            Err(LedgerError::Configuration(message)) if message.contains("volume")
        ));
    }

    #[test]
    fn rubric_from_json_validates_ranges() {
        let value = json!({
            "rubric_version": 2,
            "criteria": [{"name": "tempo", "min": 10.0, "max": 1.0}],
            "roles": {"technical": ["tempo"]}
        });
        assert!(ScoringRubric::from_json(&value).is_err());
    }
}
