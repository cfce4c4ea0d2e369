use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use snafu::{ResultExt, Snafu};

use crate::labels::{self, KeyError, ValueError};

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    BinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    UnaryOperatorWithValues { operator: String },

    #[snafu(display("label selector has an invalid operator {operator:?}"))]
    InvalidOperator { operator: String },

    #[snafu(display("label selector has an invalid key {key:?}"))]
    InvalidKey { source: KeyError, key: String },

    #[snafu(display("label selector has an invalid value {value:?} for key {key:?}"))]
    InvalidValue {
        source: ValueError,
        key: String,
        value: String,
    },
}

fn validate_pair(key: &str, value: &str) -> Result<()> {
    labels::validate_key(key).context(InvalidKeySnafu { key })?;
    labels::validate_value(value).context(InvalidValueSnafu { key, value })
}

/// Parsed form of a single selector requirement.
#[derive(Debug, PartialEq, Eq)]
enum Requirement<'a> {
    In(&'a str, &'a [String]),
    NotIn(&'a str, &'a [String]),
    Exists(&'a str),
    DoesNotExist(&'a str),
}

impl<'a> Requirement<'a> {
    fn parse(requirement: &'a LabelSelectorRequirement) -> Result<Self> {
        let key = requirement.key.as_str();
        labels::validate_key(key).context(InvalidKeySnafu { key })?;
        let values = requirement.values.as_deref().unwrap_or_default();
        for value in values {
            labels::validate_value(value).context(InvalidValueSnafu { key, value })?;
        }

        match requirement.operator.as_str() {
            operator @ ("In" | "NotIn") if values.is_empty() => {
                BinaryOperatorWithoutValuesSnafu { operator }.fail()
            }
            operator @ ("Exists" | "DoesNotExist") if !values.is_empty() => {
                UnaryOperatorWithValuesSnafu { operator }.fail()
            }
            "In" => Ok(Self::In(key, values)),
            "NotIn" => Ok(Self::NotIn(key, values)),
            "Exists" => Ok(Self::Exists(key)),
            "DoesNotExist" => Ok(Self::DoesNotExist(key)),
            operator => InvalidOperatorSnafu { operator }.fail(),
        }
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::In(key, values) => labels
                .get(*key)
                .is_some_and(|value| values.contains(value)),
            Self::NotIn(key, values) => labels
                .get(*key)
                .is_none_or(|value| !values.contains(value)),
            Self::Exists(key) => labels.contains_key(*key),
            Self::DoesNotExist(key) => !labels.contains_key(*key),
        }
    }
}

/// This trait extends the functionality of [`LabelSelector`].
pub trait LabelSelectorExt {
    /// Returns the first malformed `matchLabels` pair or `matchExpressions`
    /// requirement, if any.
    fn validate(&self) -> Result<()>;

    /// Returns `true` if every `matchLabels` pair and every
    /// `matchExpressions` requirement holds for `labels`.
    ///
    /// Selectors without any requirement and malformed selectors never
    /// match, unlike the Kubernetes convention where an empty selector
    /// selects everything.
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool;
}

impl LabelSelectorExt for LabelSelector {
    fn validate(&self) -> Result<()> {
        self.match_labels
            .iter()
            .flatten()
            .try_for_each(|(key, value)| validate_pair(key, value))?;
        self.match_expressions
            .iter()
            .flatten()
            .try_for_each(|requirement| Requirement::parse(requirement).map(|_| ()))
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let match_labels = self.match_labels.as_ref();
        if match_labels
            .into_iter()
            .flatten()
            .any(|(key, value)| validate_pair(key, value).is_err())
        {
            return false;
        }
        let expressions: Result<Vec<_>> = self
            .match_expressions
            .iter()
            .flatten()
            .map(Requirement::parse)
            .collect();
        let Ok(expressions) = expressions else {
            return false;
        };

        if match_labels.is_none_or(BTreeMap::is_empty) && expressions.is_empty() {
            return false;
        }

        match_labels
            .into_iter()
            .flatten()
            .all(|(key, value)| labels.get(key) == Some(value))
            && expressions
                .iter()
                .all(|requirement| requirement.matches(labels))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_owned(),
            operator: operator.to_owned(),
            values: (!values.is_empty())
                .then(|| values.iter().map(|value| (*value).to_owned()).collect()),
        }
    }

    fn selector(
        match_labels: &[(&str, &str)],
        match_expressions: Vec<LabelSelectorRequirement>,
    ) -> LabelSelector {
        LabelSelector {
            match_labels: (!match_labels.is_empty()).then(|| labels(match_labels)),
            match_expressions: (!match_expressions.is_empty()).then_some(match_expressions),
        }
    }

    #[rstest]
    #[case::match_labels(selector(&[("app", "payments")], vec![]), true)]
    #[case::match_labels_mismatch(selector(&[("app", "other")], vec![]), false)]
    #[case::in_(selector(&[], vec![requirement("tier", "In", &["web", "api"])]), true)]
    #[case::not_in(selector(&[], vec![requirement("tier", "NotIn", &["web"])]), false)]
    #[case::not_in_absent_key(selector(&[], vec![requirement("zone", "NotIn", &["a"])]), true)]
    #[case::exists(selector(&[], vec![requirement("tier", "Exists", &[])]), true)]
    #[case::does_not_exist(selector(&[], vec![requirement("tier", "DoesNotExist", &[])]), false)]
    #[case::combined(
        selector(&[("app", "payments")], vec![requirement("tier", "In", &["api"])]),
        false
    )]
    #[case::empty(selector(&[], vec![]), false)]
    #[case::invalid(selector(&[("app", "payments")], vec![requirement("tier", "Like", &["web"])]), false)]
    fn selector_matching(#[case] selector: LabelSelector, #[case] expected: bool) {
        let pod_labels = labels(&[("app", "payments"), ("tier", "web")]);

        assert_eq!(selector.matches(&pod_labels), expected);
    }

    #[rstest]
    #[case(requirement("tier", "In", &[]), SelectorError::BinaryOperatorWithoutValues { operator: "In".to_owned() })]
    #[case(requirement("tier", "Exists", &["web"]), SelectorError::UnaryOperatorWithValues { operator: "Exists".to_owned() })]
    #[case(requirement("tier", "Like", &["web"]), SelectorError::InvalidOperator { operator: "Like".to_owned() })]
    #[case(
        requirement("", "Exists", &[]),
        SelectorError::InvalidKey { source: KeyError::EmptyInput, key: String::new() }
    )]
    #[case(
        requirement("tier", "In", &["web", "not a valid value?"]),
        SelectorError::InvalidValue {
            source: ValueError::ValueInvalid,
            key: "tier".to_owned(),
            value: "not a valid value?".to_owned(),
        }
    )]
    fn invalid_selectors(#[case] requirement: LabelSelectorRequirement, #[case] expected: SelectorError) {
        assert_eq!(selector(&[], vec![requirement]).validate(), Err(expected));
    }

    #[rstest]
    #[case::bad_key(&[("bad key!", "payments")], "bad key!")]
    #[case::bad_value(&[("app", "not a valid value?")], "app")]
    #[case::both(&[("bad key!", "not a valid value?")], "bad key!")]
    fn invalid_match_labels(#[case] match_labels: &[(&str, &str)], #[case] offending_key: &str) {
        let selector = selector(match_labels, vec![]);

        let err = selector.validate().unwrap_err();
        assert!(matches!(
            err,
            SelectorError::InvalidKey { ref key, .. } | SelectorError::InvalidValue { ref key, .. }
                if key == offending_key
        ));
        assert!(!selector.matches(&labels(match_labels)));
    }

    #[test]
    fn empty_selector_is_valid() {
        assert_eq!(LabelSelector::default().validate(), Ok(()));
    }
}
