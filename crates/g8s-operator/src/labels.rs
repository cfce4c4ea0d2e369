//! Syntax checks for Kubernetes label keys and values.
//!
//! A key has the format `(<PREFIX>/)<NAME>`, the allowed characters are
//! described in the [Kubernetes documentation][k8s-labels].
//!
//! [k8s-labels]: https://kubernetes.io/docs/concepts/overview/working-with-objects/labels/
use std::sync::LazyLock;

use regex::Regex;
use snafu::{ResultExt, Snafu, ensure};

const KEY_PREFIX_MAX_LEN: usize = 253;
const KEY_NAME_MAX_LEN: usize = 63;
const LABEL_VALUE_MAX_LEN: usize = 63;

// Lazily initialized regular expressions
static KEY_PREFIX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z](\.?[a-zA-Z0-9-])*\.[a-zA-Z]{2,}\.?$")
        .expect("failed to compile key prefix regex")
});

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9A-Z]([a-z0-9A-Z-_.]*[a-z0-9A-Z]+)?$")
        .expect("failed to compile label name regex")
});

#[derive(Debug, PartialEq, Snafu)]
pub enum KeyError {
    #[snafu(display("key input cannot be empty"))]
    EmptyInput,

    /// The input contains more than one slash, e.g. `g8s.io/nested/name`.
    #[snafu(display("key prefixes cannot be nested, only use a single slash"))]
    NestedPrefix,

    #[snafu(display("prefix segment of key cannot be empty"))]
    PrefixEmpty,

    #[snafu(display(
        "prefix segment of key exceeds the maximum length - expected 253 characters or less, got {length}"
    ))]
    PrefixTooLong { length: usize },

    #[snafu(display("prefix segment of key violates kubernetes format"))]
    PrefixInvalid,

    #[snafu(display("failed to parse key name"))]
    Name { source: NameError },
}

#[derive(Debug, PartialEq, Snafu)]
pub enum NameError {
    #[snafu(display("name segment cannot be empty"))]
    NameEmpty,

    #[snafu(display(
        "name segment exceeds the maximum length - expected 63 characters or less, got {length}"
    ))]
    NameTooLong { length: usize },

    #[snafu(display("name segment contains non-ascii characters"))]
    NameNotAscii,

    #[snafu(display("name segment violates kubernetes format"))]
    NameInvalid,
}

#[derive(Debug, PartialEq, Snafu)]
pub enum ValueError {
    #[snafu(display(
        "value exceeds the maximum length - expected 63 characters or less, got {length}"
    ))]
    ValueTooLong { length: usize },

    #[snafu(display("value contains non-ascii characters"))]
    ValueNotAscii,

    #[snafu(display("value violates kubernetes format"))]
    ValueInvalid,
}

/// Checks that `input` is a valid label key.
pub fn validate_key(input: &str) -> Result<(), KeyError> {
    ensure!(!input.is_empty(), EmptyInputSnafu);

    let parts = input.split('/').collect::<Vec<_>>();
    let (prefix, name) = match parts[..] {
        [name] => (None, name),
        [prefix, name] => (Some(prefix), name),
        _ => return NestedPrefixSnafu.fail(),
    };

    if let Some(prefix) = prefix {
        ensure!(!prefix.is_empty(), PrefixEmptySnafu);
        ensure!(prefix.len() <= KEY_PREFIX_MAX_LEN, PrefixTooLongSnafu {
            length: prefix.len()
        });
        ensure!(
            prefix.is_ascii() && KEY_PREFIX_REGEX.is_match(prefix),
            PrefixInvalidSnafu
        );
    }
    validate_name(name).context(NameSnafu)
}

fn validate_name(input: &str) -> Result<(), NameError> {
    ensure!(!input.is_empty(), NameEmptySnafu);
    ensure!(input.len() <= KEY_NAME_MAX_LEN, NameTooLongSnafu {
        length: input.len()
    });
    ensure!(input.is_ascii(), NameNotAsciiSnafu);
    ensure!(NAME_REGEX.is_match(input), NameInvalidSnafu);
    Ok(())
}

/// Checks that `input` is a valid label value. Empty values are valid.
pub fn validate_value(input: &str) -> Result<(), ValueError> {
    ensure!(input.len() <= LABEL_VALUE_MAX_LEN, ValueTooLongSnafu {
        length: input.len()
    });
    ensure!(input.is_ascii(), ValueNotAsciiSnafu);
    ensure!(
        input.is_empty() || NAME_REGEX.is_match(input),
        ValueInvalidSnafu
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("app")]
    #[case("app.kubernetes.io/name")]
    #[case("g8s.io/team_a.b-c")]
    #[case("A1")]
    fn valid_keys(#[case] input: &str) {
        assert_eq!(validate_key(input), Ok(()));
    }

    #[rstest]
    #[case("", KeyError::EmptyInput)]
    #[case("a/b/c", KeyError::NestedPrefix)]
    #[case("/name", KeyError::PrefixEmpty)]
    #[case("no_dots/name", KeyError::PrefixInvalid)]
    #[case("bad key!", KeyError::Name { source: NameError::NameInvalid })]
    #[case("app.kubernetes.io/", KeyError::Name { source: NameError::NameEmpty })]
    #[case("-app", KeyError::Name { source: NameError::NameInvalid })]
    #[case("ä", KeyError::Name { source: NameError::NameNotAscii })]
    fn invalid_keys(#[case] input: &str, #[case] error: KeyError) {
        assert_eq!(validate_key(input), Err(error));
    }

    #[test]
    fn long_key_segments_are_rejected() {
        assert_eq!(
            validate_key(&"a".repeat(64)),
            Err(KeyError::Name {
                source: NameError::NameTooLong { length: 64 }
            })
        );
        assert_eq!(
            validate_key(&format!("{}.io/app", "a".repeat(251))),
            Err(KeyError::PrefixTooLong { length: 254 })
        );
    }

    #[rstest]
    #[case("")]
    #[case("payments")]
    #[case("v1.2_3-rc")]
    fn valid_values(#[case] input: &str) {
        assert_eq!(validate_value(input), Ok(()));
    }

    #[rstest]
    #[case("a".repeat(64), ValueError::ValueTooLong { length: 64 })]
    #[case("foo-".to_owned(), ValueError::ValueInvalid)]
    #[case("not a valid value?".to_owned(), ValueError::ValueInvalid)]
    #[case("ä".to_owned(), ValueError::ValueNotAscii)]
    fn invalid_values(#[case] input: String, #[case] error: ValueError) {
        assert_eq!(validate_value(&input), Err(error));
    }
}
