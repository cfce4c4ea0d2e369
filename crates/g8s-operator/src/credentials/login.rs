use std::collections::BTreeSet;

use rand::Rng as _;

use super::{Credential, Fields, Generation, Result};
use crate::crd::{Login, ResourceKind};

const DEFAULT_PASSWORD_LENGTH: usize = 27;
const DEFAULT_CHARACTER_SET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

impl Credential for Login {
    const BACKEND_SECRET_TYPE: &'static str = "kubernetes.io/basic-auth";
    const FIELDS: &'static [&'static str] = &["password"];
    const KIND: ResourceKind = ResourceKind::Login;

    fn generate(&self) -> Result<Generation> {
        let policy = self.spec.password.as_ref();
        let length = policy
            .and_then(|policy| policy.length)
            .filter(|length| *length > 0)
            .map_or(DEFAULT_PASSWORD_LENGTH, usize::from);
        let character_set = policy
            .and_then(|policy| policy.character_set.as_deref())
            .filter(|set| !set.is_empty())
            .unwrap_or(DEFAULT_CHARACTER_SET);

        Ok(Generation::from([(
            "password".to_owned(),
            generate_password(length, character_set),
        )]))
    }

    fn backend_fields(&self, newest: &Generation) -> Fields {
        let mut fields = newest.clone();
        fields.insert("username".to_owned(), self.spec.username.clone());
        fields
    }
}

/// Draws `length` characters uniformly from the distinct characters of
/// `character_set`.
fn generate_password(length: usize, character_set: &str) -> String {
    let characters: Vec<char> = character_set
        .chars()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if characters.is_empty() {
        return String::new();
    }

    let mut rng = rand::rng();
    (0..length)
        .filter_map(|_| characters.get(rng.random_range(0..characters.len())))
        .collect()
}

#[cfg(test)]
mod tests {
    use kube::core::ObjectMeta;

    use super::*;
    use crate::crd::{LoginSpec, PasswordSpec};

    fn login(password: Option<PasswordSpec>) -> Login {
        Login {
            metadata: ObjectMeta::default(),
            spec: LoginSpec {
                username: "admin".to_owned(),
                password,
            },
            status: None,
        }
    }

    #[test]
    fn defaults_to_27_alphanumerics() {
        let generation = login(None).generate().unwrap();
        let password = &generation["password"];

        assert_eq!(password.len(), 27);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn zero_length_falls_back_to_default() {
        let generation = login(Some(PasswordSpec {
            length: Some(0),
            character_set: Some(String::new()),
        }))
        .generate()
        .unwrap();

        assert_eq!(generation["password"].len(), DEFAULT_PASSWORD_LENGTH);
    }

    #[test]
    fn honours_policy() {
        let generation = login(Some(PasswordSpec {
            length: Some(64),
            character_set: Some("ab!".to_owned()),
        }))
        .generate()
        .unwrap();
        let password = &generation["password"];

        assert_eq!(password.chars().count(), 64);
        assert!(password.chars().all(|c| "ab!".contains(c)));
    }

    #[test]
    fn backend_carries_username() {
        let login = login(None);
        let newest = Generation::from([("password".to_owned(), "p".to_owned())]);

        assert_eq!(
            login.backend_fields(&newest),
            Fields::from([
                ("password".to_owned(), "p".to_owned()),
                ("username".to_owned(), "admin".to_owned()),
            ])
        );
    }
}
