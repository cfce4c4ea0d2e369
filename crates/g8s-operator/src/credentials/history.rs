use super::{Fields, Generation};

/// Every generation of a credential ever produced, newest first.
///
/// Encoded as index-suffixed fields (`password-0`, `password-1`, ...). For
/// kinds with several fields the index cycles across the field group, so
/// generation `i` of an SSH key pair is `ssh.pub-i` plus `ssh.key-i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct History {
    fields: &'static [&'static str],
    generations: Vec<Generation>,
}

impl History {
    pub fn new(fields: &'static [&'static str]) -> Self {
        Self {
            fields,
            generations: Vec::new(),
        }
    }

    /// Decodes the data of a history secret. Decoding stops at the first
    /// generation with a missing field.
    pub fn from_fields(fields: &'static [&'static str], data: &Fields) -> Self {
        let mut history = Self::new(fields);
        for index in 0.. {
            let generation: Option<Generation> = fields
                .iter()
                .map(|field| {
                    data.get(&indexed(field, index))
                        .map(|value| ((*field).to_owned(), value.clone()))
                })
                .collect();

            match generation {
                Some(generation) => history.generations.push(generation),
                None => break,
            }
        }
        history
    }

    /// Rebuilds a single-generation history from the data of a backend
    /// secret. The history stays empty if the backend lacks any field.
    pub fn from_backend(fields: &'static [&'static str], backend: &Fields) -> Self {
        let mut history = Self::new(fields);
        let generation: Option<Generation> = fields
            .iter()
            .map(|field| {
                backend
                    .get(*field)
                    .map(|value| ((*field).to_owned(), value.clone()))
            })
            .collect();

        if let Some(generation) = generation {
            history.generations.push(generation);
        }
        history
    }

    /// Prepends `generation`, shifting every older generation up by one.
    pub fn rotate(&mut self, generation: Generation) {
        self.generations.insert(0, generation);
    }

    /// Generation 0.
    pub fn newest(&self) -> Option<&Generation> {
        self.generations.first()
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn to_fields(&self) -> Fields {
        self.generations
            .iter()
            .enumerate()
            .flat_map(|(index, generation)| {
                self.fields.iter().filter_map(move |field| {
                    generation
                        .get(*field)
                        .map(|value| (indexed(field, index), value.clone()))
                })
            })
            .collect()
    }
}

fn indexed(field: &str, index: usize) -> String {
    format!("{field}-{index}")
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SSH_FIELDS: &[&str] = &["ssh.pub", "ssh.key"];
    const TLS_FIELDS: &[&str] = &["key.pem", "cert.pem", "cacert.pem"];

    fn generation(fields: &[&str], tag: usize) -> Generation {
        fields
            .iter()
            .map(|field| ((*field).to_owned(), format!("{field}@{tag}")))
            .collect()
    }

    #[rstest]
    #[case::login(&["password"])]
    #[case::ssh(SSH_FIELDS)]
    #[case::tls(TLS_FIELDS)]
    fn rotation_grows_by_one_field_group(#[case] fields: &'static [&'static str]) {
        let mut history = History::new(fields);

        for rotation in 1..=5 {
            history.rotate(generation(fields, rotation));

            let encoded = history.to_fields();
            assert_eq!(encoded.len(), rotation * fields.len());
            assert_eq!(history.newest(), Some(&generation(fields, rotation)));
            for field in fields {
                assert_eq!(encoded[&format!("{field}-0")], format!("{field}@{rotation}"));
            }
        }
    }

    #[test]
    fn older_generations_shift_up() {
        let mut history = History::new(SSH_FIELDS);
        history.rotate(generation(SSH_FIELDS, 1));
        history.rotate(generation(SSH_FIELDS, 2));

        let encoded = history.to_fields();
        assert_eq!(encoded["ssh.pub-0"], "ssh.pub@2");
        assert_eq!(encoded["ssh.key-1"], "ssh.key@1");
    }

    #[test]
    fn decoding_stops_at_incomplete_generation() {
        let data: Fields = [
            ("key.pem-0", "k0"),
            ("cert.pem-0", "c0"),
            ("cacert.pem-0", "ca0"),
            ("key.pem-1", "k1"),
            ("cert.pem-1", "c1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let history = History::from_fields(TLS_FIELDS, &data);
        assert_eq!(history.len(), 1);
        assert_eq!(history.newest().unwrap()["cert.pem"], "c0");
    }

    #[test]
    fn round_trips_through_fields() {
        let mut history = History::new(TLS_FIELDS);
        history.rotate(generation(TLS_FIELDS, 1));
        history.rotate(generation(TLS_FIELDS, 2));

        assert_eq!(History::from_fields(TLS_FIELDS, &history.to_fields()), history);
    }

    #[test]
    fn backend_reconstruction_ignores_extra_fields() {
        let backend: Fields = [("username", "admin"), ("password", "p")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();

        let history = History::from_backend(&["password"], &backend);
        assert_eq!(history.to_fields(), Fields::from([("password-0".to_owned(), "p".to_owned())]));

        let history = History::from_backend(SSH_FIELDS, &backend);
        assert!(history.is_empty());
    }
}
