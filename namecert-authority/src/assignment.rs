//! Name-assignment policy for the probe handler.
//!
//! A policy maps the requester's probe parameters to candidate name
//! suffixes under the authority prefix. Zero candidates means the probe
//! is answered with NO_AVAILABLE_NAMES.

use namecert_core::Name;
use rand::RngCore;

use crate::config::AssignmentKind;

pub trait NameAssignment: Send + Sync {
    /// Candidate suffixes for the given probe parameters.
    fn assign(&self, parameters: &[(String, String)]) -> Vec<Name>;
}

/// One suffix built from the parameter values in configured key order;
/// nothing if any configured key is missing or empty.
pub struct ParamAssignment {
    keys: Vec<String>,
}

impl ParamAssignment {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }
}

impl NameAssignment for ParamAssignment {
    fn assign(&self, parameters: &[(String, String)]) -> Vec<Name> {
        if self.keys.is_empty() {
            return Vec::new();
        }
        let mut suffix = Name::new();
        for key in &self.keys {
            let Some((_, value)) = parameters.iter().find(|(k, _)| k == key) else {
                return Vec::new();
            };
            if value.is_empty() {
                return Vec::new();
            }
            suffix = suffix.child(value);
        }
        vec![suffix]
    }
}

/// A random 64-bit suffix, independent of the parameters.
pub struct RandomAssignment;

impl NameAssignment for RandomAssignment {
    fn assign(&self, _parameters: &[(String, String)]) -> Vec<Name> {
        vec![Name::new().child(&rand::rngs::OsRng.next_u64().to_string())]
    }
}

/// Instantiate the configured policy.
pub fn from_config(kind: AssignmentKind, probe_keys: Vec<String>) -> Box<dyn NameAssignment> {
    match kind {
        AssignmentKind::Param => Box::new(ParamAssignment::new(probe_keys)),
        AssignmentKind::Random => Box::new(RandomAssignment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn param_assignment_joins_values_in_key_order() {
        let policy = ParamAssignment::new(vec!["group".into(), "user".into()]);
        let names = policy.assign(&params(&[("user", "alice"), ("group", "lab")]));
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].to_string(), "/lab/alice");
    }

    #[test]
    fn param_assignment_requires_every_key() {
        let policy = ParamAssignment::new(vec!["group".into(), "user".into()]);
        assert!(policy.assign(&params(&[("user", "alice")])).is_empty());
        assert!(policy
            .assign(&params(&[("user", "alice"), ("group", "")]))
            .is_empty());
    }

    #[test]
    fn param_assignment_with_no_keys_yields_nothing() {
        let policy = ParamAssignment::new(Vec::new());
        assert!(policy.assign(&params(&[("user", "alice")])).is_empty());
    }

    #[test]
    fn random_assignment_always_yields_one() {
        let policy = RandomAssignment;
        let names = policy.assign(&[]);
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].len(), 1);
    }
}
