//! Return-code policy and input localization (spec.md §4.E).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `continueOnReturnCode` as spec.md §4.E defines it: a bool, an
/// explicit set, or an inclusive range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReturnCodePolicy {
    Bool(bool),
    Set(Vec<i32>),
    Range { min: i32, max: i32 },
}

impl Default for ReturnCodePolicy {
    fn default() -> Self {
        Self::Set(vec![0])
    }
}

impl ReturnCodePolicy {
    pub fn accepts(&self, code: i32) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Set(codes) => codes.contains(&code),
            Self::Range { min, max } => code >= *min && code <= *max,
        }
    }
}

/// Outcome of applying the return-code + `failOnStderr` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcomeVerdict {
    Success,
    Failure,
    /// Return code file missing or unparsable — a bounded-retryable I/O
    /// failure (spec.md §4.E), not a task failure.
    UndefinedReturnCode,
}

/// Apply `continueOnReturnCode` and `failOnStderr` (spec.md §4.E).
pub fn apply_return_code_policy(
    return_code: Option<i32>,
    stderr_size: u64,
    policy: &ReturnCodePolicy,
    fail_on_stderr: bool,
) -> CallOutcomeVerdict {
    let Some(code) = return_code else {
        return CallOutcomeVerdict::UndefinedReturnCode;
    };
    if fail_on_stderr && stderr_size > 0 {
        return CallOutcomeVerdict::Failure;
    }
    if policy.accepts(code) {
        CallOutcomeVerdict::Success
    } else {
        CallOutcomeVerdict::Failure
    }
}

/// Map every file-valued input to a backend-local path (spec.md §4.E
/// "Inputs localization"). The engine computes the mapping; the backend
/// may rewrite it (e.g. substituting a container mount path) before
/// dispatch — this function only produces the engine's proposal.
pub fn localize_inputs(
    inputs: &serde_json::Map<String, serde_json::Value>,
    is_file_valued: impl Fn(&str) -> bool,
    local_root: &str,
) -> BTreeMap<String, (String, Option<String>)> {
    let mut mapping = BTreeMap::new();
    for (name, value) in inputs {
        if let Some(remote_path) = value.as_str() {
            if is_file_valued(name) {
                let file_name = remote_path.rsplit('/').next().unwrap_or(remote_path);
                let local_path = format!("{local_root}/{file_name}");
                mapping.insert(remote_path.to_string(), (local_path, None));
            }
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_accepts_only_zero() {
        let policy = ReturnCodePolicy::default();
        assert!(policy.accepts(0));
        assert!(!policy.accepts(1));
    }

    #[test]
    fn range_policy() {
        let policy = ReturnCodePolicy::Range { min: 0, max: 2 };
        assert!(policy.accepts(0));
        assert!(policy.accepts(2));
        assert!(!policy.accepts(3));
    }

    #[test]
    fn bool_true_accepts_everything() {
        let policy = ReturnCodePolicy::Bool(true);
        assert!(policy.accepts(137));
    }

    #[test]
    fn fail_on_stderr_overrides_accepted_code() {
        let policy = ReturnCodePolicy::default();
        let verdict = apply_return_code_policy(Some(0), 10, &policy, true);
        assert_eq!(verdict, CallOutcomeVerdict::Failure);
    }

    #[test]
    fn missing_return_code_is_undefined() {
        let policy = ReturnCodePolicy::default();
        let verdict = apply_return_code_policy(None, 0, &policy, false);
        assert_eq!(verdict, CallOutcomeVerdict::UndefinedReturnCode);
    }

    #[test]
    fn localize_inputs_maps_file_valued_entries() {
        let mut inputs = serde_json::Map::new();
        inputs.insert(
            "genome".into(),
            serde_json::Value::String("s3://bucket/genome.fa".into()),
        );
        inputs.insert("threads".into(), serde_json::Value::from(4));

        let mapping = localize_inputs(&inputs, |name| name == "genome", "/cromwell-executions/call/inputs");
        assert_eq!(mapping.len(), 1);
        let (local_path, mount) = mapping.get("s3://bucket/genome.fa").unwrap();
        assert_eq!(local_path, "/cromwell-executions/call/inputs/genome.fa");
        assert!(mount.is_none());
    }
}
