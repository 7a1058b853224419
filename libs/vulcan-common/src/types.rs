use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exit code the sandbox entrypoint uses when it stops on purpose after the
/// snapshot-only path. Anything else non-zero is an application failure.
pub const PURPOSELY_STOPPED_EXIT_CODE: i64 = 42;

/// Terminal classification of a single container run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    Success,
    PurposelyStopped,
    ApplicationError,
    Timeout,
    Internal,
}

impl ContainerStatus {
    /// Translate a raw Docker exit code. Timeouts are decided by the
    /// executor before the container exits and never reach this function.
    pub fn from_exit_code(code: i64) -> Self {
        match code {
            0 => ContainerStatus::Success,
            PURPOSELY_STOPPED_EXIT_CODE => ContainerStatus::PurposelyStopped,
            _ => ContainerStatus::ApplicationError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPurpose {
    ProjectCreation,
    Submission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

/// One per-test record extracted from tool output. Fields are present only
/// when the source text carried them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub test: String,
    pub status: TestStatus,
    #[serde(rename = "gasUsed", skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    #[serde(rename = "gasDiff", skip_serializing_if = "Option::is_none")]
    pub gas_diff: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TestRecord {
    pub fn new(test: impl Into<String>, status: TestStatus) -> Self {
        Self {
            test: test.into(),
            status,
            gas_used: None,
            gas_diff: None,
            reason: None,
        }
    }
}

/// Aggregate block of a parsed test run. Every field is optional; a field is
/// serialized only when it was derivable from the source text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOverall {
    #[serde(rename = "numberOfTests", skip_serializing_if = "Option::is_none")]
    pub number_of_tests: Option<u32>,
    #[serde(rename = "numberOfPassed", skip_serializing_if = "Option::is_none")]
    pub number_of_passed: Option<u32>,
    #[serde(rename = "numberOfFailed", skip_serializing_if = "Option::is_none")]
    pub number_of_failed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(rename = "gasDiffOverall", skip_serializing_if = "Option::is_none")]
    pub gas_diff_overall: Option<i64>,
}

/// Structured result of parsing a sandbox tool's textual output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutput {
    #[serde(default)]
    pub overall: TestOverall,
    #[serde(default)]
    pub tests: Vec<TestRecord>,
}

impl TestOutput {
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty() && self.overall == TestOverall::default()
    }

    /// Names of all tests, in source-text order.
    pub fn test_names(&self) -> Vec<String> {
        self.tests.iter().map(|t| t.test.clone()).collect()
    }

    /// Field-wise union of two outputs. For `overall`, `self` wins when both
    /// sides carry a value. The `tests` sequences are joined by test name:
    /// records present on both sides are merged per-field (`self` wins),
    /// records unique to either side are kept as-is, ordering follows `self`
    /// with `other`-only records appended.
    pub fn merge(mut self, other: TestOutput) -> TestOutput {
        self.overall.number_of_tests = self.overall.number_of_tests.or(other.overall.number_of_tests);
        self.overall.number_of_passed =
            self.overall.number_of_passed.or(other.overall.number_of_passed);
        self.overall.number_of_failed =
            self.overall.number_of_failed.or(other.overall.number_of_failed);
        self.overall.passed = self.overall.passed.or(other.overall.passed);
        self.overall.gas_diff_overall =
            self.overall.gas_diff_overall.or(other.overall.gas_diff_overall);

        for theirs in other.tests {
            match self.tests.iter_mut().find(|t| t.test == theirs.test) {
                Some(ours) => {
                    ours.gas_used = ours.gas_used.or(theirs.gas_used);
                    ours.gas_diff = ours.gas_diff.or(theirs.gas_diff);
                    if ours.reason.is_none() {
                        ours.reason = theirs.reason;
                    }
                }
                None => self.tests.push(theirs),
            }
        }
        self
    }
}

/// Execution arguments forwarded to the sandbox tool. Only a closed set of
/// keys is ever turned into CLI flags; unknown keys are dropped silently so a
/// bad argument cannot break a submission.
pub type ExecutionArgs = BTreeMap<String, String>;

const ARG_WHITELIST: &[(&str, &str)] = &[
    ("matchContract", "--match-contract"),
    ("matchTest", "--match-test"),
    ("matchPath", "--match-path"),
    ("noMatchContract", "--no-match-contract"),
    ("noMatchTest", "--no-match-test"),
    ("noMatchPath", "--no-match-path"),
    ("fuzzRuns", "--fuzz-runs"),
    ("fuzzSeed", "--fuzz-seed"),
];

/// Turn whitelisted execution arguments into `--kebab-case value` pairs.
pub fn args_to_cli_flags(args: &ExecutionArgs) -> Vec<String> {
    let mut flags = Vec::new();
    for (key, flag) in ARG_WHITELIST {
        if let Some(value) = args.get(*key) {
            flags.push((*flag).to_string());
            flags.push(value.clone());
        }
    }
    flags
}

/// Per-request project settings accepted from the HTTP caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(rename = "containerTimeout", skip_serializing_if = "Option::is_none")]
    pub container_timeout: Option<u64>,
    #[serde(
        rename = "testExecutionArguments",
        skip_serializing_if = "Option::is_none"
    )]
    pub test_execution_arguments: Option<ExecutionArgs>,
}

/// Project metadata owned by the runner. The baseline roster is fixed for
/// the life of the image; a rebuild replaces the whole record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub image_id: String,
    pub image_tag: String,
    pub built_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_timeout_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_execution_args: Option<ExecutionArgs>,
    pub baseline_tests: Vec<String>,
}

/// Append-only record of a single container invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerExecution {
    pub id: Uuid,
    pub project_name: String,
    pub purpose: ExecutionPurpose,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: TestOutput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_args: Option<ExecutionArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, gas: Option<u64>, diff: Option<i64>) -> TestRecord {
        TestRecord {
            test: name.to_string(),
            status: TestStatus::Pass,
            gas_used: gas,
            gas_diff: diff,
            reason: None,
        }
    }

    #[test]
    fn merge_prefers_left_overall() {
        let left = TestOutput {
            overall: TestOverall {
                number_of_tests: Some(3),
                ..Default::default()
            },
            tests: vec![],
        };
        let right = TestOutput {
            overall: TestOverall {
                number_of_tests: Some(5),
                gas_diff_overall: Some(-20),
                ..Default::default()
            },
            tests: vec![],
        };

        let merged = left.merge(right);
        assert_eq!(merged.overall.number_of_tests, Some(3));
        assert_eq!(merged.overall.gas_diff_overall, Some(-20));
    }

    #[test]
    fn merge_joins_tests_by_name() {
        let left = TestOutput {
            overall: TestOverall::default(),
            tests: vec![record("A.testFoo", Some(100), None)],
        };
        let right = TestOutput {
            overall: TestOverall::default(),
            tests: vec![
                record("A.testFoo", None, Some(-5)),
                record("A.testBar", Some(200), None),
            ],
        };

        let merged = left.merge(right);
        assert_eq!(merged.tests.len(), 2);
        assert_eq!(merged.tests[0].test, "A.testFoo");
        assert_eq!(merged.tests[0].gas_used, Some(100));
        assert_eq!(merged.tests[0].gas_diff, Some(-5));
        assert_eq!(merged.tests[1].test, "A.testBar");
    }

    #[test]
    fn exit_code_translation() {
        assert_eq!(ContainerStatus::from_exit_code(0), ContainerStatus::Success);
        assert_eq!(
            ContainerStatus::from_exit_code(PURPOSELY_STOPPED_EXIT_CODE),
            ContainerStatus::PurposelyStopped
        );
        assert_eq!(
            ContainerStatus::from_exit_code(1),
            ContainerStatus::ApplicationError
        );
        assert_eq!(
            ContainerStatus::from_exit_code(137),
            ContainerStatus::ApplicationError
        );
    }

    #[test]
    fn unknown_execution_args_are_dropped() {
        let mut args = ExecutionArgs::new();
        args.insert("matchContract".to_string(), "Token".to_string());
        args.insert("badArg".to_string(), "x".to_string());
        args.insert("fuzzRuns".to_string(), "256".to_string());

        let flags = args_to_cli_flags(&args);
        assert_eq!(
            flags,
            vec!["--match-contract", "Token", "--fuzz-runs", "256"]
        );
    }

    #[test]
    fn test_output_serializes_with_wire_keys() {
        let output = TestOutput {
            overall: TestOverall {
                number_of_tests: Some(1),
                number_of_passed: Some(1),
                number_of_failed: Some(0),
                passed: Some(true),
                gas_diff_overall: None,
            },
            tests: vec![TestRecord {
                test: "A.testFoo".to_string(),
                status: TestStatus::Pass,
                gas_used: Some(31337),
                gas_diff: None,
                reason: None,
            }],
        };

        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["overall"]["numberOfTests"], 1);
        assert_eq!(json["overall"]["passed"], true);
        assert_eq!(json["tests"][0]["test"], "A.testFoo");
        assert_eq!(json["tests"][0]["status"], "PASS");
        assert_eq!(json["tests"][0]["gasUsed"], 31337);
        assert!(json["tests"][0].get("reason").is_none());
    }
}
