use once_cell::sync::Lazy;
use regex::Regex;

use vulcan_common::types::{TestOutput, TestRecord, TestStatus};

/// Extraction rules for the sandbox tool's textual output. All three
/// parsers are total: anything unrecognized is skipped and an unparseable
/// input yields an empty TestOutput, never an error.

static SNAPSHOT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\w+):(\w+)\([^)]*\)\s+\(gas:\s*(\d+)\)\s*$").unwrap()
});

static FORGE_PASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[PASS\]\s+(\w+)\([^)]*\)(?:\s+\(gas:\s*(\d+)\))?").unwrap()
});

static FORGE_FAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[FAIL(?:\.\s*Reason:\s*(.*?))?\]\s+(\w+)\([^)]*\)").unwrap()
});

static FORGE_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Test result:.*?(\d+)\s+passed;\s*(\d+)\s+failed").unwrap()
});

static GAS_DIFF_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\w+(?:\.\w+)?)\([^)]*\)\s+\(gas:\s*(\d+)\s+\(Δ\s*([+-]?\d+)\)\)").unwrap()
});

/// Gas-snapshot format: one `Suite:testName() (gas: N)` line per test.
/// Every listed test is a PASS by definition of the snapshot command.
pub fn parse_gas_snapshot(input: &str) -> TestOutput {
    let mut output = TestOutput::default();

    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = SNAPSHOT_LINE.captures(line) {
            let mut record =
                TestRecord::new(format!("{}.{}", &caps[1], &caps[2]), TestStatus::Pass);
            record.gas_used = caps[3].parse().ok();
            output.tests.push(record);
        }
    }

    if !output.tests.is_empty() {
        output.overall.number_of_tests = Some(output.tests.len() as u32);
    }
    output
}

/// Forge test run output: `[PASS] name() (gas: N)` / `[FAIL. Reason: r] name()`
/// lines plus a trailing `Test result: ...; P passed; F failed; ...` summary.
pub fn parse_forge_test(input: &str) -> TestOutput {
    let mut output = TestOutput::default();

    for line in input.lines() {
        let line = line.trim();
        if let Some(caps) = FORGE_PASS.captures(line) {
            let mut record = TestRecord::new(&caps[1], TestStatus::Pass);
            record.gas_used = caps.get(2).and_then(|m| m.as_str().parse().ok());
            output.tests.push(record);
        } else if let Some(caps) = FORGE_FAIL.captures(line) {
            let mut record = TestRecord::new(&caps[2], TestStatus::Fail);
            record.reason = caps.get(1).map(|m| m.as_str().to_string());
            output.tests.push(record);
        } else if let Some(caps) = FORGE_SUMMARY.captures(line) {
            let passed: u32 = caps[1].parse().unwrap_or(0);
            let failed: u32 = caps[2].parse().unwrap_or(0);
            output.overall.number_of_passed = Some(passed);
            output.overall.number_of_failed = Some(failed);
            output.overall.number_of_tests = Some(passed + failed);
            output.overall.passed = Some(failed == 0);
        }
    }

    output
}

/// Gas-diff report: per-test `name() (gas: N (Δ ±D))` entries. The overall
/// diff is the sum of the signed per-test deltas.
pub fn parse_gas_diff(input: &str) -> TestOutput {
    let mut output = TestOutput::default();
    let mut total: i64 = 0;
    let mut any = false;

    for caps in GAS_DIFF_LINE.captures_iter(input) {
        let mut record = TestRecord::new(&caps[1], TestStatus::Pass);
        record.gas_used = caps[2].parse().ok();
        let diff: i64 = match caps[3].parse() {
            Ok(d) => d,
            Err(_) => continue,
        };
        record.gas_diff = Some(diff);
        total += diff;
        any = true;
        output.tests.push(record);
    }

    if any {
        output.overall.gas_diff_overall = Some(total);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_parses_lines_in_order() {
        let input = "\
TokenTest:testTransfer() (gas: 51234)
TokenTest:testMint(uint256) (gas: 40000)

VaultTest:testDeposit() (gas: 99000)
";
        let output = parse_gas_snapshot(input);

        assert_eq!(output.overall.number_of_tests, Some(3));
        assert_eq!(output.tests.len(), 3);
        assert_eq!(output.tests[0].test, "TokenTest.testTransfer");
        assert_eq!(output.tests[0].status, TestStatus::Pass);
        assert_eq!(output.tests[0].gas_used, Some(51234));
        assert_eq!(output.tests[2].test, "VaultTest.testDeposit");
    }

    #[test]
    fn snapshot_skips_malformed_lines() {
        let input = "\
TokenTest:testTransfer() (gas: 51234)
Compiling 12 files with 0.8.21
warning: unused variable
TokenTest:broken (gas: nope)
";
        let output = parse_gas_snapshot(input);
        assert_eq!(output.tests.len(), 1);
        assert_eq!(output.overall.number_of_tests, Some(1));
    }

    #[test]
    fn snapshot_of_nothing_is_empty() {
        assert!(parse_gas_snapshot("").is_empty());
        assert!(parse_gas_snapshot("no tests here\n").is_empty());
    }

    #[test]
    fn forge_test_parses_pass_and_fail() {
        let input = "\
Running 2 tests for test/Token.t.sol:TokenTest
[PASS] testTransfer() (gas: 51234)
[FAIL. Reason: nope] testMint() (gas: 12000)
Test result: FAILED. 1 passed; 1 failed; 0 skipped; finished in 1.20s
";
        let output = parse_forge_test(input);

        assert_eq!(output.tests.len(), 2);
        assert_eq!(output.tests[0].test, "testTransfer");
        assert_eq!(output.tests[0].status, TestStatus::Pass);
        assert_eq!(output.tests[0].gas_used, Some(51234));
        assert_eq!(output.tests[1].test, "testMint");
        assert_eq!(output.tests[1].status, TestStatus::Fail);
        assert_eq!(output.tests[1].reason.as_deref(), Some("nope"));

        assert_eq!(output.overall.number_of_passed, Some(1));
        assert_eq!(output.overall.number_of_failed, Some(1));
        assert_eq!(output.overall.number_of_tests, Some(2));
        assert_eq!(output.overall.passed, Some(false));
    }

    #[test]
    fn forge_test_all_green() {
        let input = "\
[PASS] testFoo() (gas: 31337)
Test result: ok. 1 passed; 0 failed; 0 skipped; finished in 0.98ms
";
        let output = parse_forge_test(input);
        assert_eq!(output.overall.passed, Some(true));
        assert_eq!(output.overall.number_of_tests, Some(1));
        assert_eq!(
            output.overall.number_of_tests,
            Some(output.tests.len() as u32)
        );
    }

    #[test]
    fn forge_test_fail_without_reason() {
        let input = "[FAIL] testBoom() (gas: 7)\nTest result: FAILED. 0 passed; 1 failed; 0 skipped;\n";
        let output = parse_forge_test(input);
        assert_eq!(output.tests[0].status, TestStatus::Fail);
        assert_eq!(output.tests[0].reason, None);
    }

    #[test]
    fn forge_test_pass_without_gas_tail() {
        // fuzz runs report (runs: N, μ: ..) instead of a flat gas figure
        let input = "[PASS] testFuzz(uint256) (runs: 256, μ: 40012, ~: 39990)\nTest result: ok. 1 passed; 0 failed;\n";
        let output = parse_forge_test(input);
        assert_eq!(output.tests[0].status, TestStatus::Pass);
        assert_eq!(output.tests[0].gas_used, None);
    }

    #[test]
    fn forge_test_zero_tests_counts_as_passed() {
        let input = "Test result: ok. 0 passed; 0 failed; 0 skipped; finished in 0.10ms\n";
        let output = parse_forge_test(input);
        assert!(output.tests.is_empty());
        assert_eq!(output.overall.number_of_tests, Some(0));
        assert_eq!(output.overall.passed, Some(true));
    }

    #[test]
    fn gas_diff_sums_signed_deltas() {
        let input = "\
testTransfer() (gas: 50000 (Δ -1234))
testMint() (gas: 41000 (Δ 1000))
";
        let output = parse_gas_diff(input);

        assert_eq!(output.tests.len(), 2);
        assert_eq!(output.tests[0].gas_diff, Some(-1234));
        assert_eq!(output.tests[1].gas_diff, Some(1000));
        assert_eq!(output.overall.gas_diff_overall, Some(-234));
    }

    #[test]
    fn gas_diff_of_unrelated_text_is_empty() {
        let output = parse_gas_diff("Compiling...\n[PASS] testFoo() (gas: 1)\n");
        assert!(output.is_empty());
    }

    #[test]
    fn merged_forge_and_diff_share_test_records() {
        let test_out = parse_forge_test(
            "[PASS] testTransfer() (gas: 50000)\nTest result: ok. 1 passed; 0 failed;\n",
        );
        let diff_out = parse_gas_diff("testTransfer() (gas: 50000 (Δ -42))\n");

        let merged = test_out.merge(diff_out);
        assert_eq!(merged.tests.len(), 1);
        assert_eq!(merged.tests[0].gas_used, Some(50000));
        assert_eq!(merged.tests[0].gas_diff, Some(-42));
        assert_eq!(merged.overall.gas_diff_overall, Some(-42));
        assert_eq!(merged.overall.passed, Some(true));
    }

    #[test]
    fn number_of_tests_matches_record_count_when_both_present() {
        let input = "\
A:testOne() (gas: 1)
B:testTwo() (gas: 2)
";
        let output = parse_gas_snapshot(input);
        assert_eq!(
            output.overall.number_of_tests,
            Some(output.tests.len() as u32)
        );
    }
}
