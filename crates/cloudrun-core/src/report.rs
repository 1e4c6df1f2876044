//! Result lines, run summary, and `summary.json` generation.
//!
//! Line formats:
//! - pass: `PASS      <port> <secs>s <name>`
//! - fail: `     FAIL <port> <secs>s <name> <output_file>  <seed>`

use crate::types::TestOutcome;
use serde::Serialize;

/// Marker a test prints before the random seed it used.
pub const SEED_MARKER: &str = "SEED used";

const RULE: &str = "----------------------------------------------------------------------";

/// Outcome of one test, as reported and serialized.
#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub name: String,
    pub path: String,
    pub outcome: TestOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

/// Format the line reported for a passing test.
pub fn format_pass_line(port: u16, elapsed_secs: i64, name: &str) -> String {
    format!("PASS      {port} {elapsed_secs:>4}s {name:<60}")
}

/// Format the line reported for a non-passing test.
pub fn format_fail_line(
    port: u16,
    elapsed_secs: i64,
    name: &str,
    output_file: &str,
    seed: &str,
    timed_out: bool,
) -> String {
    let mut line = format!("     FAIL {port} {elapsed_secs:>4}s {name:<60} {output_file}  {seed}");
    if timed_out {
        line.push_str("  (timed out)");
    }
    line
}

/// Pull the seed out of a test's captured output.
///
/// Takes the last whitespace-separated token of the first line containing
/// [`SEED_MARKER`]; empty if there is none.
pub fn scrape_seed(output: &str) -> String {
    output
        .lines()
        .find(|line| line.contains(SEED_MARKER))
        .and_then(|line| line.split_whitespace().last())
        .unwrap_or_default()
        .to_string()
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    /// Completed without passing and not tolerated.
    pub failed: usize,
    /// Completed without passing but tolerated.
    pub tolerated: usize,
    pub did_not_complete: usize,
    pub cancelled: usize,
    pub total_secs: f64,
    pub true_fail_list: Vec<String>,
    pub regression_passed: bool,
}

impl Summary {
    /// Count outcomes and decide the overall verdict.
    ///
    /// The run passes only if every test passed or was tolerated.
    pub fn from_records(records: &[TestRecord], total_secs: f64) -> Self {
        let mut summary = Self {
            total: records.len(),
            total_secs,
            ..Self::default()
        };
        for record in records {
            match record.outcome {
                TestOutcome::Passed => summary.passed += 1,
                TestOutcome::Failed => {
                    summary.failed += 1;
                    summary.true_fail_list.push(record.name.clone());
                }
                TestOutcome::Tolerated => summary.tolerated += 1,
                TestOutcome::DidNotComplete => summary.did_not_complete += 1,
                TestOutcome::Cancelled => summary.cancelled += 1,
            }
        }
        summary.regression_passed = records.iter().all(|r| r.outcome.is_acceptable());
        summary
    }

    /// Tests that ran to completion, pass or fail.
    pub fn completed(&self) -> usize {
        self.passed + self.failed + self.tolerated
    }

    /// Mean wall time per completed test.
    pub fn secs_per_completed(&self) -> Option<f64> {
        let completed = self.completed();
        (completed > 0).then(|| self.total_secs / completed as f64)
    }

    /// Render the fixed-format summary block, one entry per line.
    pub fn render(&self) -> Vec<String> {
        let per_test = self
            .secs_per_completed()
            .map_or_else(|| "N/A".to_string(), |s| format!("{s:.2} sec"));
        vec![
            String::new(),
            RULE.to_string(),
            String::new(),
            "SUMMARY OF RESULTS".to_string(),
            String::new(),
            RULE.to_string(),
            String::new(),
            format!("Total tests:          {}", self.total),
            format!("Passed:               {}", self.passed),
            format!("Did not pass:         {}", self.failed + self.tolerated),
            format!("Did not complete:     {}", self.did_not_complete),
            format!("Cancelled:            {}", self.cancelled),
            format!("Tolerated NOPASS:     {}", self.tolerated),
            String::new(),
            format!("Total time:           {:.2} sec", self.total_secs),
            format!("Time/completed test:  {per_test}"),
            String::new(),
            format!("True fail list:       {}", self.true_fail_list.join(", ")),
            String::new(),
        ]
    }
}

/// Contents of `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(flatten)]
    pub summary: Summary,
    pub tests: Vec<TestRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, outcome: TestOutcome) -> TestRecord {
        TestRecord {
            name: name.to_string(),
            path: format!("/tests/{name}"),
            outcome,
            exit_code: None,
            port: Some(54321),
            elapsed_secs: Some(3),
            output_file: None,
            seed: None,
            timed_out: false,
        }
    }

    #[test]
    fn pass_line_is_aligned() {
        let line = format_pass_line(54321, 7, "runit_glm.R");
        assert!(line.starts_with("PASS      54321    7s runit_glm.R"));
        assert_eq!(line.len(), "PASS      54321    7s ".len() + 60);
    }

    #[test]
    fn fail_line_carries_output_and_seed() {
        let line = format_fail_line(54321, 12, "runit_glm.R", "/out/x.out.txt", "-42", false);
        assert!(line.starts_with("     FAIL 54321   12s runit_glm.R"));
        assert!(line.ends_with(" /out/x.out.txt  -42"));

        let timed = format_fail_line(1, 1, "t", "o", "", true);
        assert!(timed.ends_with("(timed out)"));
    }

    #[test]
    fn scrape_seed_takes_last_token_of_first_match() {
        let out = "starting\n[1] \"SEED used: 123456\"\nSEED used 999\n";
        assert_eq!(scrape_seed(out), "123456\"");
        assert_eq!(scrape_seed("SEED used   42  \n"), "42");
        assert_eq!(scrape_seed("no seed here\n"), "");
    }

    #[test]
    fn summary_counts_and_verdict() {
        let records = vec![
            record("a", TestOutcome::Passed),
            record("b", TestOutcome::Failed),
            record("c", TestOutcome::Tolerated),
            record("d", TestOutcome::DidNotComplete),
            record("e", TestOutcome::Cancelled),
        ];
        let summary = Summary::from_records(&records, 10.0);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.tolerated, 1);
        assert_eq!(summary.did_not_complete, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.completed(), 3);
        assert_eq!(summary.true_fail_list, vec!["b"]);
        assert!(!summary.regression_passed);
    }

    #[test]
    fn tolerated_failures_keep_regression_green() {
        let records = vec![
            record("a", TestOutcome::Passed),
            record("b", TestOutcome::Tolerated),
        ];
        assert!(Summary::from_records(&records, 1.0).regression_passed);
    }

    #[test]
    fn unfinished_tests_fail_regression() {
        let records = vec![record("a", TestOutcome::DidNotComplete)];
        assert!(!Summary::from_records(&records, 1.0).regression_passed);
        let records = vec![record("a", TestOutcome::Cancelled)];
        assert!(!Summary::from_records(&records, 1.0).regression_passed);
    }

    #[test]
    fn render_reports_na_without_completed_tests() {
        let summary = Summary::from_records(&[record("a", TestOutcome::Cancelled)], 2.5);
        let block = summary.render();
        assert!(block.contains(&"SUMMARY OF RESULTS".to_string()));
        assert!(block.contains(&"Total time:           2.50 sec".to_string()));
        assert!(block.contains(&"Time/completed test:  N/A".to_string()));
    }

    #[test]
    fn render_reports_mean_time() {
        let records = vec![record("a", TestOutcome::Passed), record("b", TestOutcome::Failed)];
        let block = Summary::from_records(&records, 5.0).render();
        assert!(block.contains(&"Time/completed test:  2.50 sec".to_string()));
        assert!(block.contains(&"True fail list:       b".to_string()));
    }

    #[test]
    fn run_summary_serializes_flat_counters() {
        let records = vec![record("a", TestOutcome::Passed)];
        let run = RunSummary {
            start_ms: 1,
            end_ms: 2,
            summary: Summary::from_records(&records, 1.0),
            tests: records,
        };
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["passed"], 1);
        assert_eq!(json["regression_passed"], true);
        assert_eq!(json["tests"][0]["outcome"], "passed");
        assert!(json["tests"][0].get("timed_out").is_none());
    }
}
