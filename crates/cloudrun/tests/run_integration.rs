//! Whole-run tests: managed clouds backed by fake shell workers, and fake
//! shell tests that pass or fail on demand.

use cloudrun::cloud::CloudError;
use cloudrun::node::NodeError;
use cloudrun::scheduler::SETUP_OUTPUT_FILE;
use cloudrun::scraper::ScrapeError;
use cloudrun::signals::handle_signal;
use cloudrun::{
    build_managed_clouds, build_test_units, Reporter, RunContext, Scheduler, SchedulerError,
};
use cloudrun_core::discovery::{DirectoryWalk, TestListFile};
use cloudrun_core::{Config, SizeFilter, TestDiscoverer, TestOutcome, TolerancePolicy};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const FAKE_WORKER: &str = r#"#!/bin/sh
# usage: worker.sh <cloud-name> <base-port>
echo "worker for cloud $1 booting"
echo "INFO: Listening for HTTP and REST traffic on  http://127.0.0.1:$(( $2 + 1 ))/"
exec sleep 60
"#;

const SILENT_WORKER: &str = "#!/bin/sh\nexec sleep 60\n";

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    out: PathBuf,
    config: Config,
}

impl Harness {
    fn new(worker: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tests");
        let out = dir.path().join("results");
        fs::create_dir_all(&root).unwrap();
        let worker_path = dir.path().join("worker.sh");
        fs::write(&worker_path, worker).unwrap();

        let config = Config {
            base_port: 47000,
            num_clouds: 1,
            worker_cmd: format!("sh {} {{name}} {{port}}", worker_path.display()),
            worker_aux_config: None,
            test_cmd: "sh {test} {endpoint}".to_string(),
            setup_cmd: String::new(),
            test_extensions: vec!["sh".to_string()],
            port_scrape_retries: 200,
            port_scrape_interval_ms: 20,
            poll_interval_ms: 20,
            ..Config::default()
        };
        Self {
            _dir: dir,
            root,
            out,
            config,
        }
    }

    fn add_test(&self, rel: &str, body: &str) {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn context(&self) -> RunContext {
        RunContext::new(self.config.clone(), self.root.clone(), self.out.clone())
    }

    fn walk(&self) -> DirectoryWalk {
        DirectoryWalk {
            test_root: self.root.clone(),
            marker: self.config.test_marker.clone(),
            extensions: self.config.test_extensions.clone(),
            group: None,
            sizes: SizeFilter::default(),
        }
    }

    fn read_out(&self, name: &str) -> String {
        fs::read_to_string(self.out.join(name)).unwrap()
    }
}

fn reporter(ctx: &RunContext) -> Reporter {
    let reporter = Reporter::new(ctx.output_dir(), &ctx.failed_output_dir());
    reporter.create_output_dirs().unwrap();
    reporter
}

fn count_test_captures(out: &Path) -> usize {
    fs::read_dir(out)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with("testdir_") && name.ends_with(".out.txt")
        })
        .count()
}

#[tokio::test]
async fn single_test_on_single_cloud_passes() {
    let h = Harness::new(FAKE_WORKER);
    h.add_test(
        "testdir_basic/runit_endpoint.sh",
        "[ \"$1\" = \"127.0.0.1:47001\" ] || exit 3\necho ok\n",
    );
    let ctx = h.context();
    let tests = build_test_units(h.walk().discover().unwrap(), &TolerancePolicy::default());
    let clouds = build_managed_clouds(ctx.config(), ctx.output_dir()).unwrap();

    let report = Scheduler::new(&ctx, clouds, tests, reporter(&ctx))
        .run()
        .await
        .unwrap();

    assert!(report.regression_passed());
    let summary = h.read_out("summary.txt");
    let pass_lines: Vec<&str> = summary.lines().filter(|l| l.starts_with("PASS")).collect();
    assert_eq!(pass_lines.len(), 1);
    assert!(pass_lines[0].starts_with("PASS      47001"));
    assert!(pass_lines[0].contains("runit_endpoint.sh"));
    assert!(summary.contains("Starting 1 tests on 1 total nodes..."));
    assert!(summary.contains("All tests completed; tearing down clouds..."));

    let worker = h.read_out("worker_0_0.out.txt");
    assert!(worker.contains("worker for cloud H2O_runit_"));
    assert!(h.read_out("summary.json").contains("\"regression_passed\": true"));
}

#[tokio::test]
async fn tests_spread_across_clouds() {
    let mut h = Harness::new(FAKE_WORKER);
    h.config.num_clouds = 3;
    for i in 0..6 {
        h.add_test(&format!("testdir_spread/runit_{i}.sh"), "echo \"$1\"\n");
    }
    let ctx = h.context();
    let tests = build_test_units(h.walk().discover().unwrap(), &TolerancePolicy::default());
    let clouds = build_managed_clouds(ctx.config(), ctx.output_dir()).unwrap();

    let report = Scheduler::new(&ctx, clouds, tests, reporter(&ctx))
        .run()
        .await
        .unwrap();

    assert_eq!(report.summary.summary.passed, 6);
    let mut ports: Vec<u16> = report.summary.tests.iter().filter_map(|t| t.port).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports, vec![47001, 47003, 47005]);
}

#[tokio::test]
async fn failed_list_reruns_exactly_the_failures() {
    let h = Harness::new(FAKE_WORKER);
    h.add_test("testdir_a/runit_a_ok.sh", "true\n");
    h.add_test("testdir_a/runit_b_bad.sh", "echo 'SEED used 11'; exit 1\n");
    h.add_test("testdir_b/runit_c_bad.sh", "exit 2\n");
    h.add_test("testdir_b/runit_d_ok.sh", "true\n");
    let ctx = h.context();
    let tests = build_test_units(h.walk().discover().unwrap(), &TolerancePolicy::default());
    let clouds = build_managed_clouds(ctx.config(), ctx.output_dir()).unwrap();

    let report = Scheduler::new(&ctx, clouds, tests, reporter(&ctx))
        .run()
        .await
        .unwrap();
    assert!(!report.regression_passed());
    assert_eq!(
        report.summary.summary.true_fail_list,
        vec!["runit_b_bad.sh", "runit_c_bad.sh"]
    );
    assert!(ctx
        .failed_output_dir()
        .join("testdir_a_runit_b_bad.sh.out.txt")
        .is_file());

    let rerun = TestListFile {
        list: h.out.join("failed.txt"),
        test_root: h.root.clone(),
    }
    .discover()
    .unwrap();
    let names: Vec<&str> = rerun.iter().map(|s| s.file_name.as_str()).collect();
    assert_eq!(names, vec!["runit_b_bad.sh", "runit_c_bad.sh"]);
}

#[tokio::test]
async fn tolerated_failures_keep_run_green() {
    let mut h = Harness::new(FAKE_WORKER);
    h.config.tolerated_tests = vec!["runit_flaky.sh".to_string()];
    h.add_test("testdir_a/runit_ok.sh", "true\n");
    h.add_test("testdir_a/runit_flaky.sh", "exit 1\n");
    h.add_test("testdir_a/runit_NOPASS_known.sh", "exit 1\n");
    let ctx = h.context();
    let tolerance = TolerancePolicy::new(
        ctx.config().nopass_marker.clone(),
        ctx.config().tolerated_names().unwrap(),
    );
    let tests = build_test_units(h.walk().discover().unwrap(), &tolerance);
    let clouds = build_managed_clouds(ctx.config(), ctx.output_dir()).unwrap();

    let report = Scheduler::new(&ctx, clouds, tests, reporter(&ctx))
        .run()
        .await
        .unwrap();
    assert!(report.regression_passed());
    assert_eq!(report.summary.summary.tolerated, 2);
    assert_eq!(h.read_out("failed.txt").lines().count(), 2);
    assert_eq!(fs::read_dir(ctx.failed_output_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn setup_step_runs_against_first_cloud() {
    let mut h = Harness::new(FAKE_WORKER);
    h.config.num_clouds = 2;
    let setup = h.root.join("setup.sh");
    fs::write(&setup, "echo \"setup against $1\"\n").unwrap();
    h.config.setup_cmd = "sh {root}/setup.sh {endpoint}".to_string();
    h.add_test("testdir_a/runit_ok.sh", "true\n");
    let ctx = h.context();
    let tests = build_test_units(h.walk().discover().unwrap(), &TolerancePolicy::default());
    let clouds = build_managed_clouds(ctx.config(), ctx.output_dir()).unwrap();

    Scheduler::new(&ctx, clouds, tests, reporter(&ctx))
        .run()
        .await
        .unwrap();
    assert_eq!(
        h.read_out(SETUP_OUTPUT_FILE).trim(),
        "setup against 127.0.0.1:47001"
    );
    assert!(h.read_out("summary.txt").contains("Running setup step..."));
}

#[tokio::test]
async fn signal_mid_run_stops_dispatch_and_summarizes() {
    let mut h = Harness::new(FAKE_WORKER);
    h.config.num_clouds = 3;
    for i in 0..10 {
        h.add_test(&format!("testdir_slow/runit_{i:02}.sh"), "sleep 30\n");
    }
    let ctx = h.context();
    let tests = build_test_units(h.walk().discover().unwrap(), &TolerancePolicy::default());
    let clouds = build_managed_clouds(ctx.config(), ctx.output_dir()).unwrap();
    let scheduler = Scheduler::new(&ctx, clouds, tests, reporter(&ctx));

    let out = h.out.clone();
    let started = Instant::now();
    let (report, ()) = tokio::join!(scheduler.run(), async {
        // Wait until the first wave of tests is running.
        while count_test_captures(&out) < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle_signal(&ctx, 2));
    });
    let report = report.unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(report.terminated);
    assert!(!report.regression_passed());
    let summary = &report.summary.summary;
    assert_eq!(summary.total, 10);
    assert_eq!(summary.did_not_complete, 3);
    assert_eq!(summary.cancelled, 7);
    assert_eq!(count_test_captures(&h.out), 3);
    assert!(h.read_out("summary.txt").contains("SUMMARY OF RESULTS"));
    assert!(report
        .summary
        .tests
        .iter()
        .all(|t| matches!(t.outcome, TestOutcome::DidNotComplete | TestOutcome::Cancelled)));
}

#[tokio::test]
async fn worker_that_never_listens_is_fatal() {
    let mut h = Harness::new(SILENT_WORKER);
    h.config.port_scrape_retries = 3;
    h.config.port_scrape_interval_ms = 20;
    h.add_test("testdir_a/runit_ok.sh", "true\n");
    let ctx = h.context();
    let tests = build_test_units(h.walk().discover().unwrap(), &TolerancePolicy::default());
    let clouds = build_managed_clouds(ctx.config(), ctx.output_dir()).unwrap();

    let started = Instant::now();
    let err = Scheduler::new(&ctx, clouds, tests, reporter(&ctx))
        .run()
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3 * 20), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10));
    assert!(matches!(
        err,
        SchedulerError::Cloud(CloudError::Node {
            source: NodeError::Scrape(ScrapeError::Timeout { retries: 3, .. }),
            ..
        })
    ));
    assert_eq!(count_test_captures(&h.out), 0);
}
