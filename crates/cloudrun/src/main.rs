//! cloudrun - parallel test runner over a pool of server clouds.
//!
//! Main entry point for the binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{CommandFactory, Parser};
use cloudrun::{
    build_managed_clouds, build_test_units, Reporter, RunContext, RunReport, Scheduler,
    SignalCoordinator, UserSuppliedCloud,
};
use cloudrun_core::discovery::{DirectoryWalk, SingleTest, TestListFile};
use cloudrun_core::wipe::{wipe_output_dir, wipe_test_state};
use cloudrun_core::{Config, Endpoint, SizeFilter, TestDiscoverer, TestSpec, TolerancePolicy};
use eyre::WrapErr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Output directory used when neither the CLI nor the config names one.
const DEFAULT_OUTPUT_DIR: &str = "results";

#[derive(Parser)]
#[command(
    name = "cloudrun",
    about = "Run a test suite in parallel across a pool of server clouds",
    version
)]
struct Cli {
    /// First port of the range handed out to workers
    #[arg(long)]
    baseport: Option<u16>,

    /// Number of clouds to start
    #[arg(long)]
    numclouds: Option<usize>,

    /// Nodes per cloud (only 1 is supported)
    #[arg(long = "nodes-per-cloud")]
    nodes_per_cloud: Option<usize>,

    /// Run a single test (path, or file name searched under the test root)
    #[arg(long, conflicts_with = "testlist")]
    test: Option<String>,

    /// Run the tests listed in a file, e.g. a previous run's failed.txt
    #[arg(long)]
    testlist: Option<PathBuf>,

    /// Only run tests whose directory contains this group name
    #[arg(long)]
    testgroup: Option<String>,

    /// Size classes to run, any of s, m, l (e.g. "sm")
    #[arg(long)]
    testsize: Option<SizeFilter>,

    /// Run against an existing server at ip:port instead of starting clouds
    #[arg(long)]
    usecloud: Option<Endpoint>,

    /// List the selected tests and exit without running them
    #[arg(long)]
    norun: bool,

    /// Remove the output directory first
    #[arg(long)]
    wipe: bool,

    /// Like --wipe, and also remove the master seed and sandbox directories
    #[arg(long)]
    wipeall: bool,

    /// Worker memory size (e.g. 2g)
    #[arg(long = "jvm.xmx")]
    jvm_xmx: Option<String>,

    /// Config file (default: <test-root>/.cloudrun/config)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root of the test tree (default: current directory)
    #[arg(long = "test-root")]
    test_root: Option<PathBuf>,

    /// Where results are written (default: <test-root>/results)
    #[arg(long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Kill any test running longer than this many seconds (0 = never)
    #[arg(long = "test-timeout")]
    test_timeout: Option<u64>,
}

impl Cli {
    /// Overlay command-line values on the loaded config.
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.baseport {
            config.base_port = port;
        }
        if let Some(n) = self.numclouds {
            config.num_clouds = n;
        }
        if let Some(n) = self.nodes_per_cloud {
            config.nodes_per_cloud = n;
        }
        if let Some(ref mem) = self.jvm_xmx {
            config.worker_memory.clone_from(mem);
        }
        if let Some(ref dir) = self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if let Some(secs) = self.test_timeout {
            config.test_timeout_sec = secs;
        }
        if self.test.is_some() {
            config.num_clouds = 1;
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Report lines own stdout; diagnostics go to stderr.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => fatal(&e),
    }
}

/// Print a boxed error and the usage text, then exit 1.
fn fatal(err: &eyre::Report) -> ! {
    eprintln!();
    eprintln!("ERROR: {err:#}");
    eprintln!();
    let _ = Cli::command().print_help();
    std::process::exit(1);
}

fn run(cli: &Cli) -> eyre::Result<bool> {
    let test_root = match cli.test_root {
        Some(ref root) => absolute(root)?,
        None => std::env::current_dir().wrap_err("cannot determine current directory")?,
    };

    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)
            .wrap_err_with(|| format!("loading config {}", path.display()))?,
        None => Config::for_test_root(&test_root)?,
    };
    cli.apply(&mut config);
    config.resolve_paths(&test_root);
    config.validate()?;

    let output_dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| test_root.join(DEFAULT_OUTPUT_DIR));

    if cli.wipe || cli.wipeall {
        wipe_output_dir(&output_dir)?;
    }
    if cli.wipeall {
        for path in wipe_test_state(&test_root, &config.seed_file, &config.sandbox_marker)? {
            info!(path = %path.display(), "removed test state");
        }
    }

    let specs = discover(cli, &config, &test_root)?;
    if cli.norun {
        for spec in &specs {
            println!("{}", spec.path.display());
        }
        return Ok(true);
    }

    let tolerance = TolerancePolicy::new(config.nopass_marker.clone(), config.tolerated_names()?);
    let tests = build_test_units(specs, &tolerance);
    info!(tests = tests.len(), clouds = config.num_clouds, "starting run");

    let ctx = Arc::new(RunContext::new(config, test_root, output_dir));
    let reporter = Reporter::new(ctx.output_dir(), &ctx.failed_output_dir());
    reporter.create_output_dirs()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    let report: RunReport = runtime.block_on(async {
        let signals = SignalCoordinator::install(Arc::clone(&ctx))
            .wrap_err("failed to register signal handlers")?;

        let result = match cli.usecloud {
            Some(ref endpoint) => {
                let clouds = vec![UserSuppliedCloud::new(endpoint.clone())];
                Scheduler::new(&ctx, clouds, tests, reporter).run().await
            }
            None => {
                let clouds = build_managed_clouds(ctx.config(), ctx.output_dir())?;
                Scheduler::new(&ctx, clouds, tests, reporter).run().await
            }
        };
        signals.abort();
        Ok::<_, eyre::Report>(result?)
    })?;

    Ok(report.regression_passed())
}

fn discover(cli: &Cli, config: &Config, test_root: &Path) -> eyre::Result<Vec<TestSpec>> {
    let discoverer: Box<dyn TestDiscoverer> = if let Some(ref test) = cli.test {
        Box::new(SingleTest {
            test: test.clone(),
            test_root: test_root.to_path_buf(),
        })
    } else if let Some(ref list) = cli.testlist {
        Box::new(TestListFile {
            list: absolute(list)?,
            test_root: test_root.to_path_buf(),
        })
    } else {
        Box::new(DirectoryWalk {
            test_root: test_root.to_path_buf(),
            marker: config.test_marker.clone(),
            extensions: config.test_extensions.clone(),
            group: cli.testgroup.clone(),
            sizes: cli.testsize.unwrap_or_default(),
        })
    };
    Ok(discoverer.discover()?)
}

fn absolute(path: &Path) -> eyre::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .wrap_err("cannot determine current directory")?
            .join(path))
    }
}
