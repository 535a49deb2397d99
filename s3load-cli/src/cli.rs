use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use s3load_factory::{
    InMemoryStore, LifecycleCache, ObjectFactory, OperationKind, Outcome, UploadCounter,
};

use crate::config::Config;
use crate::observability;

/// Object lifecycle tooling for S3 load tests.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Check(CheckCommand),
    Sample(SampleCommand),
    Version(VersionCommand),
}

/// validate the configuration and print the size class table
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "check")]
struct CheckCommand {}

/// prepare object specs and print their targets
///
/// Successful writes are recorded in the lifecycle cache, so that subsequent reads and deletes
/// can pick them up.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "sample")]
struct SampleCommand {
    /// operation to prepare: write, read or delete
    #[argh(option, default = "OperationKind::Write")]
    kind: OperationKind,

    /// number of specs to prepare
    #[argh(option, short = 'n', default = "10")]
    count: usize,

    /// track objects and uploaded bytes in process memory instead of the configured servers
    #[argh(switch)]
    in_memory: bool,
}

/// print the s3load version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Check(CheckCommand {}) => check(&config),
            Command::Sample(command) => sample(&config, command).await,
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}

fn check(config: &Config) -> Result<()> {
    let factory = ObjectFactory::new(
        &config.data,
        LifecycleCache::disabled(),
        UploadCounter::disabled(),
    )?;
    let sizes = factory.sizes();
    let total = sizes.total_weight();

    for class in sizes.classes() {
        let share = class.weight as f64 / total as f64;
        tracing::info!(
            class = %class.name,
            low = class.low,
            high = class.high,
            weight = class.weight,
            share = format_args!("{:.1}%", share * 100.0),
            "size class"
        );
    }

    tracing::info!(
        buckets = config.data.buckets.len(),
        policy = %sizes.policy(),
        caching = config.data.cache_result,
        cache = %config.cache.url(),
        upload_limit = config.data.upload_limit.limited,
        "configuration is valid"
    );
    Ok(())
}

async fn sample(config: &Config, command: SampleCommand) -> Result<()> {
    let factory = if command.in_memory {
        let store = InMemoryStore::new();
        let cache = LifecycleCache::new(Box::new(store.clone()));
        let counter = UploadCounter::new(Box::new(store));
        ObjectFactory::new(&config.data, cache, counter)?
    } else {
        ObjectFactory::connect(&config.data, &config.cache, &config.counter).await?
    };

    for _ in 0..command.count {
        let spec = match factory.prepare(command.kind).await {
            Ok(spec) => spec,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };

        println!(
            "{} {}/{} {} {}",
            spec.kind(),
            spec.bucket,
            spec.key,
            spec.expected_size.unwrap_or(spec.size),
            spec.size_class.as_deref().unwrap_or("-"),
        );

        // Pretend the request went through, so the cache reflects the sampled operations.
        let outcome = Outcome::success(spec.size);
        factory.finalize(spec, &outcome).await;
    }

    Ok(())
}
