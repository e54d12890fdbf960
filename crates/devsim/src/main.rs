//! `devsim [host] [port]`
//!
//! Host demo for the simulated meter. The same executable is the worker:
//! launched with `--dirrun-worker <dir>` it serves the meter and exits when
//! the channel directory goes away.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use devsim::Meter;
use devsim::MeterProxy;
use dirrun::Args;
use dirrun::Channel;
use dirrun::Targets;
use dirrun::bootstrap;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    let targets = Targets::new().register::<Meter>();
    if let Some(code) = bootstrap::enter(&targets) {
        return code;
    }

    match host() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "demo failed");
            ExitCode::FAILURE
        }
    }
}

fn host() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.next() {
        Some(port) => port.parse().with_context(|| format!("invalid port '{}'", port))?,
        None => 502,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(demo(address, port))
}

async fn demo(address: String, port: u16) -> anyhow::Result<()> {
    let builder = Channel::<Meter>::builder().tick(Duration::from_millis(20));
    let meter = MeterProxy::spawn(builder, "demo-meter", Duration::from_millis(40))
        .context("spawning meter worker")?;
    let channel = meter.channel();
    tracing::info!(dir = %channel.dir().display(), pid = ?channel.pid(), "meter worker spawned");

    let outcome = session(&meter, &address, port).await;
    meter.terminate();
    outcome
}

async fn session(meter: &MeterProxy, address: &str, port: u16) -> anyhow::Result<()> {
    let version = meter.version().await.context("worker did not answer")?;
    tracing::info!(version = %version, "worker ready");

    meter.connect(address, port).await.context("connect timed out")?;
    tracing::info!(connected = meter.connected(), host = ?meter.host(), "after connect");

    meter.write(3, 42.5).await.context("write timed out")?;
    let value = meter.read(3).await.context("read timed out")?;
    tracing::info!(register = 3, value, "blocking read");

    // Fire-and-forget reads echo whatever the previous read returned.
    for register in [7, 8, 9] {
        let echoed = meter.read_echo(register).await;
        tracing::info!(register, ?echoed, "echo read");
    }

    let channel = meter.channel();
    let completions = Arc::new(Mutex::new(Vec::new()));
    for register in [10, 11] {
        let id = meter.read_handle(register).context("read rejected")?;
        let sink = Arc::clone(&completions);
        channel.bind(id, Args::new().arg(register), move |args, value| {
            tracing::info!(args = ?args.positional(), %value, "binding fired");
            if let Ok(mut sink) = sink.lock() {
                sink.push(value);
            }
        });
    }

    // The host's own loop; bindings are checked from here.
    let deadline = Instant::now() + Duration::from_secs(5);
    while channel.binding_count() > 0 && Instant::now() < deadline {
        channel.check_bindings();
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let fired = completions.lock().map(|c| c.len()).unwrap_or(0);
    tracing::info!(fired, pending = channel.binding_count(), "bindings drained");
    tracing::info!(registers = ?meter.registers(), log = ?meter.log(), "final state");

    meter.disconnect().await;
    Ok(())
}
