//! # devsim
//!
//! A simulated register-based device client. Every call blocks the way a
//! real network client would, which is the reason to run it behind a
//! channel: the host issues calls and polls results without ever stalling
//! its own loop.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use dirrun::AttrValue;
use dirrun::Args;
use dirrun::Attributes;
use dirrun::CallId;
use dirrun::CallMode;
use dirrun::Channel;
use dirrun::ChannelBuilder;
use dirrun::OperationTable;
use dirrun::Reply;
use dirrun::Target;
use dirrun::args;
use serde::de::DeserializeOwned;

/// Number of addressable registers.
pub const REGISTERS: u16 = 64;

/// Worker-side device client.
pub struct Meter {
    attrs: Attributes,
    name: String,
    latency: Duration,
}

impl Meter {
    fn log(&self, line: String) {
        if let Some(AttrValue::List(mut log)) = self.attrs.get("log") {
            log.push(format!("{}: {}", self.name, line));
        }
    }

    fn ensure_connected(&self) -> anyhow::Result<()> {
        if !self.attrs.get_as::<bool>("connected").unwrap_or(false) {
            bail!("{} is not connected", self.name);
        }
        Ok(())
    }

    fn connect(&mut self, host: String, port: u16) -> anyhow::Result<bool> {
        std::thread::sleep(self.latency);
        self.attrs.set("host", &format!("{}:{}", host, port));
        self.attrs.set("connected", &true);
        self.log(format!("connected to {}:{}", host, port));
        tracing::info!(host = %host, port, "meter connected");
        Ok(true)
    }

    fn disconnect(&mut self) -> anyhow::Result<bool> {
        let was = self.attrs.get_as::<bool>("connected").unwrap_or(false);
        self.attrs.set("connected", &false);
        if was {
            self.log("disconnected".to_string());
        }
        Ok(was)
    }

    fn read(&mut self, register: u16) -> anyhow::Result<f64> {
        self.ensure_connected()?;
        check_register(register)?;
        std::thread::sleep(self.latency);

        let stored = self
            .attrs
            .get("registers")
            .and_then(|value| value.to_value().get(register.to_string()).cloned())
            .and_then(|value| value.as_f64());
        Ok(stored.unwrap_or_else(|| resting_value(register)))
    }

    fn write(&mut self, register: u16, value: f64) -> anyhow::Result<bool> {
        self.ensure_connected()?;
        check_register(register)?;
        std::thread::sleep(self.latency);

        let mut registers = self.attrs.get("registers").context("registers attribute missing")?;
        let registers = registers.as_map().context("registers attribute is not a map")?;
        let stored = registers.insert(register.to_string(), value);
        self.log(format!("wrote {} to register {}", value, register));
        Ok(stored)
    }
}

fn check_register(register: u16) -> anyhow::Result<()> {
    if register >= REGISTERS {
        bail!("register {} out of range (0..{})", register, REGISTERS);
    }
    Ok(())
}

/// What an untouched register reads as.
pub fn resting_value(register: u16) -> f64 {
    f64::from(register) * 0.5
}

impl Target for Meter {
    const NAME: &'static str = "devsim::Meter";

    fn construct(args: &Args, attrs: &Attributes) -> anyhow::Result<Self> {
        let name: String = args.param_or(0, "name", "meter".to_string())?;
        let latency_ms: u64 = args.param_or(1, "latency_ms", 20)?;

        attrs.declare("connected", false);
        attrs.declare("host", "");
        attrs.declare("registers", serde_json::Map::new());
        attrs.declare("log", Vec::<String>::new());

        tracing::debug!(name = %name, latency_ms, "meter constructed");
        Ok(Self { attrs: attrs.clone(), name, latency: Duration::from_millis(latency_ms) })
    }

    fn operations(table: &mut OperationTable<Self>) {
        table
            .method("connect", |meter, args| {
                meter.connect(args.param(0, "host")?, args.param_or(1, "port", 502)?)
            })
            .method("disconnect", |meter, _| meter.disconnect())
            .method("read", |meter, args| meter.read(args.param(0, "register")?))
            .method("write", |meter, args| {
                meter.write(args.param(0, "register")?, args.param(1, "value")?)
            })
            .method("add", |_, args| Ok(args.param::<f64>(0, "a")? + args.param::<f64>(1, "b")?))
            .function("version", |_| Ok(env!("CARGO_PKG_VERSION")));
    }
}

/// Typed caller-side stub over a `Channel<Meter>`.
///
/// Blocking-style methods wait up to `wait` and return `None` on timeout,
/// failure, or rejection alike. The `*_handle` variants return the call id
/// for use with [`Channel::bind`].
pub struct MeterProxy {
    channel: Channel<Meter>,
    wait: Duration,
}

impl MeterProxy {
    pub fn new(channel: Channel<Meter>, wait: Duration) -> Self {
        Self { channel, wait }
    }

    /// Spawns a worker for a meter called `name`.
    pub fn spawn(builder: ChannelBuilder<Meter>, name: &str, latency: Duration) -> dirrun::Result<Self> {
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let channel = builder.args(args![name, latency_ms]).spawn()?;
        Ok(Self::new(channel, Duration::from_secs(5)))
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn channel(&self) -> &Channel<Meter> {
        &self.channel
    }

    async fn wait_for<R: DeserializeOwned>(&self, method: &str, args: Args) -> Option<R> {
        let reply = self.channel.call(method, &args, CallMode::Wait(self.wait)).await;
        serde_json::from_value(reply.value()?).ok()
    }

    fn handle(&self, method: &str, args: Args) -> Option<CallId> {
        self.channel.submit(method, &args)
    }

    pub async fn connect(&self, host: &str, port: u16) -> Option<bool> {
        self.wait_for("connect", args![host, port]).await
    }

    pub async fn disconnect(&self) -> Option<bool> {
        self.wait_for("disconnect", Args::new()).await
    }

    pub async fn read(&self, register: u16) -> Option<f64> {
        self.wait_for("read", args![register]).await
    }

    pub fn read_handle(&self, register: u16) -> Option<CallId> {
        self.handle("read", args![register])
    }

    /// Fire-and-forget read; returns the previous read's value if it is in.
    pub async fn read_echo(&self, register: u16) -> Option<f64> {
        match self.channel.call("read", &args![register], CallMode::Echo).await {
            Reply::Value(Some(value)) => value.as_f64(),
            _ => None,
        }
    }

    pub async fn write(&self, register: u16, value: f64) -> Option<bool> {
        self.wait_for("write", args![register, value]).await
    }

    pub async fn add(&self, a: f64, b: f64) -> Option<f64> {
        self.wait_for("add", args![a, b]).await
    }

    pub async fn version(&self) -> Option<String> {
        self.wait_for("version", Args::new()).await
    }

    pub fn connected(&self) -> bool {
        self.channel.get_as("connected").unwrap_or(false)
    }

    pub fn host(&self) -> Option<String> {
        self.channel.get_as::<String>("host").filter(|host| !host.is_empty())
    }

    pub fn registers(&self) -> BTreeMap<u16, f64> {
        let raw: BTreeMap<String, f64> = self.channel.get_as("registers").unwrap_or_default();
        raw.into_iter().filter_map(|(k, v)| Some((k.parse().ok()?, v))).collect()
    }

    pub fn log(&self) -> Vec<String> {
        self.channel.get_as("log").unwrap_or_default()
    }

    pub fn terminate(&self) {
        self.channel.terminate();
    }
}
