use std::collections::HashMap;
use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;

use crate::Error;
use crate::attrs::AttrValue;
use crate::attrs::Attributes;
use crate::attrs::Role;
use crate::bootstrap;
use crate::channel::Channel;
use crate::dispatch::Dispatcher;
use crate::dispatch::State;
use crate::marshal::CallMode;
use crate::marshal::CallStatus;
use crate::marshal::Reply;
use crate::marshal::Wait;
use crate::store::Store;
use crate::table::OperationTable;
use crate::table::Target;
use crate::value::Args;

struct Calc {
    attrs: Attributes,
    total: i64,
    hits: u32,
}

impl Target for Calc {
    const NAME: &'static str = "Calc";

    fn construct(args: &Args, attrs: &Attributes) -> anyhow::Result<Self> {
        let start = args.param_or::<i64>(0, "start", 0)?;
        attrs.declare("total", start);
        attrs.declare("history", Vec::<i64>::new());
        Ok(Self { attrs: attrs.clone(), total: start, hits: 0 })
    }

    fn operations(table: &mut OperationTable<Self>) {
        table
            .method("add", |_, args| Ok(args.param::<i64>(0, "a")? + args.param::<i64>(1, "b")?))
            .method("accumulate", |calc, args| {
                let n = args.param::<i64>(0, "n")?;
                calc.total += n;
                calc.attrs.set("total", &calc.total);
                if let Some(AttrValue::List(mut history)) = calc.attrs.get("history") {
                    history.push(n);
                }
                Ok(calc.total)
            })
            .method("count", |calc, _| {
                calc.hits += 1;
                Ok(calc.hits)
            })
            .method("limit", |calc, _| Ok(calc.attrs.get_as::<i64>("threshold")))
            .function("version", |_| Ok("calc-1"));
    }
}

/// Leaves the worker to the test, which attaches and ticks it by hand.
fn manual(_: &Path) -> std::io::Result<Option<Child>> {
    Ok(None)
}

fn fixture(args: Args) -> (tempfile::TempDir, Channel<Calc>, Dispatcher<Calc>) {
    let base = tempfile::tempdir().unwrap();
    let channel = Channel::<Calc>::builder()
        .base(base.path())
        .poll(Duration::from_millis(2))
        .args(args)
        .launcher(manual)
        .spawn()
        .unwrap();
    let dispatcher = bootstrap::attach::<Calc>(channel.dir()).unwrap();
    (base, channel, dispatcher)
}

#[tokio::test]
async fn test_handle_result_appears_after_one_tick() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());

    let id = channel.call("add", &crate::args![2, 3], CallMode::Handle).await.handle().unwrap();
    assert!(id.0 > 10);
    assert_eq!(channel.result("add", id, Wait::No).await, None);
    assert_eq!(channel.status("add", id), CallStatus::Pending);

    assert_eq!(dispatcher.tick(), 1);
    assert_eq!(channel.result("add", id, Wait::No).await, Some(json!(5)));
}

#[tokio::test]
async fn test_blocking_call_matches_direct_invocation() {
    let (base, channel, dispatcher) = fixture(Args::new());
    let worker = tokio::spawn(dispatcher.run());

    for (a, b) in [(2i64, 3i64), (-7, 4), (1 << 40, 1)] {
        let args = crate::args![a, b];
        let reply = channel.call("add", &args, CallMode::Wait(Duration::from_secs(2))).await;

        let scratch = Store::allocate(base.path(), "scratch").unwrap();
        let attrs = Attributes::new(scratch, Role::Worker).detached();
        let mut local = Calc::construct(&Args::new(), &attrs).unwrap();
        let direct = OperationTable::<Calc>::of().get("add").unwrap().invoke(&mut local, &args).unwrap();

        assert_eq!(reply, Reply::Value(Some(direct)));
    }

    channel.terminate();
    tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_echo_returns_previous_result_for_the_method() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());

    assert_eq!(channel.call("count", &Args::new(), CallMode::Echo).await, Reply::Value(None));
    dispatcher.tick();
    assert_eq!(channel.call("count", &Args::new(), CallMode::Echo).await, Reply::Value(Some(json!(1))));
    // A zero wait is a plain echo: the second call has not run yet.
    assert_eq!(
        channel.call("count", &Args::new(), CallMode::Wait(Duration::ZERO)).await,
        Reply::Value(None)
    );
}

#[test]
fn test_unchanged_record_is_not_reinvoked() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());
    let id = channel.submit("count", &Args::new()).unwrap();

    for _ in 0..5 {
        dispatcher.tick();
    }
    assert_eq!(dispatcher.target().hits, 1);
    assert_eq!(channel.peek("count", id), Some(json!(1)));
}

#[test]
fn test_static_operations_run_without_instance_state() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());
    let id = channel.submit("version", &Args::new()).unwrap();
    dispatcher.tick();

    assert_eq!(channel.peek("version", id), Some(json!("calc-1")));
    assert_eq!(dispatcher.target().hits, 0);
}

#[test]
fn test_worker_defaults_and_writes_reach_the_caller() {
    let (_base, channel, mut dispatcher) = fixture(crate::args![100]);
    assert_eq!(channel.get_as::<i64>("total"), None);

    dispatcher.tick();
    assert_eq!(channel.get_as::<i64>("total"), Some(100));
    assert_eq!(channel.get_as::<Vec<i64>>("history"), Some(vec![]));

    channel.submit("accumulate", &crate::args![5]).unwrap();
    channel.submit("accumulate", &crate::args![7]).unwrap();
    dispatcher.tick();

    assert_eq!(channel.get_as::<i64>("total"), Some(112));
    let mut history = channel.get_as::<Vec<i64>>("history").unwrap();
    history.sort();
    assert_eq!(history, vec![5, 7]);
}

#[test]
fn test_caller_writes_reach_the_worker() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());
    channel.set("threshold", &42);

    let id = channel.submit("limit", &Args::new()).unwrap();
    dispatcher.tick();
    assert_eq!(channel.peek("limit", id), Some(json!(42)));
    assert_eq!(dispatcher.attrs().local("threshold"), Some(json!(42)));
}

#[tokio::test]
async fn test_operation_names_cannot_be_attributes() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());
    channel.set("limit", &42);
    assert!(channel.get("limit").is_none());
    assert!(!channel.dir().join("limit").exists());

    // The worker refuses the name as well, even if the caller is bypassed.
    dispatcher.attrs().set("count", &7);
    assert!(!channel.dir().join("count").exists());

    let id = channel.submit("limit", &Args::new()).unwrap();
    dispatcher.tick();
    assert_eq!(channel.peek("limit", id), Some(Value::Null));
    assert!(!channel.call("count", &Args::new(), CallMode::Handle).await.is_rejected());
}

#[test]
fn test_attribute_names_stay_inside_the_channel() {
    let (base, channel, _dispatcher) = fixture(Args::new());
    channel.set("../../escaped", &123);
    channel.set("..", &1);
    channel.terminate();

    assert!(!base.path().join("escaped").exists());
    assert_eq!(std::fs::read_dir(base.path().join("dirrun")).unwrap().count(), 0);
}

#[test]
fn test_caller_mutation_rewrites_the_record() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());
    dispatcher.tick();

    let Some(AttrValue::List(mut history)) = channel.get("history") else { panic!("expected a list") };
    assert!(history.extend([1, 2, 3]));
    assert!(history.remove_value(2));

    assert_eq!(dispatcher.attrs().get_as::<Vec<i64>>("history"), Some(vec![1, 3]));
}

#[tokio::test]
async fn test_rejections_leave_no_trace() {
    let (_base, channel, _dispatcher) = fixture(Args::new());
    let mut grid = HashMap::new();
    grid.insert((1u8, 2u8), 3u8);

    assert_eq!(channel.call("nope", &Args::new(), CallMode::Handle).await, Reply::Rejected);
    assert_eq!(channel.call("add", &crate::args![grid], CallMode::Handle).await, Reply::Rejected);
    assert!(!channel.dir().join("nope").exists());
    assert!(!channel.dir().join("add").exists());
}

#[test]
fn test_binding_fires_exactly_once() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());
    let fired: Arc<Mutex<Vec<(Args, Value)>>> = Arc::new(Mutex::new(Vec::new()));

    let id = channel.submit("add", &crate::args![20, 22]).unwrap();
    let sink = Arc::clone(&fired);
    channel.bind(id, crate::args!["answer"], move |args, result| {
        sink.lock().unwrap().push((args, result));
    });

    assert!(!channel.check_bindings());
    dispatcher.tick();
    assert!(channel.check_bindings());
    assert!(!channel.check_bindings());

    assert_eq!(channel.binding_count(), 0);
    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].0, crate::args!["answer"]);
    assert_eq!(fired[0].1, json!(42));
}

#[tokio::test]
async fn test_terminate_twice_stops_everything() {
    let (_base, channel, mut dispatcher) = fixture(Args::new());
    let id = channel.submit("count", &Args::new()).unwrap();
    dispatcher.tick();

    channel.terminate();
    channel.terminate();
    assert!(!channel.is_active());
    assert!(!channel.dir().exists());

    assert_eq!(dispatcher.tick(), 0);
    assert_eq!(dispatcher.state(), State::Terminated);
    assert_eq!(channel.call("count", &Args::new(), CallMode::Handle).await, Reply::Rejected);
    assert_eq!(channel.result_by_id(id, Wait::No).await, None);
}

#[test]
fn test_failed_launch_cleans_up() {
    let base = tempfile::tempdir().unwrap();
    let outcome = Channel::<Calc>::builder()
        .base(base.path())
        .launcher(|_: &Path| -> std::io::Result<Option<Child>> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"))
        })
        .spawn();

    assert!(matches!(outcome, Err(Error::Spawn(_))));
    let leftovers = std::fs::read_dir(base.path().join("dirrun")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_unportable_constructor_arguments_are_refused() {
    let base = tempfile::tempdir().unwrap();
    let mut grid = HashMap::new();
    grid.insert((0u8, 0u8), 0u8);

    let outcome = Channel::<Calc>::builder()
        .base(base.path())
        .args(crate::args![grid])
        .launcher(manual)
        .spawn();
    assert!(matches!(outcome, Err(Error::Encode(_))));
    assert!(!base.path().join("dirrun").exists());
}
