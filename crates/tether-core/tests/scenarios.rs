//! End-to-end scenarios between two in-process endpoints.
//!
//! Each test wires a client and a server over a unix socket pair and drives
//! the server from a background thread (or from bound receiver threads).

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::{
    async_wrap, connect_pair, Args, BgServingThread, Config, Connection, Exception,
    ExceptionClass, Exposed, ExposedService, FunctionObject, ListObject, Object, Service,
    TetherError, Value, VoidService,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or five seconds pass.
fn wait_for(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn quota_exceeded() -> Arc<ExceptionClass> {
    let base = ExceptionClass::builtin("ValueError").unwrap();
    ExceptionClass::new("app.errors", "QuotaExceeded", &base)
}

fn echo_service(shared: Arc<ListObject>) -> ExposedService {
    ExposedService::new("EchoService", move |_| {
        let handed_out = shared.clone();
        Exposed::builder("scenarios", "Echo")
            .exposed("echo", |args| Ok(args.get(0)?.clone()))
            .exposed("fail", |_| Err(TetherError::value_error("boom")))
            .exposed("over_quota", |_| {
                Err(Exception::new(quota_exceeded(), vec![Value::from("over quota")]).into())
            })
            .exposed("shared", move |_| Ok(Object::from(handed_out.clone())))
            .exposed("sleep", |args| {
                std::thread::sleep(Duration::from_secs_f64(args.f64(0)?));
                Ok(Object::from("slept"))
            })
            .exposed("call_back", |args| {
                let callback = args.get(0)?;
                callback.call(Args::new(vec![args.get(1)?.clone()]))
            })
            .exposed_attr("numbers", shared.clone())
            .build_arc()
    })
}

struct Pair {
    client: Connection,
    server: Connection,
    _bg: Option<BgServingThread>,
}

fn pair_with(client_config: Config, server_config: Config) -> (Pair, Arc<ListObject>) {
    init_tracing();
    let numbers = Arc::new(ListObject::from_values([1, 2, 3].map(Value::from)));
    let bound = server_config.bind_threads;
    let service: Arc<dyn Service> = Arc::new(echo_service(numbers.clone()));
    let (client, server) =
        connect_pair(Arc::new(VoidService), client_config, service, server_config).unwrap();
    let bg = (!bound).then(|| BgServingThread::start(server.clone()).unwrap());
    (
        Pair {
            client,
            server,
            _bg: bg,
        },
        numbers,
    )
}

fn pair() -> (Pair, Arc<ListObject>) {
    pair_with(Config::default(), Config::default())
}

#[test]
fn test_echo_is_one_round_trip() {
    let (p, _) = pair();
    let root = p.client.root().unwrap();
    let before = p.client.stats();

    let reply = root.invoke("echo", ["hello"]).unwrap();
    assert_eq!(reply.as_str(), Some("hello"));

    let after = p.client.stats();
    assert_eq!(after.requests_sent, before.requests_sent + 1);
    assert_eq!(after.replies_received, before.replies_received + 1);
    assert_eq!(after.frames_sent, before.frames_sent + 1);
    assert_eq!(after.frames_received, before.frames_received + 1);
    assert_eq!(after.proxies_received, before.proxies_received);
}

#[test]
fn test_remote_list_mutation() {
    let server_config = Config {
        allow_public_attrs: true,
        ..Config::default()
    };
    let (p, numbers) = pair_with(Config::default(), server_config);
    let root = p.client.root().unwrap();
    let remote = root.getattr("numbers").unwrap().into_netref().unwrap();
    assert_eq!(remote.type_name(), "builtins.list");

    let before = p.client.stats();
    remote.invoke("append", [4]).unwrap();
    assert_eq!(remote.len().unwrap(), 4);
    assert_eq!(p.client.stats().requests_sent, before.requests_sent + 2);

    assert_eq!(numbers.snapshot(), [1, 2, 3, 4].map(Object::from).to_vec());
}

#[test]
fn test_async_result_expires_and_connection_survives() {
    let (p, _) = pair();
    let root = p.client.root().unwrap();
    let sleep = async_wrap(&root.getattr("sleep").unwrap().into_netref().unwrap());

    let result = sleep.call(Args::new(vec![Object::from(0.6)])).unwrap();
    result.set_expiry(Some(Duration::from_millis(200)));
    let started = Instant::now();
    assert!(matches!(result.wait(), Err(TetherError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_millis(550));
    assert!(result.expired());

    std::thread::sleep(Duration::from_millis(600));
    p.client.ping().unwrap();
    assert_eq!(root.invoke("echo", [7]).unwrap().as_i64(), Some(7));
}

#[test]
fn test_exception_crosses_with_class_args_and_traceback() {
    let (p, _) = pair();
    let root = p.client.root().unwrap();

    let err = root.call_method("fail", ()).unwrap_err();
    let exc = err.exception().expect("remote exception");
    assert!(exc.is_instance_of("ValueError"));
    assert!(exc.is_instance_of("builtins.Exception"));
    assert_eq!(exc.args(), [Value::from("boom")]);
    assert!(exc.is_remote());
    assert!(exc.remote_traceback().join("\n").contains("boom"));

    // The failure is isolated to the call
    assert!(!p.client.closed());
    assert_eq!(root.invoke("echo", ["still here"]).unwrap().as_str(), Some("still here"));
}

#[test]
fn test_custom_exception_reconstruction() {
    let importing = Config {
        instantiate_custom_exceptions: true,
        import_custom_exceptions: true,
        ..Config::default()
    };
    let class = quota_exceeded();
    importing.exceptions.register_importable(class.clone());
    let (p, _) = pair_with(importing, Config::default());
    let root = p.client.root().unwrap();
    let err = root.call_method("over_quota", ()).unwrap_err();
    let exc = err.exception().unwrap();
    assert_eq!(exc.class(), &class);
    assert!(exc.is_instance_of("ValueError"));
    assert_eq!(exc.args(), [Value::from("over quota")]);

    // Without the class registered the peer's name survives on a generic class
    let (p, _) = pair();
    let root = p.client.root().unwrap();
    let err = root.call_method("over_quota", ()).unwrap_err();
    let exc = err.exception().unwrap();
    assert_eq!(exc.qualified_name(), "app.errors.QuotaExceeded");
    assert!(exc
        .class()
        .ancestry()
        .contains(&"tether.vinegar.GenericException".to_string()));
    assert!(!exc.is_instance_of("ValueError"));
}

#[test]
fn test_dropping_proxies_releases_owner_references() {
    let (p, numbers) = pair();
    let root = p.client.root().unwrap();
    let baseline = p.server.local_object_count();
    assert_eq!(baseline, 1);

    let first = root.call_method("shared", ()).unwrap().into_netref().unwrap();
    let second = root.call_method("shared", ()).unwrap().into_netref().unwrap();
    let third = root.call_method("shared", ()).unwrap().into_netref().unwrap();
    assert!(first.same_object(&second) && second.same_object(&third));
    assert_eq!(first.refcount(), 3);
    assert_eq!(p.client.proxy_count(), 2);

    let shared = Object::from(numbers);
    assert_eq!(p.server.local_refcount(&shared), Some(3));
    assert_eq!(p.server.local_object_count(), baseline + 1);

    drop((first, second, third));
    assert!(wait_for(|| p.server.local_object_count() == baseline));
    assert_eq!(p.server.local_refcount(&shared), None);
    assert_eq!(p.server.stats().dels_received, 1);
}

#[test]
fn test_symmetric_callback() {
    let (p, _) = pair();
    let root = p.client.root().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let callback = Object::servant(FunctionObject::new("on_event", move |args| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(Object::from(format!("pong: {}", args.str(0)?)))
    }));

    let reply = root
        .call_method("call_back", Args::new(vec![callback, Object::from("ping")]))
        .unwrap();
    assert_eq!(reply.as_str(), Some("pong: ping"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(p.client.stats().requests_received >= 1);
}

#[test]
fn test_concurrent_callers_share_one_connection() {
    let (p, _) = pair();
    let root = p.client.root().unwrap();
    let workers: Vec<_> = (0..8i64)
        .map(|worker| {
            let root = root.clone();
            std::thread::spawn(move || {
                for round in 0..20i64 {
                    let value = worker * 1000 + round;
                    let reply = root.invoke("echo", [value]).unwrap();
                    assert_eq!(reply.as_i64(), Some(value));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let stats = p.client.stats();
    assert_eq!(stats.replies_received, stats.requests_sent);
}

#[test]
fn test_bound_threads_on_both_sides() {
    let (p, _) = pair_with(
        Config::default().with_bind_threads(true),
        Config::default().with_bind_threads(true),
    );
    let root = p.client.root().unwrap();
    assert_eq!(root.invoke("echo", ["bound"]).unwrap().as_str(), Some("bound"));

    let callback = Object::servant(FunctionObject::new("twice", |args| {
        Ok(Object::from(args.i64(0)? * 2))
    }));
    let reply = root
        .call_method("call_back", Args::new(vec![callback, Object::from(21)]))
        .unwrap();
    assert_eq!(reply.as_i64(), Some(42));

    let err = root.call_method("fail", ()).unwrap_err();
    assert!(err.exception().unwrap().is_instance_of("ValueError"));

    p.client.close().unwrap();
    assert!(wait_for(|| p.server.closed()));
}

#[test]
fn test_closing_client_closes_server() {
    let (p, _) = pair();
    p.client.root().unwrap();
    p.client.close().unwrap();
    assert!(p.client.closed());
    assert!(wait_for(|| p.server.closed()));
    assert!(matches!(p.client.ping(), Err(TetherError::Closed(_))));
}
