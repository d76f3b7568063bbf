//! End-to-end behavior of live chains.

use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use trooba_core::prelude::*;
use trooba_core::{FaultPolicy, Pipe, UnmatchedPolicy};

type Log = Arc<Mutex<Vec<String>>>;

const WAIT: Duration = Duration::from_secs(2);

/// Routes every message reaching the head into a channel.
fn collect(pipe: &Pipe) -> mpsc::UnboundedReceiver<(String, Payload)> {
    let (tx, rx) = mpsc::unbounded_channel();
    pipe.on("*", move |_, payload, next| {
        let _ = tx.send((next.kind().to_string(), payload));
        next.discard();
    })
    .unwrap();
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<(String, Payload)>) -> (String, Payload) {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for the head")
        .expect("chain closed")
}

fn pass_through(stage: &Stage, _: &StageConfig) -> PipeResult<Attach> {
    stage.on(kinds::REQUEST, |_, _, next| {
        next.pass();
    })?;
    Ok(Attach::Stage)
}

fn echo(stage: &Stage, _: &StageConfig) -> PipeResult<Attach> {
    stage.on(kinds::REQUEST, |stage, payload, _| {
        stage.send(Message::response(payload));
    })?;
    Ok(Attach::Stage)
}

fn marker(
    name: &'static str,
    log: Log,
) -> impl Fn(&Stage, &StageConfig) -> PipeResult<Attach> + Send + Sync + 'static {
    move |stage, _| {
        let fwd = Arc::clone(&log);
        stage.on(kinds::REQUEST, move |_, _, next| {
            fwd.lock().push(format!("{name}-fwd"));
            next.pass();
        })?;
        let bwd = Arc::clone(&log);
        stage.on(kinds::RESPONSE, move |_, _, next| {
            bwd.lock().push(format!("{name}-bwd"));
            next.pass();
        })?;
        Ok(Attach::Stage)
    }
}

#[tokio::test]
async fn test_round_trip_through_pass_through_stages() {
    let pipeline = Trooba::new()
        .use_fn(pass_through)
        .use_fn(pass_through)
        .use_fn(pass_through)
        .use_fn(echo)
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request(json!({"id": 7, "items": ["a", "b"]})));

    let (kind, payload) = recv(&mut rx).await;
    assert_eq!(kind, kinds::RESPONSE);
    assert_eq!(payload.as_json(), Some(&json!({"id": 7, "items": ["a", "b"]})));
}

#[tokio::test]
async fn test_processing_is_deferred() {
    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, _, next| {
                stage.store().insert("seen", true);
                next.pass();
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(echo)
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request("x"));

    assert!(!pipe.store().contains("seen"));
    recv(&mut rx).await;
    assert_eq!(pipe.store().get::<bool>("seen").as_deref(), Some(&true));
}

#[tokio::test]
async fn test_forward_and_backward_order() {
    let log: Log = Arc::default();
    let terminal_log = Arc::clone(&log);

    let pipeline = Trooba::new()
        .use_fn(marker("s1", Arc::clone(&log)))
        .use_fn(marker("s2", Arc::clone(&log)))
        .use_fn(move |stage, _| {
            let log = Arc::clone(&terminal_log);
            stage.on(kinds::REQUEST, move |stage, payload, _| {
                log.lock().push("s3-fwd".into());
                log.lock().push("s3-bwd".into());
                stage.send(Message::response(payload));
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request(Payload::Empty));
    recv(&mut rx).await;

    assert_eq!(
        *log.lock(),
        vec!["s1-fwd", "s2-fwd", "s3-fwd", "s3-bwd", "s2-bwd", "s1-bwd"]
    );
}

#[tokio::test]
async fn test_double_continuation_delivers_once() {
    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::RESPONSE, |_, _, next| {
                assert!(next.pass());
                assert!(!next.pass());
                assert!(!next.replace("again"));
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(echo)
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request("once"));

    let (_, payload) = recv(&mut rx).await;
    assert_eq!(payload.as_json(), Some(&json!("once")));
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_slow_stage_holds_back_the_chain() {
    const HOLD: Duration = Duration::from_millis(60);
    let reached: Arc<Mutex<Option<Instant>>> = Arc::default();
    let reached_at = Arc::clone(&reached);

    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |_, _, next| {
                tokio::spawn(async move {
                    sleep(HOLD).await;
                    next.pass();
                });
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(move |stage, _| {
            let reached_at = Arc::clone(&reached_at);
            stage.on(kinds::REQUEST, move |stage, payload, _| {
                reached_at.lock().get_or_insert_with(Instant::now);
                stage.send(Message::response(payload));
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    let started = Instant::now();
    pipe.send(Message::request("slow"));
    recv(&mut rx).await;

    assert!(started.elapsed() >= HOLD);
    let reached = (*reached.lock()).expect("terminal stage reached");
    assert!(reached.duration_since(started) >= HOLD);
}

#[tokio::test]
async fn test_stalled_stage_queues_later_messages() {
    let held: Arc<Mutex<Option<Next>>> = Arc::default();
    let holder = Arc::clone(&held);
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);

    let pipeline = Trooba::new()
        .use_fn(move |stage, _| {
            let holder = Arc::clone(&holder);
            let counter = Arc::clone(&counter);
            stage.on(kinds::REQUEST, move |_, _, next| {
                counter.fetch_add(1, Ordering::SeqCst);
                *holder.lock() = Some(next);
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(echo)
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request("first"));
    pipe.send(Message::request("second"));
    sleep(Duration::from_millis(20)).await;

    let stage = pipe.actuator().stage_at(1).unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(stage.queue_len(), 1);

    let next = held.lock().take().unwrap();
    next.pass();
    let (_, first) = recv(&mut rx).await;
    assert_eq!(first.as_json(), Some(&json!("first")));

    // The second message is now held in turn.
    sleep(Duration::from_millis(20)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 2);
    held.lock().take().unwrap().pass();
    let (_, second) = recv(&mut rx).await;
    assert_eq!(second.as_json(), Some(&json!("second")));
}

#[tokio::test]
async fn test_dropped_continuation_releases_stage() {
    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, payload, next| {
                if payload.as_json() == Some(&json!("swallow")) {
                    drop(next);
                } else {
                    stage.send(Message::response(payload));
                }
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request("swallow"));
    pipe.send(Message::request("answer"));

    let (_, payload) = recv(&mut rx).await;
    assert_eq!(payload.as_json(), Some(&json!("answer")));
}

#[tokio::test]
async fn test_retry_after_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let terminal_calls = Arc::clone(&attempts);

    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, payload, next| {
                stage.store().insert("request", payload);
                stage.store().insert("retries", AtomicUsize::new(0));
                next.pass();
            })?;
            stage.on(kinds::ERROR, |stage, _, next| {
                let retries = stage.store().get::<AtomicUsize>("retries").unwrap();
                if retries.fetch_add(1, Ordering::SeqCst) == 0 {
                    let original = stage.store().get::<Payload>("request").unwrap();
                    stage.send(Message::request((*original).clone()));
                    next.discard();
                } else {
                    next.pass();
                }
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(move |stage, _| {
            let calls = Arc::clone(&terminal_calls);
            stage.on(kinds::REQUEST, move |stage, payload, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    stage.throw(PipeError::handler("flaky"));
                } else {
                    stage.send(Message::response(payload));
                }
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request("order-1"));

    let (kind, payload) = recv(&mut rx).await;
    assert_eq!(kind, kinds::RESPONSE);
    assert_eq!(payload.as_json(), Some(&json!("order-1")));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_error_substitution() {
    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::ERROR, |_, payload, next| {
                let original = payload.as_error().map(ToString::to_string).unwrap_or_default();
                next.replace(PipeError::handler(format!("wrapped: {original}")));
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, _, _| {
                stage.throw(PipeError::handler("boom"));
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request(Payload::Empty));

    let (kind, payload) = recv(&mut rx).await;
    assert_eq!(kind, kinds::ERROR);
    assert_eq!(payload.as_error().unwrap().to_string(), "wrapped: boom");
}

#[tokio::test]
async fn test_missing_consumer_is_reported() {
    let pipeline = Trooba::new()
        .use_fn(|_, _| Ok(Attach::Stage))
        .use_fn(|_, _| Ok(Attach::Stage))
        .context(Context::new().validate(kinds::REQUEST))
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request(json!({"q": 1})));

    let (kind, payload) = recv(&mut rx).await;
    assert_eq!(kind, kinds::ERROR);
    assert_eq!(
        payload.as_error().unwrap().to_string(),
        r#"No target consumer found for message request:{"q":1}"#
    );
}

#[tokio::test]
async fn test_missing_consumer_on_empty_chain() {
    let pipe = Trooba::new()
        .build()
        .create_with(Context::new().validate("ping"))
        .unwrap();
    let mut rx = collect(&pipe);
    pipe.send_kind("ping", "x", Direction::Forward);

    let (kind, payload) = recv(&mut rx).await;
    assert_eq!(kind, kinds::ERROR);
    assert!(matches!(
        payload.as_error(),
        Some(PipeError::NoTargetConsumer { kind, .. }) if kind == "ping"
    ));
}

#[tokio::test]
async fn test_unvalidated_message_is_dropped() {
    let pipeline = Trooba::new().use_fn(|_, _| Ok(Attach::Stage)).build();
    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send_kind("ping", Payload::Empty, Direction::Forward);

    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_reject_policy_reports_any_kind() {
    let pipeline = Trooba::new().use_fn(|_, _| Ok(Attach::Stage)).build();
    let pipe = pipeline
        .create_with(Context::new().unmatched(UnmatchedPolicy::Reject))
        .unwrap();
    let mut rx = collect(&pipe);
    pipe.send_kind("ping", Payload::Empty, Direction::Forward);

    let (kind, payload) = recv(&mut rx).await;
    assert_eq!(kind, kinds::ERROR);
    assert_eq!(
        payload.as_error().unwrap().to_string(),
        "No target consumer found for message ping:null"
    );
}

#[tokio::test]
async fn test_unhandled_error_reaches_fault_hook() {
    let (tx, mut faults) = mpsc::unbounded_channel();
    let ctx = Context::new().fault(FaultPolicy::hook(move |err| {
        let _ = tx.send(err.to_string());
    }));

    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, _, _| {
                stage.throw(PipeError::handler("nobody listens"));
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create_with(ctx).unwrap();
    pipe.send(Message::request(Payload::Empty));

    let fault = timeout(WAIT, faults.recv()).await.unwrap().unwrap();
    assert_eq!(fault, "nobody listens");
}

#[tokio::test]
async fn test_panic_fault_keeps_stages_running() {
    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, payload, _| {
                if payload.as_json() == Some(&json!("fail")) {
                    stage.throw(PipeError::handler("boom"));
                } else {
                    stage.send(Message::response(payload));
                }
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline
        .create_with(Context::new().fault(FaultPolicy::Panic))
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    pipe.on(kinds::RESPONSE, move |_, payload, next| {
        let _ = tx.send(payload);
        next.discard();
    })
    .unwrap();

    // The error panics inside the head's consumer, which keeps going.
    pipe.send(Message::request("fail"));
    pipe.send(Message::request("ok"));

    let payload = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload.as_json(), Some(&json!("ok")));
}

const FAULT_CHILD: &str = "TROOBA_FAULT_CHILD";

#[test]
fn test_default_fault_policy_aborts_the_process() {
    if std::env::var_os(FAULT_CHILD).is_some() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let pipeline = Trooba::new()
                .use_fn(|stage, _| {
                    stage.on(kinds::REQUEST, |stage, _, _| {
                        stage.throw(PipeError::handler("boom"));
                    })?;
                    Ok(Attach::Stage)
                })
                .build();
            let pipe = pipeline.create().unwrap();
            pipe.send(Message::request(Payload::Empty));
            sleep(Duration::from_millis(200)).await;
        });
        println!("still alive after unhandled error");
        return;
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([
            "--exact",
            "test_default_fault_policy_aborts_the_process",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(FAULT_CHILD, "1")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(!String::from_utf8_lossy(&output.stdout).contains("still alive"));
}

#[tokio::test]
async fn test_missing_consumer_behind_the_head_is_reported_to_it() {
    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, payload, next| {
                stage.send_kind("notice", payload, Direction::Backward);
                next.discard();
            })?;
            Ok(Attach::Stage)
        })
        .context(Context::new().validate("notice"))
        .build();

    let pipe = pipeline.create().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    pipe.on(kinds::ERROR, move |_, payload, next| {
        let _ = tx.send(payload);
        next.discard();
    })
    .unwrap();
    pipe.send(Message::request(json!({"n": 2})));

    let payload = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        payload.as_error().unwrap().to_string(),
        r#"No target consumer found for message notice:{"n":2}"#
    );
}

#[tokio::test]
async fn test_one_way_message_does_not_stall() {
    let seen: Log = Arc::default();
    let log = Arc::clone(&seen);

    let pipeline = Trooba::new()
        .use_fn(move |stage, _| {
            let log = Arc::clone(&log);
            stage.on("chunk", move |_, payload, next| {
                log.lock().push(payload.render());
                // Never resumed on purpose; one-way delivery must not wait.
                assert!(!next.pass());
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create().unwrap();
    for i in 0..3 {
        pipe.send(Message::new("chunk", json!(i), Direction::Forward).one_way(true));
    }
    sleep(Duration::from_millis(20)).await;

    assert_eq!(*seen.lock(), vec!["0", "1", "2"]);
}

#[tokio::test]
async fn test_once_and_remove_listener() {
    let count = Arc::new(AtomicUsize::new(0));

    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, payload, _| {
                stage.send(Message::response(payload.clone()));
                stage.send(Message::response(payload));
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create().unwrap();
    let c = Arc::clone(&count);
    pipe.once(kinds::RESPONSE, move |_, _, next| {
        c.fetch_add(1, Ordering::SeqCst);
        next.discard();
    })
    .unwrap();
    assert!(pipe.has_handler(kinds::RESPONSE));

    pipe.send(Message::request("x"));
    sleep(Duration::from_millis(20)).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!pipe.has_handler(kinds::RESPONSE));

    pipe.on("custom", |_, _, _| {}).unwrap();
    assert!(pipe.remove_listener("custom"));
    assert!(!pipe.remove_listener("custom"));
}

#[tokio::test]
async fn test_duplicate_handler_rejected() {
    let pipe = Trooba::new().build().create().unwrap();
    pipe.on(kinds::REQUEST, |_, _, _| {}).unwrap();

    let err = pipe.on(kinds::REQUEST, |_, _, _| {}).unwrap_err();
    assert!(matches!(
        err,
        PipeError::DuplicateHandler { kind, position: 0 } if kind == kinds::REQUEST
    ));
}

#[tokio::test]
async fn test_wildcard_handler_catches_unregistered_kinds() {
    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::WILDCARD, |stage, payload, next| {
                stage.send(Message::response(json!({
                    "kind": next.kind(),
                    "payload": payload.as_json().cloned().unwrap_or(Value::Null),
                })));
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send_kind("lookup", "key", Direction::Forward);

    let (_, payload) = recv(&mut rx).await;
    assert_eq!(
        payload.as_json(),
        Some(&json!({"kind": "lookup", "payload": "key"}))
    );
}

#[tokio::test]
async fn test_nested_pipelines_are_inlined() {
    let log: Log = Arc::default();
    let inner = Trooba::new()
        .use_fn(marker("x", Arc::clone(&log)))
        .use_pipeline(Trooba::new().use_fn(marker("y", Arc::clone(&log))).build())
        .build();

    let pipeline = Trooba::new()
        .use_fn(marker("a", Arc::clone(&log)))
        .use_pipeline(inner)
        .use_fn(marker("b", Arc::clone(&log)))
        .use_fn(echo)
        .build();

    let pipe = pipeline.create().unwrap();
    let mut rx = collect(&pipe);
    pipe.send(Message::request(Payload::Empty));
    recv(&mut rx).await;

    assert_eq!(
        *log.lock(),
        vec!["a-fwd", "x-fwd", "y-fwd", "b-fwd", "b-bwd", "y-bwd", "x-bwd", "a-bwd"]
    );
    // head, a, x, y, b, echo
    assert_eq!(pipe.actuator().materialized(), 6);
    assert_eq!(pipe.actuator().stage_at(3).unwrap().position(), 3);
}

#[tokio::test]
async fn test_stages_materialize_on_demand() {
    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, payload, _| {
                stage.send(Message::response(payload));
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(pass_through)
        .use_fn(pass_through)
        .build();

    let pipe = pipeline.create().unwrap();
    assert_eq!(pipe.actuator().materialized(), 1);

    let mut rx = collect(&pipe);
    pipe.send(Message::request("short-circuit"));
    recv(&mut rx).await;
    assert_eq!(pipe.actuator().materialized(), 2);
}

#[tokio::test]
async fn test_capabilities_are_inherited_forward() {
    let pipeline = Trooba::new()
        .use_fn(|_, _| Ok(Attach::Stage))
        .use_fn(|stage, _| {
            stage.decorate(
                "greet",
                capability(|stage, payload| {
                    Ok(Payload::from(format!("{} from {}", payload.render(), stage.position())))
                }),
            )?;
            Ok(Attach::Stage)
        })
        .use_fn(|_, _| Ok(Attach::Stage))
        .build();

    let pipe = pipeline.create().unwrap();
    let actuator = pipe.actuator();
    let third = actuator.resolve(3).unwrap();

    assert!(!actuator.stage_at(1).unwrap().has_capability("greet"));
    assert!(actuator.stage_at(2).unwrap().has_capability("greet"));
    assert_eq!(
        third.invoke("greet", "hi").unwrap().as_json(),
        Some(&json!("\"hi\" from 3"))
    );
    assert!(matches!(
        actuator.stage_at(1).unwrap().invoke("greet", Payload::Empty),
        Err(PipeError::CapabilityNotFound(_))
    ));

    let err = third
        .decorate("greet", capability(|_, p| Ok(p)))
        .unwrap_err();
    assert!(matches!(err, PipeError::CapabilityExists(name) if name == "greet"));
}

#[tokio::test]
async fn test_builder_decorators_run_once_on_head() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let pipeline = Trooba::new()
        .decorate(move |head| {
            counter.fetch_add(1, Ordering::SeqCst);
            head.decorate("describe", capability(|stage, _| Ok(json!(stage.position()).into())))
        })
        .use_fn(|_, _| Ok(Attach::Stage))
        .build();

    let pipe = pipeline.create().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(pipe.has_capability("describe"));

    // Installed on the head before any stage exists, so the chain inherits it.
    let first = pipe.actuator().resolve(1).unwrap();
    assert_eq!(first.invoke("describe", Payload::Empty).unwrap().as_json(), Some(&json!(1)));

    pipeline.create().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_trace_route_visits_every_stage() {
    let pipeline = Trooba::new()
        .use_fn(pass_through)
        .use_fn(pass_through)
        .build();

    let pipe = pipeline.create().unwrap();
    let route: Vec<_> = pipe
        .trace_route()
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.position, p.direction))
        .collect();

    assert_eq!(
        route,
        vec![
            (1, Direction::Forward),
            (2, Direction::Forward),
            (1, Direction::Backward),
            (0, Direction::Backward),
        ]
    );
}

#[tokio::test]
async fn test_trace_route_on_head_only_chain() {
    let pipe = Trooba::new().build().create().unwrap();
    let route = pipe.trace_route().await.unwrap();
    assert_eq!(route.len(), 1);
    assert_eq!(route[0].position, 0);
    assert_eq!(route[0].direction, Direction::Backward);
}

#[tokio::test]
async fn test_trace_reports_depth_of_stalled_stage() {
    let held: Arc<Mutex<Vec<Next>>> = Arc::default();
    let holder = Arc::clone(&held);

    let pipeline = Trooba::new()
        .use_fn(move |stage, _| {
            let holder = Arc::clone(&holder);
            stage.on(kinds::REQUEST, move |_, _, next| holder.lock().push(next))?;
            Ok(Attach::Stage)
        })
        .use_fn(echo)
        .build();

    let pipe = pipeline.create().unwrap();
    for n in 0..3 {
        pipe.send(Message::request(json!(n)));
    }
    sleep(Duration::from_millis(20)).await;

    let route: Vec<_> = timeout(WAIT, pipe.trace_route())
        .await
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|p| (p.position, p.direction, p.queue_len))
        .collect();

    assert_eq!(
        route,
        vec![
            (1, Direction::Forward, 2),
            (2, Direction::Forward, 0),
            (1, Direction::Backward, 2),
            (0, Direction::Backward, 0),
        ]
    );
    assert_eq!(held.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_chains_keep_state_isolated() {
    use rand::Rng;

    let pipeline = Trooba::new()
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, payload, next| {
                let id = stage.context().get("id");
                stage.store().insert("id", id);
                let delay = rand::thread_rng().gen_range(0..5);
                tokio::spawn(async move {
                    sleep(Duration::from_millis(delay)).await;
                    next.replace(payload);
                });
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(|stage, _| {
            stage.on(kinds::REQUEST, |stage, payload, _| {
                let stored = stage.store().get::<Option<Value>>("id");
                let stored = stored.as_deref().cloned().flatten();
                stage.send(Message::response(json!({
                    "request": payload.as_json().cloned(),
                    "context": stage.context().get("id"),
                    "store": stored,
                })));
            })?;
            Ok(Attach::Stage)
        })
        .build();

    let mut tasks = Vec::new();
    for id in 0..1000u64 {
        let pipeline = pipeline.clone();
        tasks.push(tokio::spawn(async move {
            let pipe = pipeline
                .create_with(Context::new().attribute("id", id))
                .unwrap();
            let mut rx = collect(&pipe);
            pipe.send(Message::request(json!(id)));
            let (_, payload) = recv(&mut rx).await;
            (id, payload)
        }));
    }

    for task in futures::future::join_all(tasks).await {
        let (id, payload) = task.unwrap();
        assert_eq!(
            payload.as_json(),
            Some(&json!({"request": id, "context": id, "store": id}))
        );
    }
}

#[tokio::test]
async fn test_dropping_the_pipe_discards_pending_work() {
    let held: Arc<Mutex<Option<Next>>> = Arc::default();
    let holder = Arc::clone(&held);

    let pipeline = Trooba::new()
        .use_fn(move |stage, _| {
            let holder = Arc::clone(&holder);
            stage.on(kinds::REQUEST, move |_, _, next| {
                *holder.lock() = Some(next);
            })?;
            Ok(Attach::Stage)
        })
        .use_fn(echo)
        .build();

    let pipe = pipeline.create().unwrap();
    pipe.send(Message::request("late"));
    sleep(Duration::from_millis(10)).await;
    drop(pipe);

    // The chain is gone; resuming still releases the continuation cleanly.
    let next = held.lock().take().unwrap();
    assert!(next.pass());
}
