//! End-to-end scenarios for the intake → adapter → engine → sink path,
//! driven by the loopback engine and an in-memory response collector.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use llamadds::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Role};
use llamadds_bridge::engine::{CompletionEngine, EngineDefaults};
use llamadds_bridge::{Bridge, BridgeError, ChatTemplate, EngineAdapter, IntakeQueue, LoopbackEngine, ResponseSink};

// ── Test plumbing ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Collector {
    responses: Mutex<Vec<ChatCompletionResponse>>,
    cv: Condvar,
}

impl ResponseSink for Collector {
    fn send_response(&self, resp: &ChatCompletionResponse) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(resp.clone());
        self.cv.notify_all();
    }
}

impl Collector {
    /// Responses for one request in receive order.
    fn responses_for(&self, request_id: &str) -> Vec<ChatCompletionResponse> {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect()
    }

    /// Block until the terminal response for `request_id` arrives, then
    /// return every response observed for it.
    fn wait_for_terminal(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Option<Vec<ChatCompletionResponse>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if guard
                .iter()
                .any(|r| r.request_id == request_id && r.is_final)
            {
                return Some(
                    guard
                        .iter()
                        .filter(|r| r.request_id == request_id)
                        .cloned()
                        .collect(),
                );
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }
}

struct Harness {
    bridge: Arc<Bridge>,
    sink: Arc<Collector>,
    adapter: EngineAdapter,
}

impl Harness {
    fn start(
        engine: Arc<dyn CompletionEngine>,
        request_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let sink = Arc::new(Collector::default());
        let bridge = Arc::new(Bridge::new(
            "pipeline-test",
            Arc::new(IntakeQueue::new()),
            Arc::clone(&sink) as Arc<dyn ResponseSink>,
        ));
        let adapter = EngineAdapter::spawn(Arc::clone(&bridge), engine, request_timeout)?;
        Ok(Self {
            bridge,
            sink,
            adapter,
        })
    }

    fn stop(mut self) {
        self.bridge.intake().shutdown();
        self.adapter.join();
    }
}

fn user_request(id: &str, content: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        request_id: id.into(),
        messages: vec![ChatMessage::new(Role::User, content)],
        ..Default::default()
    }
}

fn assert_counters_monotone(responses: &[ChatCompletionResponse]) {
    for pair in responses.windows(2) {
        assert!(
            pair[1].prompt_tokens >= pair[0].prompt_tokens,
            "prompt_tokens regressed: {:?}",
            pair
        );
        assert!(
            pair[1].completion_tokens >= pair[0].completion_tokens,
            "completion_tokens regressed: {:?}",
            pair
        );
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn s1_non_streaming_simple() {
    let engine = Arc::new(LoopbackEngine::new("loopback").unwrap());
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    let mut req = user_request("s1", "What is 2+2?");
    req.max_tokens = 30;
    harness.bridge.handle_request(req);

    let responses = harness
        .sink
        .wait_for_terminal("s1", Duration::from_secs(10))
        .expect("no terminal response");
    assert_eq!(responses.len(), 1, "non-streaming means exactly one sample");
    let resp = &responses[0];
    assert!(resp.is_final);
    assert!(!resp.content.is_empty());
    assert!(matches!(
        resp.finish_reason.as_deref(),
        Some("stop") | Some("length")
    ));
    assert!(resp.completion_tokens > 0);
    assert_eq!(resp.model, "loopback");

    assert_eq!(harness.bridge.intake().in_flight(), 0);
    assert!(!harness.bridge.intake().has_pending_requests());
    harness.stop();
}

#[test]
fn s2_streaming_deltas_with_single_terminal() {
    let engine = Arc::new(LoopbackEngine::new("loopback").unwrap());
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    let mut req = user_request("s2", "Explain machine learning in a few sentences.");
    req.max_tokens = 100;
    req.stream = true;
    harness.bridge.handle_request(req);

    let responses = harness
        .sink
        .wait_for_terminal("s2", Duration::from_secs(10))
        .expect("no terminal response");
    assert!(responses.len() >= 2, "expected streamed deltas");
    let (finals, partials): (Vec<_>, Vec<_>) = responses.iter().partition(|r| r.is_final);
    assert_eq!(finals.len(), 1, "exactly one terminal per request");
    assert!(partials.iter().all(|r| r.finish_reason.is_none()));
    assert!(responses.last().unwrap().is_final, "terminal arrives last");

    let concatenated: String = responses.iter().map(|r| r.content.as_str()).collect();
    assert!(!concatenated.is_empty());
    assert_counters_monotone(&responses);
    harness.stop();
}

#[test]
fn streaming_concatenation_matches_non_streaming() {
    let engine = Arc::new(LoopbackEngine::new("loopback").unwrap());
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    let content = "The quick brown fox jumps over the lazy dog.";
    let mut streamed = user_request("concat-stream", content);
    streamed.stream = true;
    streamed.temperature = 0.0;
    let mut plain = user_request("concat-plain", content);
    plain.temperature = 0.0;

    harness.bridge.handle_request(streamed);
    harness.bridge.handle_request(plain);

    let streamed = harness
        .sink
        .wait_for_terminal("concat-stream", Duration::from_secs(10))
        .expect("no streamed terminal");
    let plain = harness
        .sink
        .wait_for_terminal("concat-plain", Duration::from_secs(10))
        .expect("no plain terminal");

    let concatenated: String = streamed.iter().map(|r| r.content.as_str()).collect();
    assert_eq!(plain.len(), 1);
    assert_eq!(concatenated, plain[0].content);
    harness.stop();
}

#[test]
fn s3_deadline_produces_single_timeout_error() {
    let engine = Arc::new(
        LoopbackEngine::builder("loopback")
            .token_delay(Duration::from_millis(100))
            .build()
            .unwrap(),
    );
    let harness = Harness::start(engine, Duration::from_secs(1)).unwrap();

    let mut req = user_request(
        "s3",
        "one two three four five six seven eight nine ten eleven twelve \
         thirteen fourteen fifteen sixteen seventeen eighteen nineteen twenty",
    );
    req.max_tokens = 100_000;
    harness.bridge.handle_request(req);

    let responses = harness
        .sink
        .wait_for_terminal("s3", Duration::from_secs(15))
        .expect("no terminal response");
    let finals: Vec<_> = responses.iter().filter(|r| r.is_final).collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].finish_reason.as_deref(), Some("error"));
    assert!(
        finals[0].content.starts_with("[timeout"),
        "unexpected timeout content: {}",
        finals[0].content
    );
    assert_eq!(harness.bridge.intake().in_flight(), 0);
    harness.stop();
}

#[test]
fn s4_empty_prompt_after_template_is_a_terminal_error() {
    // A template that renders nothing makes tokenization come back empty.
    let engine = Arc::new(
        LoopbackEngine::builder("loopback")
            .chat_template(ChatTemplate::new("").unwrap())
            .build()
            .unwrap(),
    );
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    harness
        .bridge
        .handle_request(user_request("s4", "this will vanish"));

    let responses = harness
        .sink
        .wait_for_terminal("s4", Duration::from_secs(10))
        .expect("no terminal response");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].finish_reason.as_deref(), Some("error"));
    assert_eq!(harness.bridge.intake().in_flight(), 0);
    assert!(!harness.bridge.intake().has_pending_requests());
    harness.stop();
}

#[test]
fn s5_concurrent_streaming_clients() {
    let engine = Arc::new(LoopbackEngine::new("loopback").unwrap());
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    const CLIENTS: usize = 8;
    const PER_CLIENT: usize = 10;

    let bridge = Arc::clone(&harness.bridge);
    let mut submitters = Vec::new();
    for client in 0..CLIENTS {
        let bridge = Arc::clone(&bridge);
        submitters.push(std::thread::spawn(move || {
            for i in 0..PER_CLIENT {
                let mut req = user_request(
                    &format!("c{client}-r{i}"),
                    "every delta of this answer must come back in order",
                );
                req.stream = true;
                bridge.handle_request(req);
            }
        }));
    }
    for s in submitters {
        s.join().unwrap();
    }

    let mut terminals = 0;
    for client in 0..CLIENTS {
        for i in 0..PER_CLIENT {
            let id = format!("c{client}-r{i}");
            let responses = harness
                .sink
                .wait_for_terminal(&id, Duration::from_secs(30))
                .unwrap_or_else(|| panic!("no terminal for {id}"));
            let finals = responses.iter().filter(|r| r.is_final).count();
            assert_eq!(finals, 1, "exactly one terminal for {id}");
            terminals += finals;

            let concatenated: String = responses.iter().map(|r| r.content.as_str()).collect();
            assert!(!concatenated.is_empty());
            assert_counters_monotone(&responses);
        }
    }
    assert_eq!(terminals, CLIENTS * PER_CLIENT);

    // No-leak: everything accepted has been terminally answered.
    assert_eq!(harness.bridge.intake().in_flight(), 0);
    assert!(!harness.bridge.intake().has_pending_requests());
    harness.stop();
}

#[test]
fn s6_status_slots_stay_consistent_under_load() {
    use llamadds::ServerStatus;
    use llamadds_bridge::{StatusPublisher, StatusSink};

    #[derive(Default)]
    struct StatusCollector {
        statuses: Mutex<Vec<ServerStatus>>,
    }
    impl StatusSink for StatusCollector {
        fn publish_status(&self, status: &ServerStatus) {
            self.statuses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(status.clone());
        }
    }

    let engine = Arc::new(
        LoopbackEngine::builder("loopback")
            .token_delay(Duration::from_millis(50))
            .build()
            .unwrap(),
    );
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();
    harness.bridge.set_model_info("loopback", true, 4);

    let statuses = Arc::new(StatusCollector::default());
    let mut publisher = StatusPublisher::spawn(
        Arc::clone(&harness.bridge),
        Arc::clone(&statuses) as Arc<dyn StatusSink>,
        Duration::from_millis(50),
    )
    .unwrap();

    for id in ["s6-a", "s6-b"] {
        harness
            .bridge
            .handle_request(user_request(id, "some words to chew on for a while here"));
    }
    for id in ["s6-a", "s6-b"] {
        harness
            .sink
            .wait_for_terminal(id, Duration::from_secs(15))
            .expect("no terminal response");
    }
    std::thread::sleep(Duration::from_millis(150));
    publisher.stop();

    let statuses = statuses.statuses.lock().unwrap();
    assert!(!statuses.is_empty(), "expected heartbeats during the run");
    for status in statuses.iter() {
        assert!(
            (0..=2).contains(&status.slots_processing),
            "slots_processing out of range: {status:?}"
        );
        assert_eq!(status.slots_idle, (4 - status.slots_processing).max(0));
        assert!(status.ready);
        assert_eq!(status.model_loaded, "loopback");
    }
    harness.stop();
}

// ── Boundary behaviors ────────────────────────────────────────────────────────

#[test]
fn empty_messages_list_is_a_validation_error() {
    let engine = Arc::new(LoopbackEngine::new("loopback").unwrap());
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    let req = ChatCompletionRequest {
        request_id: "no-messages".into(),
        ..Default::default()
    };
    harness.bridge.handle_request(req);

    let responses = harness
        .sink
        .wait_for_terminal("no-messages", Duration::from_secs(10))
        .expect("no terminal response");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].finish_reason.as_deref(), Some("error"));
    harness.stop();
}

#[test]
fn unknown_role_is_a_validation_error() {
    let engine = Arc::new(LoopbackEngine::new("loopback").unwrap());
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    let req = ChatCompletionRequest {
        request_id: "bad-role".into(),
        messages: vec![ChatMessage {
            role: "tool".into(),
            content: "nope".into(),
        }],
        ..Default::default()
    };
    harness.bridge.handle_request(req);

    let responses = harness
        .sink
        .wait_for_terminal("bad-role", Duration::from_secs(10))
        .expect("no terminal response");
    assert_eq!(responses[0].finish_reason.as_deref(), Some("error"));
    assert!(responses[0].content.contains("tool"));
    harness.stop();
}

#[test]
fn zero_max_tokens_applies_engine_default() {
    let engine = Arc::new(
        LoopbackEngine::builder("loopback")
            .defaults(EngineDefaults {
                n_predict: 2,
                temperature: 0.8,
            })
            .build()
            .unwrap(),
    );
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    // max_tokens stays 0: the engine default (2) must cap generation.
    harness
        .bridge
        .handle_request(user_request("default-budget", "a b c d e f g"));

    let responses = harness
        .sink
        .wait_for_terminal("default-budget", Duration::from_secs(10))
        .expect("no terminal response");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].completion_tokens, 2);
    assert_eq!(responses[0].finish_reason.as_deref(), Some("length"));
    harness.stop();
}

#[test]
fn requested_model_name_is_echoed() {
    let engine = Arc::new(LoopbackEngine::new("loopback").unwrap());
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    let mut req = user_request("named-model", "hello there");
    req.model = "custom-model".into();
    harness.bridge.handle_request(req);

    let responses = harness
        .sink
        .wait_for_terminal("named-model", Duration::from_secs(10))
        .expect("no terminal response");
    assert_eq!(responses[0].model, "custom-model");
    harness.stop();
}

#[test]
fn engine_error_surfaces_as_terminal_error() {
    let engine = Arc::new(
        LoopbackEngine::builder("loopback")
            .error_after(1)
            .build()
            .unwrap(),
    );
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    let mut req = user_request("engine-err", "several words to generate from");
    req.stream = true;
    harness.bridge.handle_request(req);

    let responses = harness
        .sink
        .wait_for_terminal("engine-err", Duration::from_secs(10))
        .expect("no terminal response");
    let last = responses.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.finish_reason.as_deref(), Some("error"));
    assert!(last.content.starts_with("[error]"));
    assert_eq!(harness.bridge.intake().in_flight(), 0);
    harness.stop();
}

#[test]
fn shutdown_drains_staged_requests_with_errors() {
    let engine = Arc::new(
        LoopbackEngine::builder("loopback")
            .token_delay(Duration::from_millis(50))
            .build()
            .unwrap(),
    );
    let harness = Harness::start(engine, Duration::from_secs(60)).unwrap();

    harness.bridge.handle_request(user_request(
        "slow-head",
        "quite a few words so this request takes a little while to serve",
    ));
    // Give the driver time to pop the head request before staging the rest.
    std::thread::sleep(Duration::from_millis(150));
    harness.bridge.handle_request(user_request("staged-1", "left behind"));
    harness.bridge.handle_request(user_request("staged-2", "also left behind"));

    let bridge = Arc::clone(&harness.bridge);
    let sink = Arc::clone(&harness.sink);
    harness.stop();

    for id in ["staged-1", "staged-2"] {
        let responses = sink.responses_for(id);
        assert_eq!(responses.len(), 1, "one terminal for {id}");
        assert_eq!(responses[0].finish_reason.as_deref(), Some("error"));
        assert!(responses[0].content.starts_with("[shutdown]"));
    }
    // The in-flight request still finished normally.
    let head = sink.responses_for("slow-head");
    assert!(head.iter().any(|r| r.is_final && !r.is_error()));
    assert_eq!(bridge.intake().in_flight(), 0);
    assert!(!bridge.intake().has_pending_requests());
}
