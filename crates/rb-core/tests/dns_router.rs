//! End-to-end DNS router scenarios over scriptable fake transports.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use rb_config::{DnsOptions, DnsRuleAction, DnsRuleOptions};
use rb_core::dns::message::{
    Message, Question, RCODE_FORMAT_ERROR, RCODE_NAME_ERROR, RCODE_REFUSED, RCODE_SUCCESS, TYPE_A,
};
use rb_core::dns::router::DnsRouter;
use rb_core::dns::transport::{DnsTransport, DnsTransportManager};
use rb_core::dns::DnsQueryOptions;
use rb_core::error::Error;

#[derive(Clone)]
enum Behavior {
    Answer(Vec<IpAddr>),
    Rcode(u16),
    Rejected,
    RejectedCached,
    Fail,
}

struct FakeTransport {
    tag: String,
    delay: Duration,
    behavior: Behavior,
    calls: AtomicU32,
    last_call_at: Mutex<Option<tokio::time::Instant>>,
}

impl FakeTransport {
    fn new(tag: &str, delay: Duration, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            delay,
            behavior,
            calls: AtomicU32::new(0),
            last_call_at: Mutex::new(None),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::Acquire)
    }

    fn last_call_at(&self) -> Option<tokio::time::Instant> {
        *self.last_call_at.lock()
    }
}

#[async_trait]
impl DnsTransport for FakeTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn transport_type(&self) -> &'static str {
        "fake"
    }

    async fn exchange(&self, message: &Message) -> rb_core::Result<Message> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        *self.last_call_at.lock() = Some(tokio::time::Instant::now());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            Behavior::Answer(addrs) => {
                let mut response = Message::response_to(message, RCODE_SUCCESS);
                let question = &message.question[0];
                for addr in addrs {
                    match addr {
                        IpAddr::V4(v4) if question.qtype == TYPE_A => {
                            response.answer.push(
                                rb_core::dns::message::Record::a(question.name.clone(), 300, *v4),
                            );
                        }
                        IpAddr::V6(v6) if question.qtype != TYPE_A => {
                            response.answer.push(rb_core::dns::message::Record::aaaa(
                                question.name.clone(),
                                300,
                                *v6,
                            ));
                        }
                        _ => {}
                    }
                }
                Ok(response)
            }
            Behavior::Rcode(rcode) => Ok(Message::response_to(message, *rcode)),
            Behavior::Rejected => Err(Error::ResponseRejected),
            Behavior::RejectedCached => Err(Error::ResponseRejectedCached),
            Behavior::Fail => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "upstream unreachable",
            ))),
        }
    }
}

fn router(
    transports: &[Arc<FakeTransport>],
    default_tag: Option<&str>,
    options: DnsOptions,
) -> DnsRouter {
    let manager = Arc::new(DnsTransportManager::new());
    for transport in transports {
        manager.register(Arc::clone(transport) as Arc<dyn DnsTransport>);
    }
    if let Some(tag) = default_tag {
        manager.set_default(tag);
    }
    DnsRouter::new(manager, &options).unwrap()
}

fn route_rule(servers: &[&str]) -> DnsRuleOptions {
    DnsRuleOptions {
        servers: servers.iter().map(|s| s.to_string()).collect(),
        ..DnsRuleOptions::default()
    }
}

fn query(domain: &str) -> Message {
    Message::query(domain, TYPE_A)
}

fn v4(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

async fn exchange(router: &DnsRouter, message: &Message) -> rb_core::Result<Message> {
    router
        .exchange(
            &CancellationToken::new(),
            message,
            DnsQueryOptions::default(),
        )
        .await
}

#[tokio::test(start_paused = true)]
async fn hedged_racer_prefers_primary_within_upstream_timeout() {
    let primary = FakeTransport::new(
        "p",
        Duration::from_millis(50),
        Behavior::Answer(vec![v4("192.0.2.1")]),
    );
    let fallback = FakeTransport::new(
        "f",
        Duration::from_millis(10),
        Behavior::Answer(vec![v4("192.0.2.2")]),
    );
    let router = router(
        &[primary.clone(), fallback.clone()],
        None,
        DnsOptions {
            rules: vec![DnsRuleOptions {
                fallback_servers: vec!["f".to_string()],
                upstream_timeout: Some(Duration::from_millis(200)),
                ..route_rule(&["p"])
            }],
            ..DnsOptions::default()
        },
    );

    let response = exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(response.answer_addrs(), vec![v4("192.0.2.1")]);
    assert_eq!(primary.calls(), 1);
    assert_eq!(fallback.calls(), 0, "fallback must never start");
}

#[tokio::test(start_paused = true)]
async fn hedged_racer_falls_back_after_upstream_timeout() {
    let primary = FakeTransport::new(
        "p",
        Duration::from_millis(50),
        Behavior::Answer(vec![v4("192.0.2.1")]),
    );
    let fallback = FakeTransport::new(
        "f",
        Duration::from_millis(10),
        Behavior::Answer(vec![v4("192.0.2.2")]),
    );
    let router = router(
        &[primary.clone(), fallback.clone()],
        None,
        DnsOptions {
            rules: vec![DnsRuleOptions {
                fallback_servers: vec!["f".to_string()],
                upstream_timeout: Some(Duration::from_millis(20)),
                ..route_rule(&["p"])
            }],
            ..DnsOptions::default()
        },
    );

    let started = tokio::time::Instant::now();
    let response = exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(response.answer_addrs(), vec![v4("192.0.2.2")]);
    assert_eq!(fallback.calls(), 1);
    let fallback_started = fallback.last_call_at().unwrap();
    assert!(
        fallback_started - started >= Duration::from_millis(20),
        "fallback may not perform i/o before the upstream timeout elapses"
    );
}

#[tokio::test(start_paused = true)]
async fn hedge_grace_keeps_primary_alive_past_upstream_timeout() {
    // Primary answers at 30ms, after the 20ms hedge point but within the
    // 100ms grace; the slower fallback must lose to it.
    let primary = FakeTransport::new(
        "p",
        Duration::from_millis(30),
        Behavior::Answer(vec![v4("192.0.2.1")]),
    );
    let fallback = FakeTransport::new(
        "f",
        Duration::from_millis(50),
        Behavior::Answer(vec![v4("192.0.2.2")]),
    );
    let router = router(
        &[primary.clone(), fallback.clone()],
        None,
        DnsOptions {
            rules: vec![DnsRuleOptions {
                fallback_servers: vec!["f".to_string()],
                upstream_timeout: Some(Duration::from_millis(20)),
                fallback_grace: Some(Duration::from_millis(100)),
                ..route_rule(&["p"])
            }],
            ..DnsOptions::default()
        },
    );

    let response = exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(response.answer_addrs(), vec![v4("192.0.2.1")]);
}

#[tokio::test]
async fn racer_classifies_all_rejected_cached() {
    let a = FakeTransport::new("a", Duration::ZERO, Behavior::RejectedCached);
    let b = FakeTransport::new("b", Duration::ZERO, Behavior::RejectedCached);
    let router = router(
        &[a, b],
        None,
        DnsOptions {
            rules: vec![route_rule(&["a", "b"])],
            ..DnsOptions::default()
        },
    );
    let err = exchange(&router, &query("example.com")).await.unwrap_err();
    assert!(matches!(err, Error::ResponseRejectedCached));
}

#[tokio::test]
async fn racer_classifies_mixed_rejected() {
    let a = FakeTransport::new("a", Duration::ZERO, Behavior::Rejected);
    let b = FakeTransport::new("b", Duration::ZERO, Behavior::RejectedCached);
    let router = router(
        &[a, b],
        None,
        DnsOptions {
            rules: vec![route_rule(&["a", "b"])],
            ..DnsOptions::default()
        },
    );
    let err = exchange(&router, &query("example.com")).await.unwrap_err();
    assert!(matches!(err, Error::ResponseRejected));
}

#[tokio::test]
async fn racer_aggregates_mixed_reject_and_generic_errors() {
    let a = FakeTransport::new("a", Duration::ZERO, Behavior::Rejected);
    let b = FakeTransport::new("b", Duration::ZERO, Behavior::Fail);
    let router = router(
        &[a, b],
        None,
        DnsOptions {
            rules: vec![route_rule(&["a", "b"])],
            ..DnsOptions::default()
        },
    );
    let err = exchange(&router, &query("example.com")).await.unwrap_err();
    assert!(matches!(err, Error::Aggregate(_) | Error::Io(_)));
}

#[tokio::test(start_paused = true)]
async fn racer_returns_at_most_one_winner() {
    let fast = FakeTransport::new(
        "fast",
        Duration::from_millis(10),
        Behavior::Answer(vec![v4("192.0.2.1")]),
    );
    let mid = FakeTransport::new(
        "mid",
        Duration::from_millis(20),
        Behavior::Answer(vec![v4("192.0.2.2")]),
    );
    let slow = FakeTransport::new(
        "slow",
        Duration::from_millis(30),
        Behavior::Answer(vec![v4("192.0.2.3")]),
    );
    let router = router(
        &[fast, mid, slow],
        None,
        DnsOptions {
            rules: vec![route_rule(&["fast", "mid", "slow"])],
            ..DnsOptions::default()
        },
    );
    let response = exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(
        response.answer_addrs(),
        vec![v4("192.0.2.1")],
        "losers' answers must never leak into the result"
    );
}

#[tokio::test(start_paused = true)]
async fn racer_retains_non_noerror_response_as_fallback() {
    let nxdomain = FakeTransport::new(
        "nx",
        Duration::from_millis(5),
        Behavior::Rcode(RCODE_NAME_ERROR),
    );
    let failing = FakeTransport::new("err", Duration::from_millis(10), Behavior::Fail);
    let router = router(
        &[nxdomain, failing],
        None,
        DnsOptions {
            rules: vec![route_rule(&["nx", "err"])],
            ..DnsOptions::default()
        },
    );
    let response = exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(response.rcode, RCODE_NAME_ERROR);
}

#[tokio::test(start_paused = true)]
async fn racer_surfaces_parent_cancellation() {
    let slow = FakeTransport::new(
        "slow",
        Duration::from_secs(10),
        Behavior::Answer(vec![v4("192.0.2.1")]),
    );
    let router = Arc::new(router(
        &[slow],
        None,
        DnsOptions {
            rules: vec![route_rule(&["slow"])],
            ..DnsOptions::default()
        },
    ));
    let cancel = CancellationToken::new();
    let task = {
        let router = Arc::clone(&router);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            router
                .exchange(&cancel, &query("example.com"), DnsQueryOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn non_single_question_yields_format_error() {
    let transport = FakeTransport::new("t", Duration::ZERO, Behavior::Answer(vec![v4("192.0.2.1")]));
    let router = router(&[transport], Some("t"), DnsOptions::default());
    let mut message = query("example.com");
    message.question.push(Question::new("example.org", TYPE_A));
    let response = exchange(&router, &message).await.unwrap();
    assert_eq!(response.rcode, RCODE_FORMAT_ERROR);
    assert_eq!(response.id, message.id);
}

#[tokio::test]
async fn reject_rule_returns_refused() {
    let transport = FakeTransport::new("t", Duration::ZERO, Behavior::Answer(vec![v4("192.0.2.1")]));
    let router = router(
        &[transport.clone()],
        Some("t"),
        DnsOptions {
            rules: vec![DnsRuleOptions {
                domain: vec!["blocked.example".to_string()],
                action: DnsRuleAction::Reject,
                ..DnsRuleOptions::default()
            }],
            ..DnsOptions::default()
        },
    );
    let message = query("blocked.example");
    let response = exchange(&router, &message).await.unwrap();
    assert_eq!(response.rcode, RCODE_REFUSED);
    assert_eq!(response.id, message.id);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn reject_drop_rule_surfaces_dropped() {
    let transport = FakeTransport::new("t", Duration::ZERO, Behavior::Answer(vec![v4("192.0.2.1")]));
    let router = router(
        &[transport],
        Some("t"),
        DnsOptions {
            rules: vec![DnsRuleOptions {
                domain: vec!["blocked.example".to_string()],
                action: DnsRuleAction::Reject,
                method: rb_config::RejectMethod::Drop,
                ..DnsRuleOptions::default()
            }],
            ..DnsOptions::default()
        },
    );
    let err = exchange(&router, &query("blocked.example")).await.unwrap_err();
    assert!(matches!(err, Error::Dropped));
}

#[tokio::test]
async fn predefined_rule_builds_response_and_lookup_addrs() {
    let router = router(
        &[],
        None,
        DnsOptions {
            rules: vec![DnsRuleOptions {
                domain: vec!["pinned.example".to_string()],
                action: DnsRuleAction::Predefined,
                answer: vec![rb_config::PredefinedRecordOptions {
                    name: None,
                    record_type: "A".to_string(),
                    value: "198.51.100.9".to_string(),
                    ttl: 600,
                }],
                ..DnsRuleOptions::default()
            }],
            ..DnsOptions::default()
        },
    );
    let response = exchange(&router, &query("pinned.example")).await.unwrap();
    assert_eq!(response.answer_addrs(), vec![v4("198.51.100.9")]);

    let addrs = router
        .lookup(
            &CancellationToken::new(),
            "pinned.example",
            DnsQueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(addrs, vec![v4("198.51.100.9")]);
}

#[tokio::test]
async fn predefined_rcode_surfaces_as_rcode_error_in_lookup() {
    let router = router(
        &[],
        None,
        DnsOptions {
            rules: vec![DnsRuleOptions {
                domain: vec!["missing.example".to_string()],
                action: DnsRuleAction::Predefined,
                rcode: Some("NXDOMAIN".to_string()),
                ..DnsRuleOptions::default()
            }],
            ..DnsOptions::default()
        },
    );
    let err = router
        .lookup(
            &CancellationToken::new(),
            "missing.example",
            DnsQueryOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rcode(RCODE_NAME_ERROR)));
}

#[tokio::test]
async fn unresolved_server_tags_fall_through_to_default() {
    let fallback = FakeTransport::new(
        "default",
        Duration::ZERO,
        Behavior::Answer(vec![v4("192.0.2.10")]),
    );
    let router = router(
        &[fallback.clone()],
        Some("default"),
        DnsOptions {
            rules: vec![route_rule(&["missing-tag"])],
            ..DnsOptions::default()
        },
    );
    let response = exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(response.answer_addrs(), vec![v4("192.0.2.10")]);
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn route_options_widen_disable_cache() {
    let transport = FakeTransport::new("t", Duration::ZERO, Behavior::Answer(vec![v4("192.0.2.1")]));
    let router = router(
        &[transport.clone()],
        None,
        DnsOptions {
            rules: vec![
                DnsRuleOptions {
                    action: DnsRuleAction::RouteOptions,
                    disable_cache: true,
                    ..DnsRuleOptions::default()
                },
                route_rule(&["t"]),
            ],
            ..DnsOptions::default()
        },
    );
    exchange(&router, &query("example.com")).await.unwrap();
    exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(
        transport.calls(),
        2,
        "route-options disable_cache must bypass the response cache"
    );
}

#[tokio::test]
async fn responses_are_cached_without_disable_cache() {
    let transport = FakeTransport::new("t", Duration::ZERO, Behavior::Answer(vec![v4("192.0.2.1")]));
    let router = router(
        &[transport.clone()],
        None,
        DnsOptions {
            rules: vec![route_rule(&["t"])],
            ..DnsOptions::default()
        },
    );
    exchange(&router, &query("example.com")).await.unwrap();
    exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(transport.calls(), 1);

    router.clear_cache();
    exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn address_limit_rule_retries_subsequent_rules() {
    // t1's answer violates the rule's ip_cidr limit, so the router must move
    // on to the next rule and resolve through t2.
    let t1 = FakeTransport::new(
        "t1",
        Duration::ZERO,
        Behavior::Answer(vec![v4("192.0.2.1")]),
    );
    let t2 = FakeTransport::new(
        "t2",
        Duration::ZERO,
        Behavior::Answer(vec![v4("10.9.8.7")]),
    );
    let router = router(
        &[t1.clone(), t2.clone()],
        None,
        DnsOptions {
            rules: vec![
                DnsRuleOptions {
                    ip_cidr: vec!["10.0.0.0/8".parse().unwrap()],
                    ..route_rule(&["t1"])
                },
                route_rule(&["t2"]),
            ],
            ..DnsOptions::default()
        },
    );
    let response = exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(response.answer_addrs(), vec![v4("10.9.8.7")]);
    assert_eq!(t1.calls(), 1);
    assert_eq!(t2.calls(), 1);

    // The rejection is negative-cached: the second exchange skips t1.
    let response = exchange(&router, &query("example.com")).await.unwrap();
    assert_eq!(response.answer_addrs(), vec![v4("10.9.8.7")]);
    assert_eq!(t1.calls(), 1);
}

#[tokio::test]
async fn pinned_transport_skips_rules() {
    let pinned = FakeTransport::new(
        "pinned",
        Duration::ZERO,
        Behavior::Answer(vec![v4("192.0.2.20")]),
    );
    let router = router(
        &[pinned.clone()],
        None,
        DnsOptions {
            rules: vec![DnsRuleOptions {
                action: DnsRuleAction::Reject,
                ..DnsRuleOptions::default()
            }],
            ..DnsOptions::default()
        },
    );
    let options = DnsQueryOptions {
        transport: Some(pinned.clone() as Arc<dyn DnsTransport>),
        ..DnsQueryOptions::default()
    };
    let response = router
        .exchange(&CancellationToken::new(), &query("example.com"), options)
        .await
        .unwrap();
    assert_eq!(response.answer_addrs(), vec![v4("192.0.2.20")]);
}

#[tokio::test]
async fn reverse_mapping_records_resolved_addresses() {
    let transport = FakeTransport::new("t", Duration::ZERO, Behavior::Answer(vec![v4("192.0.2.33")]));
    let router = router(
        &[transport],
        Some("t"),
        DnsOptions {
            reverse_mapping: true,
            ..DnsOptions::default()
        },
    );
    exchange(&router, &query("service.example.com")).await.unwrap();
    assert_eq!(
        router.lookup_reverse_mapping(v4("192.0.2.33")),
        Some("service.example.com".to_string())
    );
    assert_eq!(router.lookup_reverse_mapping(v4("192.0.2.34")), None);
}

#[tokio::test]
async fn lookup_with_empty_answer_is_empty_result() {
    let transport = FakeTransport::new("t", Duration::ZERO, Behavior::Answer(Vec::new()));
    let router = router(
        &[transport],
        Some("t"),
        DnsOptions::default(),
    );
    let err = router
        .lookup(
            &CancellationToken::new(),
            "empty.example.com",
            DnsQueryOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyResult));
}

#[tokio::test(start_paused = true)]
async fn lookup_races_and_returns_first_nonempty_success() {
    let slow = FakeTransport::new(
        "slow",
        Duration::from_millis(40),
        Behavior::Answer(vec![v4("192.0.2.1")]),
    );
    let fast_empty = FakeTransport::new("empty", Duration::from_millis(5), Behavior::Answer(Vec::new()));
    let router = router(
        &[slow, fast_empty],
        None,
        DnsOptions {
            rules: vec![route_rule(&["slow", "empty"])],
            ..DnsOptions::default()
        },
    );
    let addrs = router
        .lookup(
            &CancellationToken::new(),
            "example.com",
            DnsQueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(addrs, vec![v4("192.0.2.1")]);
}
