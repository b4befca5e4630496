//! End-to-end router scenarios over scripted in-memory adapters.
//!
//! Each test assembles a real `Router` from a hand-built configuration;
//! the only fake part is the adapter, which records what it is asked to
//! send and can be scripted to refuse connects or answer with rate-limit
//! signals.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use chatweave_bridge::registry::Registry;
use chatweave_bridge::{Adapter, AdapterContext};
use chatweave_gateway::Router;
use chatweave_types::config::{
    AdapterConfig, ChannelEntry, ChannelInfo, GatewayConfig, RootConfig,
};
use chatweave_types::{ChatweaveError, Envelope, EventKind, FileInfo, Result};

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestBackend {
    sent: StdMutex<Vec<Envelope>>,
    joined: StdMutex<Vec<String>>,
    connect_attempts: AtomicUsize,
    connect_refusals: AtomicUsize,
    rate_limits: StdMutex<VecDeque<Duration>>,
    next_id: AtomicUsize,
}

impl TestBackend {
    fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().expect("sent").clone()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent").len()
    }

    fn joined(&self) -> Vec<String> {
        self.joined.lock().expect("joined").clone()
    }
}

/// Backends live in a process-wide table keyed by account so the fn-pointer
/// factory can reach them; tests use unique instance names to stay isolated.
fn backends() -> &'static StdMutex<HashMap<String, Arc<TestBackend>>> {
    static TABLE: OnceLock<StdMutex<HashMap<String, Arc<TestBackend>>>> = OnceLock::new();
    TABLE.get_or_init(|| StdMutex::new(HashMap::new()))
}

fn backend(account: &str) -> Arc<TestBackend> {
    backends()
        .lock()
        .expect("backend table")
        .entry(account.to_string())
        .or_default()
        .clone()
}

struct TestAdapter {
    account: String,
    backend: Arc<TestBackend>,
}

#[async_trait]
impl Adapter for TestAdapter {
    async fn connect(&self) -> Result<()> {
        let n = self.backend.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.backend.connect_refusals.load(Ordering::SeqCst) {
            return Err(ChatweaveError::Transport {
                reason: "scripted refusal".into(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn join_channel(&self, channel: &ChannelInfo) -> Result<()> {
        self.backend
            .joined
            .lock()
            .expect("joined")
            .push(channel.name.clone());
        Ok(())
    }

    async fn send(&self, msg: &Envelope) -> Result<String> {
        if let Some(wait) = self
            .backend
            .rate_limits
            .lock()
            .expect("rate limits")
            .pop_front()
        {
            return Err(ChatweaveError::RateLimited { retry_after: wait });
        }
        self.backend.sent.lock().expect("sent").push(msg.clone());
        let n = self.backend.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-{n}", self.account))
    }
}

fn test_factory(ctx: AdapterContext) -> Result<Box<dyn Adapter>> {
    Ok(Box::new(TestAdapter {
        backend: backend(&ctx.account),
        account: ctx.account,
    }))
}

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn registry_for(protocols: &[&str]) -> Registry {
    let mut registry = Registry::new();
    for protocol in protocols {
        registry.register(protocol, test_factory);
    }
    registry
}

fn entry(account: &str, channel: &str) -> ChannelEntry {
    ChannelEntry {
        account: account.into(),
        channel: channel.into(),
        ..ChannelEntry::default()
    }
}

/// A config with one enabled gateway whose `inout` lists the given pairs.
fn config_inout(adapters: Vec<(&str, AdapterConfig)>, inout: &[(&str, &str)]) -> RootConfig {
    let mut protocols: HashMap<String, HashMap<String, AdapterConfig>> = HashMap::new();
    for (account, section) in adapters {
        let (protocol, name) = account.split_once('.').expect("account form");
        protocols
            .entry(protocol.to_string())
            .or_default()
            .insert(name.to_string(), section);
    }
    RootConfig {
        gateways: vec![GatewayConfig {
            name: "test".into(),
            enable: true,
            inbound: vec![],
            outbound: vec![],
            inout: inout.iter().map(|(a, c)| entry(a, c)).collect(),
        }],
        protocols,
        ..RootConfig::default()
    }
}

fn envelope_from(account: &str, channel: &str, username: &str, text: &str) -> Envelope {
    let protocol = account.split_once('.').expect("account form").0;
    Envelope {
        account: account.into(),
        protocol: protocol.into(),
        channel: channel.into(),
        username: username.into(),
        text: text.into(),
        ..Envelope::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn started_router(cfg: &RootConfig, protocols: &[&str]) -> (Router, tokio::task::JoinHandle<()>) {
    let registry = registry_for(protocols);
    let mut router = Router::from_config(cfg, &registry).await.expect("router");
    router.connect_all().await.expect("connect");
    let handle = router.start().expect("start");
    (router, handle)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fan_out_delivers_once_to_each_peer_never_back() {
    let cfg = config_inout(
        vec![
            ("irc.s1", AdapterConfig::default()),
            ("xmpp.s1", AdapterConfig::default()),
            ("slack.s1", AdapterConfig::default()),
        ],
        &[("irc.s1", "#chan"), ("xmpp.s1", "room"), ("slack.s1", "general")],
    );
    let (router, _handle) = started_router(&cfg, &["irc", "xmpp", "slack"]).await;

    let ingress = router.ingress_sender();
    let mut env = envelope_from("irc.s1", "#chan", "alice", "hi");
    env.id = "IRC-1".into();
    ingress.send(env).await.expect("ingress");

    wait_until(|| backend("xmpp.s1").sent_count() == 1 && backend("slack.s1").sent_count() == 1)
        .await;

    let xmpp = backend("xmpp.s1").sent();
    assert_eq!(xmpp[0].channel, "room");
    assert_eq!(xmpp[0].username, "alice");
    assert_eq!(xmpp[0].text, "hi");
    assert_eq!(xmpp[0].gateway, "test");

    // No echo to the origin, and exactly one copy each.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend("irc.s1").sent_count(), 0);
    assert_eq!(backend("xmpp.s1").sent_count(), 1);
    assert_eq!(backend("slack.s1").sent_count(), 1);
}

#[tokio::test]
async fn delete_follows_the_original_to_its_copy() {
    let cfg = config_inout(
        vec![
            ("irc.s2", AdapterConfig::default()),
            ("xmpp.s2", AdapterConfig::default()),
        ],
        &[("irc.s2", "#chan"), ("xmpp.s2", "room")],
    );
    let (router, _handle) = started_router(&cfg, &["irc", "xmpp"]).await;
    let ingress = router.ingress_sender();

    let mut original = envelope_from("irc.s2", "#chan", "alice", "oops");
    original.id = "IRC-42".into();
    ingress.send(original).await.expect("ingress");
    wait_until(|| backend("xmpp.s2").sent_count() == 1).await;

    let mut delete = envelope_from("irc.s2", "#chan", "alice", "");
    delete.id = "IRC-42".into();
    delete.event = EventKind::MsgDelete;
    ingress.send(delete).await.expect("ingress");
    wait_until(|| backend("xmpp.s2").sent_count() == 2).await;

    let sent = backend("xmpp.s2").sent();
    assert_eq!(sent[1].event, EventKind::MsgDelete);
    // The delete carries the destination's native ID of the first copy.
    assert_eq!(sent[1].id, "xmpp.s2-1");
}

#[tokio::test]
async fn edit_reuses_the_destination_id() {
    let cfg = config_inout(
        vec![
            ("irc.s2e", AdapterConfig::default()),
            ("xmpp.s2e", AdapterConfig::default()),
        ],
        &[("irc.s2e", "#chan"), ("xmpp.s2e", "room")],
    );
    let (router, _handle) = started_router(&cfg, &["irc", "xmpp"]).await;
    let ingress = router.ingress_sender();

    let mut original = envelope_from("irc.s2e", "#chan", "alice", "first");
    original.id = "IRC-7".into();
    ingress.send(original).await.expect("ingress");
    wait_until(|| backend("xmpp.s2e").sent_count() == 1).await;

    let mut edit = envelope_from("irc.s2e", "#chan", "alice", "first, fixed");
    edit.id = "IRC-7".into();
    ingress.send(edit).await.expect("ingress");
    wait_until(|| backend("xmpp.s2e").sent_count() == 2).await;

    let sent = backend("xmpp.s2e").sent();
    assert_eq!(sent[0].id, "", "first delivery is a fresh message");
    assert_eq!(sent[1].id, "xmpp.s2e-1", "edit addresses the delivered copy");
    assert_eq!(sent[1].text, "first, fixed");
}

#[tokio::test]
async fn per_origin_order_is_preserved() {
    let cfg = config_inout(
        vec![
            ("irc.ord", AdapterConfig::default()),
            ("xmpp.ord", AdapterConfig::default()),
        ],
        &[("irc.ord", "#chan"), ("xmpp.ord", "room")],
    );
    let (router, _handle) = started_router(&cfg, &["irc", "xmpp"]).await;
    let ingress = router.ingress_sender();

    for i in 0..8 {
        ingress
            .send(envelope_from("irc.ord", "#chan", "alice", &format!("m{i}")))
            .await
            .expect("ingress");
    }
    wait_until(|| backend("xmpp.ord").sent_count() == 8).await;

    let texts: Vec<String> = backend("xmpp.ord").sent().iter().map(|e| e.text.clone()).collect();
    let expected: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
    assert_eq!(texts, expected);
}

#[tokio::test]
async fn threaded_reply_carries_destination_parent_id() {
    let cfg = config_inout(
        vec![
            ("irc.thr", AdapterConfig::default()),
            (
                "slack.thr",
                AdapterConfig {
                    preserve_threading: Some(true),
                    ..AdapterConfig::default()
                },
            ),
        ],
        &[("irc.thr", "#chan"), ("slack.thr", "general")],
    );
    let (router, _handle) = started_router(&cfg, &["irc", "slack"]).await;
    let ingress = router.ingress_sender();

    let mut parent = envelope_from("irc.thr", "#chan", "alice", "root");
    parent.id = "IRC-P".into();
    ingress.send(parent).await.expect("ingress");
    wait_until(|| backend("slack.thr").sent_count() == 1).await;

    let mut reply = envelope_from("irc.thr", "#chan", "bob", "answer");
    reply.id = "IRC-R".into();
    reply.parent_id = "IRC-P".into();
    ingress.send(reply).await.expect("ingress");
    wait_until(|| backend("slack.thr").sent_count() == 2).await;

    let sent = backend("slack.thr").sent();
    assert_eq!(sent[1].parent_id, "slack.thr-1");
}

#[tokio::test]
async fn typing_gated_by_destination_capability() {
    let cfg = config_inout(
        vec![
            ("slack.s4", AdapterConfig::default()),
            ("irc.s4", AdapterConfig::default()),
            ("discord.s4", AdapterConfig::default()),
        ],
        &[("slack.s4", "general"), ("irc.s4", "#chan"), ("discord.s4", "lobby")],
    );
    let (router, _handle) = started_router(&cfg, &["slack", "irc", "discord"]).await;
    let ingress = router.ingress_sender();

    let mut typing = envelope_from("slack.s4", "general", "alice", "");
    typing.event = EventKind::UserTyping;
    ingress.send(typing).await.expect("ingress");

    wait_until(|| backend("discord.s4").sent_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend("irc.s4").sent_count(), 0, "irc cannot render typing");
    assert_eq!(backend("discord.s4").sent()[0].event, EventKind::UserTyping);
}

#[tokio::test]
async fn join_leave_gated_by_show_join_part() {
    let cfg = config_inout(
        vec![
            ("irc.jl", AdapterConfig::default()),
            (
                "xmpp.jl",
                AdapterConfig {
                    show_join_part: Some(true),
                    ..AdapterConfig::default()
                },
            ),
            ("slack.jl", AdapterConfig::default()),
        ],
        &[("irc.jl", "#chan"), ("xmpp.jl", "room"), ("slack.jl", "general")],
    );
    let (router, _handle) = started_router(&cfg, &["irc", "xmpp", "slack"]).await;
    let ingress = router.ingress_sender();

    let mut joined = envelope_from("irc.jl", "#chan", "alice", "alice joined");
    joined.event = EventKind::JoinLeave;
    ingress.send(joined).await.expect("ingress");

    wait_until(|| backend("xmpp.jl").sent_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend("slack.jl").sent_count(), 0);
}

#[tokio::test]
async fn extract_nicks_rewrites_relayed_bot_messages() {
    let cfg = config_inout(
        vec![
            (
                "irc.en",
                AdapterConfig {
                    extract_nicks: vec![vec![".*-bot$".into(), "<(.+?)>".into()]],
                    ..AdapterConfig::default()
                },
            ),
            ("xmpp.en", AdapterConfig::default()),
        ],
        &[("irc.en", "#chan"), ("xmpp.en", "room")],
    );
    let (router, _handle) = started_router(&cfg, &["irc", "xmpp"]).await;
    let ingress = router.ingress_sender();

    ingress
        .send(envelope_from("irc.en", "#chan", "relay-bot", "<alice> hello"))
        .await
        .expect("ingress");
    wait_until(|| backend("xmpp.en").sent_count() == 1).await;

    let sent = backend("xmpp.en").sent();
    assert_eq!(sent[0].username, "alice");
    assert_eq!(sent[0].text, " hello");
}

#[tokio::test]
async fn remote_nick_format_applied_per_destination() {
    let cfg = config_inout(
        vec![
            ("irc.rnf", AdapterConfig::default()),
            (
                "xmpp.rnf",
                AdapterConfig {
                    remote_nick_format: Some("[{PROTOCOL}] <{NICK}> ".into()),
                    ..AdapterConfig::default()
                },
            ),
        ],
        &[("irc.rnf", "#chan"), ("xmpp.rnf", "room")],
    );
    let (router, _handle) = started_router(&cfg, &["irc", "xmpp"]).await;
    let ingress = router.ingress_sender();

    ingress
        .send(envelope_from("irc.rnf", "#chan", "alice", "hi"))
        .await
        .expect("ingress");
    wait_until(|| backend("xmpp.rnf").sent_count() == 1).await;

    assert_eq!(backend("xmpp.rnf").sent()[0].username, "[irc] <alice> ");
}

#[tokio::test(start_paused = true)]
async fn rate_limited_destination_delays_but_delivers_once() {
    let cfg = config_inout(
        vec![
            ("slack.rl", AdapterConfig::default()),
            ("matrix.rl", AdapterConfig::default()),
        ],
        &[("slack.rl", "general"), ("matrix.rl", "room")],
    );
    // Three "slow down 250 ms" answers before the send goes through.
    {
        let matrix_backend = backend("matrix.rl");
        let mut limits = matrix_backend.rate_limits.lock().expect("limits");
        for _ in 0..3 {
            limits.push_back(Duration::from_millis(250));
        }
    }

    let (router, _handle) = started_router(&cfg, &["slack", "matrix"]).await;
    let ingress = router.ingress_sender();

    let started = tokio::time::Instant::now();
    ingress
        .send(envelope_from("slack.rl", "general", "alice", "throttled"))
        .await
        .expect("ingress");
    ingress
        .send(envelope_from("slack.rl", "general", "alice", "queued behind"))
        .await
        .expect("ingress");

    wait_until(|| backend("matrix.rl").sent_count() == 2).await;
    assert!(started.elapsed() >= Duration::from_millis(750));

    let sent = backend("matrix.rl").sent();
    assert_eq!(sent[0].text, "throttled");
    assert_eq!(sent[1].text, "queued behind");
}

#[tokio::test(start_paused = true)]
async fn failure_triggers_reconnect_and_rejoin() {
    let cfg = config_inout(
        vec![
            (
                "mock.rc",
                AdapterConfig {
                    join_delay: Some(20),
                    ..AdapterConfig::default()
                },
            ),
            ("xmpp.rc", AdapterConfig::default()),
        ],
        &[("mock.rc", "#a"), ("mock.rc", "#b"), ("xmpp.rc", "room")],
    );
    let (router, _handle) = started_router(&cfg, &["mock", "xmpp"]).await;
    assert_eq!(backend("mock.rc").joined().len(), 2);

    // The next two connect attempts are refused, the third succeeds.
    backend("mock.rc").connect_refusals.store(3, Ordering::SeqCst);

    let ingress = router.ingress_sender();
    let mut failure = Envelope {
        account: "mock.rc".into(),
        protocol: "mock".into(),
        event: EventKind::Failure,
        text: "read error".into(),
        ..Envelope::default()
    };
    failure.channel.clear();
    ingress.send(failure).await.expect("ingress");

    wait_until(|| backend("mock.rc").joined().len() == 4).await;

    // One initial connect, two refusals, one success.
    assert_eq!(backend("mock.rc").connect_attempts.load(Ordering::SeqCst), 4);
    let joined = backend("mock.rc").joined();
    let mut rejoined = joined[2..].to_vec();
    rejoined.sort();
    assert_eq!(rejoined, vec!["#a".to_string(), "#b".to_string()]);
}

#[tokio::test]
async fn local_media_rehosts_attachments_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = config_inout(
        vec![
            ("slack.med", AdapterConfig::default()),
            ("irc.med", AdapterConfig::default()),
        ],
        &[("slack.med", "general"), ("irc.med", "#chan")],
    );
    cfg.general.media_download_path = dir.path().to_str().expect("utf8").to_string();
    cfg.general.media_server_download = "https://cdn.example.org/m".into();

    let (router, _handle) = started_router(&cfg, &["slack", "irc"]).await;
    let ingress = router.ingress_sender();

    let mut env = envelope_from("slack.med", "general", "alice", "holiday pics");
    env.push_file(FileInfo {
        name: "a b.jpg".into(),
        data: Some(vec![0x42; 100]),
        ..FileInfo::default()
    });
    ingress.send(env).await.expect("ingress");
    wait_until(|| backend("irc.med").sent_count() == 1).await;

    let sent = backend("irc.med").sent();
    let file = sent[0].files().next().expect("file relayed");
    assert_eq!(file.name, "a_b.jpg");
    assert_eq!(file.sha.len(), 8);
    let url = file.url.as_deref().expect("rehosted url");
    assert_eq!(url, &format!("https://cdn.example.org/m/{}/a_b.jpg", file.sha));

    // The placed bytes equal the attachment bytes.
    let on_disk = std::fs::read(dir.path().join(&file.sha).join("a_b.jpg")).expect("placed");
    assert_eq!(on_disk, vec![0x42; 100]);
}

#[tokio::test]
async fn oversize_notice_without_caption_is_dropped() {
    let cfg = config_inout(
        vec![
            ("slack.ffs", AdapterConfig::default()),
            ("irc.ffs", AdapterConfig::default()),
        ],
        &[("slack.ffs", "general"), ("irc.ffs", "#chan")],
    );
    let (router, _handle) = started_router(&cfg, &["slack", "irc"]).await;
    let ingress = router.ingress_sender();

    let mut notice = envelope_from("slack.ffs", "general", "alice", "");
    notice.push_note(
        EventKind::FileFailureSize.as_str(),
        "big.iso exceeds the download cap".into(),
    );
    ingress.send(notice).await.expect("ingress");

    // A captioned one still goes through.
    let mut captioned = envelope_from("slack.ffs", "general", "alice", "file was too big");
    captioned.push_note(
        EventKind::FileFailureSize.as_str(),
        "big.iso exceeds the download cap".into(),
    );
    ingress.send(captioned).await.expect("ingress");

    wait_until(|| backend("irc.ffs").sent_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = backend("irc.ffs").sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "file was too big");
}

#[tokio::test]
async fn all_adapters_refusing_first_connect_is_fatal() {
    backend("irc.dead").connect_refusals.store(usize::MAX, Ordering::SeqCst);
    backend("xmpp.dead").connect_refusals.store(usize::MAX, Ordering::SeqCst);

    let cfg = config_inout(
        vec![
            ("irc.dead", AdapterConfig::default()),
            ("xmpp.dead", AdapterConfig::default()),
        ],
        &[("irc.dead", "#chan"), ("xmpp.dead", "room")],
    );
    let registry = registry_for(&["irc", "xmpp"]);
    let router = Router::from_config(&cfg, &registry).await.expect("router");
    assert!(router.connect_all().await.is_err());
}

#[tokio::test]
async fn shutdown_stops_the_dispatch_loop() {
    let cfg = config_inout(
        vec![
            ("irc.sd", AdapterConfig::default()),
            ("xmpp.sd", AdapterConfig::default()),
        ],
        &[("irc.sd", "#chan"), ("xmpp.sd", "room")],
    );
    let (router, handle) = started_router(&cfg, &["irc", "xmpp"]).await;
    router.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatch loop exits on shutdown")
        .expect("join");
}
