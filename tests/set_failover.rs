//! Set 组：顺序故障转移与自嵌套检测

use std::time::Duration;

use openshunt::app::App;
use openshunt::common::{Address, ProxyError, ProxyErrorKind};
use openshunt::config::parse_config;
use openshunt::proxy::Session;
use tokio::net::TcpListener;

/// 绑定后立即释放的端口，连接会被拒绝
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn app(yaml: &str) -> (App, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = parse_config(yaml).unwrap();
    config.bypass.file = dir.path().join("bypass.conf");
    std::fs::write(&config.bypass.file, "# empty\n").unwrap();
    (App::new(config).unwrap(), dir)
}

fn node(hash: &str, port: u16) -> String {
    format!(
        "  - hash: {hash}\n    name: {hash}\n    protocols:\n      - type: simple\n        host: 127.0.0.1\n        port: {port}\n"
    )
}

#[tokio::test]
async fn round_robin_stops_at_first_success() {
    let dead = closed_port().await;
    let live_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live_c = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let yaml = format!(
        "outbound:\n  tcp: group\nnodes:\n{}{}{}  - hash: group\n    name: group\n    protocols:\n      - type: set\n        nodes: [a, b, c]\n",
        node("a", dead),
        node("b", live_b.local_addr().unwrap().port()),
        node("c", live_c.local_addr().unwrap().port()),
    );
    let (app, _dir) = app(&yaml);

    let session = Session::tcp(Address::Domain("example.com".into(), 443));
    let _stream = app.dial(&session).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), live_b.accept())
        .await
        .expect("b should be dialed")
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), live_c.accept())
            .await
            .is_err(),
        "c must not be dialed after b succeeded"
    );

    // a 和 b 都被构建过，c 没有
    let mut built = app.outbound().store().hashes();
    built.sort();
    assert_eq!(built, vec!["a", "b", "group"]);
}

#[tokio::test]
async fn exhaustion_reports_every_candidate() {
    let p1 = closed_port().await;
    let p2 = closed_port().await;
    let yaml = format!(
        "outbound:\n  tcp: group\nnodes:\n{}{}  - hash: group\n    name: group\n    protocols:\n      - type: set\n        nodes: [a, b, missing]\n",
        node("a", p1),
        node("b", p2),
    );
    let (app, _dir) = app(&yaml);

    let err = app
        .dial(&Session::tcp(Address::Domain("example.com".into(), 443)))
        .await
        .err()
        .unwrap();
    match err.downcast_ref::<ProxyError>() {
        Some(ProxyError::AllCandidatesFailed(joined)) => {
            let nodes: Vec<(usize, &str)> =
                joined.iter().map(|e| (e.index, e.node.as_str())).collect();
            assert_eq!(nodes, vec![(0, "a"), (1, "b"), (2, "missing")]);
            let missing = joined.iter().last().unwrap();
            assert_eq!(ProxyError::classify(&missing.error), ProxyErrorKind::NodeNotFound);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

const LOOP_TAGS: &str = r#"
tags:
  - name: loop-tag
    targets: [loop]
  - name: self-ref
    type: mirror
    targets: [loop-tag]
"#;

#[tokio::test]
async fn self_nesting_candidate_is_skipped() {
    let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let yaml = format!(
        "outbound:\n  tcp: loop\nnodes:\n{}  - hash: loop\n    name: loop\n    protocols:\n      - type: set\n        nodes: [self-ref, a]\n{}",
        node("a", live.local_addr().unwrap().port()),
        LOOP_TAGS,
    );
    let (app, _dir) = app(&yaml);

    // 经 mirror 回到自身的候选记一次失败，继续尝试 a
    let _stream = app
        .dial(&Session::tcp(Address::Domain("example.com".into(), 443)))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), live.accept())
        .await
        .expect("a should be dialed")
        .unwrap();
}

#[tokio::test]
async fn set_containing_only_itself_fails_without_recursing() {
    let yaml = format!(
        "outbound:\n  tcp: loop\nnodes:\n  - hash: loop\n    name: loop\n    protocols:\n      - type: set\n        nodes: [self-ref]\n{}",
        LOOP_TAGS,
    );
    let (app, _dir) = app(&yaml);

    let err = tokio::time::timeout(
        Duration::from_secs(1),
        app.dial(&Session::tcp(Address::Domain("example.com".into(), 443))),
    )
    .await
    .expect("nested set must not block")
    .err()
    .unwrap();
    match err.downcast_ref::<ProxyError>() {
        Some(ProxyError::AllCandidatesFailed(joined)) => {
            assert_eq!(joined.len(), 1);
            let only = joined.iter().next().unwrap();
            assert_eq!(only.node, "self-ref");
            assert_eq!(
                ProxyError::classify(&only.error),
                ProxyErrorKind::NestedLoopNotSupported
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stalled_candidate_cannot_stretch_the_deadline() {
    // 接受连接但从不回应 CONNECT
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });
    let live = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let yaml = format!(
        "outbound:\n  tcp: group\nnodes:\n  - hash: stall\n    name: stall\n    protocols:\n      - type: simple\n        host: 127.0.0.1\n        port: {silent_port}\n      - type: http\n{}  - hash: group\n    name: group\n    protocols:\n      - type: set\n        nodes: [stall, b]\n",
        node("b", live.local_addr().unwrap().port()),
    );
    let (app, _dir) = app(&yaml);

    let start = tokio::time::Instant::now();
    let session = Session::tcp("203.0.113.1:443".parse().unwrap())
        .with_deadline(start + Duration::from_millis(200));
    let result = app.dial(&session).await;
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(400), "deadline overrun: {elapsed:?}");

    // b 只剩下所余时间：要么连上，要么同样超时
    if let Err(err) = result {
        match err.downcast_ref::<ProxyError>() {
            Some(ProxyError::AllCandidatesFailed(joined)) => {
                let first = joined.iter().next().unwrap();
                assert_eq!((first.index, first.node.as_str()), (0, "stall"));
                assert_eq!(
                    ProxyError::classify(&first.error),
                    ProxyErrorKind::ConnectionTimeout
                );
                assert!(elapsed >= Duration::from_millis(190));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
