use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use volley::loadtest::LoadTestClusterEvent;
use volley::remote::{
    ClusterEvent, ClusterState, MethodDef, NodeHost, OperationRegistry, SlaveContext,
};
use volley::{
    ClientConfig, Cluster, ClusterSpec, HttpServer, LoadTestCluster, LoadTestClusterConfig,
    NodeConfig, Outcome, StepRegistry, TestSpec, install_remote_handler, load_test_operations,
};

const DEADLINE: Duration = Duration::from_secs(20);

fn fast_client() -> ClientConfig {
    ClientConfig::builder()
        .retry_interval(Duration::from_millis(50))
        .max_retries(1)
        .build()
}

fn method(name: &str) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        fun: name.to_string(),
    }
}

/// `begin` and `finish` move the worker through the `running` and `done` phases.
fn phase_operations() -> OperationRegistry {
    let mut operations = OperationRegistry::new();
    operations
        .register("begin", |ctx: std::sync::Arc<SlaveContext>, _| async move {
            ctx.set_state("running");
            Ok(Value::Null)
        })
        .register("finish", |ctx: std::sync::Arc<SlaveContext>, _| async move {
            ctx.set_state("done");
            Ok(Value::Null)
        });
    operations
}

async fn worker(operations: OperationRegistry, config: NodeConfig) -> (HttpServer, NodeHost, String) {
    let server = HttpServer::new();
    let host = install_remote_handler(&server, operations, config);
    let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (server, host, addr.to_string())
}

/// Collect events until one matches `last`.
async fn until<E: Clone + std::fmt::Debug>(
    events: &mut broadcast::Receiver<E>,
    last: impl Fn(&E) -> bool,
) -> Vec<E> {
    let collect = async {
        let mut seen = vec![];
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = last(&event);
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("events closed after {seen:?}"),
            }
        }
    };
    tokio::time::timeout(DEADLINE, collect)
        .await
        .expect("event did not arrive in time")
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held");
}

async fn started_cluster(hosts: Vec<String>, ping: Duration) -> (HttpServer, Cluster, broadcast::Receiver<ClusterEvent>) {
    let controller = HttpServer::new();
    let spec = ClusterSpec::builder()
        .slave_hosts(hosts)
        .slave_methods(vec![method("begin"), method("finish")])
        .ping_interval(ping)
        .client(fast_client())
        .build();
    let cluster = Cluster::new(spec, &controller);
    let mut events = cluster.subscribe();
    controller.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    cluster.wait_for(ClusterState::Initialized).await;
    cluster.start().await.unwrap();
    until(&mut events, |e| *e == ClusterEvent::Start).await;
    (controller, cluster, events)
}

#[tokio::test]
async fn two_workers_run_converge_and_uninstall() {
    let (_s1, w1, a) = worker(phase_operations(), NodeConfig::default()).await;
    let (_s2, w2, b) = worker(phase_operations(), NodeConfig::default()).await;
    let (controller, cluster, mut events) =
        started_cluster(vec![a.clone(), b.clone()], Duration::from_millis(200)).await;
    assert_eq!(cluster.slave_ids(), vec![a.clone(), b.clone()]);
    assert_eq!((w1.nodes().len(), w2.nodes().len()), (1, 1));

    for call in cluster.call("begin", vec![]) {
        call.wait().await.unwrap();
    }
    until(&mut events, |e| *e == ClusterEvent::Running).await;
    assert_eq!(cluster.slave_state(&a).as_deref(), Some("running"));

    for call in cluster.call("finish", vec![]) {
        call.wait().await.unwrap();
    }
    until(&mut events, |e| *e == ClusterEvent::Done).await;

    cluster.end().await;
    let tail = until(&mut events, |e| *e == ClusterEvent::End).await;
    assert!(
        !tail.iter().any(|e| matches!(e, ClusterEvent::SlaveError { .. })),
        "{tail:?}"
    );
    assert_eq!(cluster.state(), ClusterState::Stopped);
    eventually(|| w1.nodes().is_empty() && w2.nodes().is_empty()).await;
    assert!(controller.routes().is_empty());
}

#[tokio::test]
async fn silent_worker_is_dropped_from_convergence() {
    let (_s1, _w1, a) = worker(phase_operations(), NodeConfig::default()).await;
    let (_s2, w2, b) = worker(phase_operations(), NodeConfig::default()).await;
    let (_controller, cluster, mut events) =
        started_cluster(vec![a.clone(), b.clone()], Duration::from_millis(100)).await;

    for call in cluster.call("begin", vec![]) {
        call.wait().await.unwrap();
    }
    until(&mut events, |e| *e == ClusterEvent::Running).await;

    // b stops reporting without being uninstalled by the controller
    w2.node(&b).unwrap().end();
    cluster
        .slave(&a)
        .unwrap()
        .call("finish", vec![])
        .wait()
        .await
        .unwrap();

    let seen = until(&mut events, |e| *e == ClusterEvent::Done).await;
    assert!(seen.contains(&ClusterEvent::SlaveError {
        slave: b.clone(),
        error: None
    }));
    assert_eq!(cluster.is_alive(&b), Some(false));
    assert_eq!(cluster.is_alive(&a), Some(true));
    cluster.end().await;
}

#[tokio::test]
async fn distributed_load_test_merges_worker_statistics() {
    let config = NodeConfig::builder()
        .monitor_interval(Duration::from_millis(100))
        .build();
    let steps = || {
        let mut steps = StepRegistry::new();
        steps.register_fn("ok", |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Outcome::ok()
        });
        steps
    };
    let (_s1, w1, a) = worker(load_test_operations(steps(), config.clone()), config.clone()).await;
    let (_s2, w2, b) = worker(load_test_operations(steps(), config.clone()), config.clone()).await;

    let controller = HttpServer::new();
    controller.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let cluster = LoadTestCluster::new(
        LoadTestClusterConfig::builder()
            .slave_hosts(vec![a, b])
            .update_interval(Duration::from_millis(100))
            .client(fast_client())
            .build(),
        &controller,
    );
    let mut events = cluster.subscribe();

    let mut spec = TestSpec::new("read", "ok");
    spec.num_users = 2;
    spec.num_requests = Some(20);
    cluster.run(vec![spec]).unwrap();

    let seen = until(&mut events, |e| *e == LoadTestClusterEvent::End).await;
    assert!(seen.contains(&LoadTestClusterEvent::Start));
    assert!(
        seen.iter()
            .any(|e| matches!(e, LoadTestClusterEvent::Update { .. }))
    );
    cluster.wait().await;

    let cumulative = cluster.cumulative();
    assert_eq!(volley::Statistic::len(&cumulative["read"]["result-codes"]), 40);
    assert_eq!(volley::Statistic::len(&cumulative["read"]["latency"]), 40);
    eventually(|| w1.nodes().is_empty() && w2.nodes().is_empty()).await;
}
