//! Run a test on several workers and merge their statistics.
//!
//! ```text
//! HTTP_PORT=8001 cargo run --example fleet -- worker
//! HTTP_PORT=8002 cargo run --example fleet -- worker
//! cargo run --example fleet -- localhost:8001 localhost:8002
//! ```
//!
//! Without arguments two workers are started in this process.
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::json;
use volley::loadtest::LoadTestClusterEvent;
use volley::{
    HttpServer, LoadTestCluster, LoadTestClusterConfig, NodeConfig, StepRegistry, TestSpec,
    install_remote_handler, load_test_operations,
};

fn steps() -> StepRegistry {
    let mut steps = StepRegistry::with_defaults();
    steps.register_fn("sleep", |args| async move {
        let ms = args["ms"].as_u64().unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        volley::Outcome::ok()
    });
    steps
}

async fn start_worker(config: NodeConfig) -> volley::Result<(HttpServer, SocketAddr)> {
    let server = HttpServer::new();
    install_remote_handler(&server, load_test_operations(steps(), config.clone()), config.clone());
    let addr = server
        .start(([0, 0, 0, 0], config.http_port).into())
        .await
        .map_err(|e| volley::Error::Setup(e.to_string()))?;
    Ok((server, addr))
}

#[tokio::main]
async fn main() -> volley::Result<()> {
    tracing_subscriber::fmt().init();
    let config = NodeConfig::from_env();
    let mut hosts: Vec<String> = std::env::args().skip(1).collect();

    if hosts.first().map(String::as_str) == Some("worker") {
        let (_server, addr) = start_worker(config.clone()).await?;
        tracing::info!("Worker listening on {addr}.");
        std::future::pending::<()>().await;
    }
    let mut workers = vec![];
    if hosts.is_empty() {
        for port in [8001, 8002] {
            let mut worker = config.clone();
            worker.http_port = port;
            worker.host = Some(format!("localhost:{port}"));
            workers.push(start_worker(worker).await?.0);
            hosts.push(format!("localhost:{port}"));
        }
    }

    let controller = HttpServer::new();
    controller
        .start(([0, 0, 0, 0], config.http_port).into())
        .await
        .map_err(|e| volley::Error::Setup(e.to_string()))?;
    let cluster = LoadTestCluster::new(
        LoadTestClusterConfig::builder()
            .master_host(format!("localhost:{}", config.http_port))
            .slave_hosts(hosts)
            .update_interval(config.monitor_interval)
            .build(),
        &controller,
    );
    let mut events = cluster.subscribe();

    let mut spec = TestSpec::new("Sleep", "sleep");
    spec.num_users = 20;
    spec.target_rps = Some(200.0);
    spec.time_limit = Some(10.0);
    spec.args = json!({"ms": 25});
    cluster.run(vec![spec])?;

    while let Ok(event) = events.recv().await {
        match event {
            LoadTestClusterEvent::Start => tracing::info!("Every worker is running."),
            LoadTestClusterEvent::Update { cumulative, .. } => {
                for (name, group) in &cumulative {
                    println!("{name}: {}", serde_json::to_string(&volley::stats::summarize(group))?);
                }
            }
            LoadTestClusterEvent::SlaveError { slave, error } => {
                tracing::warn!("Worker {slave} failed: {error:?}");
            }
            LoadTestClusterEvent::End => break,
        }
    }

    println!("{}", serde_json::to_string_pretty(&cluster.summary())?);
    controller.stop();
    workers.iter().for_each(HttpServer::stop);
    Ok(())
}
