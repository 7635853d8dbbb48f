use std::time::Duration;

use serde_json::json;
use volley::{LoadTest, LoadTestEvent, NodeConfig, Profile, StepRegistry, TestSpec, http_step};

#[tokio::main]
async fn main() -> volley::Result<()> {
    tracing_subscriber::fmt().init();
    // One client for every user, connections are pooled
    let mut steps = StepRegistry::new();
    steps.register("http", http_step(reqwest::Client::new()));

    let mut spec = TestSpec::new("Homepage", "http");
    spec.args = json!({"url": "http://localhost:3000/"});
    spec.time_limit = Some(9.0);
    // Ramp from 1 to 10 users over 3 seconds, then to 50 and back down
    spec.user_profile = Some(Profile::new([(0.0, 1.0), (3.0, 10.0), (6.0, 50.0), (9.0, 10.0)])?);
    spec.target_rps = Some(500.0);
    spec.stats.extend(["uniques".into(), "http-errors".into()]);

    let config = NodeConfig::builder()
        .monitor_interval(Duration::from_secs(1))
        .build();
    let test = LoadTest::new(vec![spec], &steps, &config)?;
    let mut events = test.subscribe();
    test.start()?;

    while let Ok(event) = events.recv().await {
        match event {
            LoadTestEvent::Update { interval, .. } => {
                for (name, group) in &interval {
                    println!("{name}: {}", serde_json::to_string(&volley::stats::summarize(group))?);
                }
            }
            LoadTestEvent::End => break,
            LoadTestEvent::Start => {}
        }
    }

    println!("{}", serde_json::to_string_pretty(&test.summary())?);
    Ok(())
}
