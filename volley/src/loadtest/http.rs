use http::Method;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use super::TestStep;
use crate::executor::Step;
use crate::monitor::Outcome;

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
struct RequestArgs {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    headers: IndexMap<String, String>,
}

/// A step sending one HTTP request per iteration, described by the test args:
///
/// ```json
/// {"url": "http://localhost:8080/", "method": "POST", "body": "...", "headers": {"x-a": "1"}}
/// ```
///
/// The outcome carries the status code, the response headers, the request and
/// response body sizes, and `"{method} {path}"` as the key. Requests that fail
/// before a response arrives have no code.
pub fn http_step(client: reqwest::Client) -> TestStep {
    Step::new(move |args: Value| {
        let client = client.clone();
        async move { send(&client, args).await }
    })
}

async fn send(client: &reqwest::Client, args: Value) -> Outcome {
    let args: RequestArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => {
            tracing::warn!("Invalid HTTP step arguments: {e}");
            return Outcome::default();
        }
    };
    let method = Method::from_bytes(args.method.to_uppercase().as_bytes()).unwrap_or(Method::GET);
    let path = reqwest::Url::parse(&args.url)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| args.url.clone());
    let body = args.body.unwrap_or_default();

    let mut outcome = Outcome {
        key: Some(format!("{method} {path}")),
        request_bytes: body.len() as u64,
        ..Default::default()
    };
    let mut request = client.request(method, &args.url);
    for (name, value) in &args.headers {
        request = request.header(name, value);
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Error during HTTP request: {e}");
            return outcome;
        }
    };
    outcome.code = Some(response.status().as_u16());
    outcome.headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    match response.bytes().await {
        Ok(bytes) => outcome.response_bytes = bytes.len() as u64,
        Err(e) => tracing::debug!("Error reading HTTP response: {e}"),
    }
    outcome
}
