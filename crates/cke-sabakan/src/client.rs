use anyhow::{Context, Result};
use cke_core::Error;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::machine::Machine;

const SEARCH_MACHINES: &str = r#"query searchMachines($having: MachineParams = null, $notHaving: MachineParams = null) {
  searchMachines(having: $having, notHaving: $notHaving) {
    spec {
      serial
      labels { name value }
      rack
      indexInRack
      role
      ipv4
      registerDate
      retireDate
      bmc { bmcType ipv4 }
    }
    status { state timestamp duration }
  }
}"#;

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct SearchData {
    #[serde(rename = "searchMachines")]
    search_machines: Vec<Machine>,
}

#[derive(Deserialize)]
struct SearchResponse {
    data: Option<SearchData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

/// GraphQL client of the inventory service.
pub struct SabakanClient {
    http: reqwest::Client,
    endpoint: String,
}

impl SabakanClient {
    /// `url` is the service base URL; queries go to `<url>/graphql`.
    pub fn new(http: reqwest::Client, url: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/graphql", url.trim_end_matches('/')),
        }
    }

    /// `searchMachines` with `variables` holding optional `having` and `notHaving`.
    pub async fn search_machines(&self, variables: &Value) -> Result<Vec<Machine>> {
        let body = json!({ "query": SEARCH_MACHINES, "variables": variables });
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::transient(format!("sabakan {}: {e}", self.endpoint)))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::transient(format!("sabakan {}: HTTP {status}: {}", self.endpoint, text.trim())).into());
        }
        let parsed: SearchResponse = resp.json().await.context("decode searchMachines response")?;
        if !parsed.errors.is_empty() {
            let msgs: Vec<&str> = parsed.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(Error::fatal(format!("searchMachines: {}", msgs.join("; "))).into());
        }
        parsed
            .data
            .map(|d| d.search_machines)
            .ok_or_else(|| Error::fatal("searchMachines returned no data").into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::extract::State;
    use axum::routing::post;

    use super::*;
    use crate::machine::MachineState;
    use crate::machine::tests::machine;

    pub(crate) type Served = Arc<Mutex<(Vec<Machine>, Vec<Value>)>>;

    /// Local GraphQL endpoint answering every query with the machines in the
    /// returned handle and remembering the variables it received.
    pub(crate) async fn serve(machines: Vec<Machine>) -> (String, Served) {
        let served: Served = Arc::new(Mutex::new((machines, Vec::new())));
        let app = axum::Router::new()
            .route(
                "/graphql",
                post(|State(s): State<Served>, Json(body): Json<Value>| async move {
                    let mut s = s.lock().unwrap();
                    s.1.push(body["variables"].clone());
                    Json(json!({ "data": { "searchMachines": s.0.clone() } }))
                }),
            )
            .with_state(served.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), served)
    }

    #[tokio::test]
    async fn test_search_machines_sends_variables() {
        let (url, served) = serve(vec![machine("10.0.0.1", 0, "cs", MachineState::Healthy)]).await;
        let client = SabakanClient::new(reqwest::Client::new(), &format!("{url}/"));
        let vars = json!({"having": {"roles": ["cs"]}});
        let machines = client.search_machines(&vars).await.unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].address(), Some("10.0.0.1"));
        assert_eq!(served.lock().unwrap().1, vec![vars]);
    }

    #[tokio::test]
    async fn test_graphql_errors_are_reported() {
        let app = axum::Router::new().route(
            "/graphql",
            post(|| async { Json(json!({"data": null, "errors": [{"message": "bad having"}]})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let client = SabakanClient::new(reqwest::Client::new(), &format!("http://{addr}"));
        let err = client.search_machines(&json!({})).await.unwrap_err();
        assert!(format!("{err:#}").contains("bad having"));
    }
}
