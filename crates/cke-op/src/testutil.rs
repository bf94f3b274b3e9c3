use cke_core::cluster::Cluster;
use cke_core::node::Node;
use cke_infra::fake::FakeInfra;
use tokio_util::sync::CancellationToken;

use crate::operator::RunContext;

pub const LEADER: &str = "/cke/leader/test";

/// Cluster with `cps` control planes at 10.0.0.1.. and `workers` at 10.0.1.1..
pub fn test_cluster(cps: usize, workers: usize) -> Cluster {
    let node = |address: String, control_plane: bool| Node {
        address,
        user: "cybozu".into(),
        control_plane,
        ..Default::default()
    };
    let mut nodes: Vec<Node> = (1..=cps).map(|i| node(format!("10.0.0.{i}"), true)).collect();
    nodes.extend((1..=workers).map(|i| node(format!("10.0.1.{i}"), false)));
    Cluster {
        name: "test".into(),
        nodes,
        service_subnet: "10.68.0.0/16".into(),
        pod_subnet: "10.64.0.0/14".into(),
        dns_servers: vec!["10.0.0.53".into()],
        ..Default::default()
    }
}

pub fn ctx<'a>(infra: &'a FakeInfra, cluster: &'a Cluster) -> RunContext<'a> {
    RunContext {
        infra,
        cluster,
        leader: LEADER,
        cancel: CancellationToken::new(),
        now: chrono::Utc::now(),
    }
}

/// Store a placeholder certificate for every CA.
pub async fn seed_cas(infra: &FakeInfra) {
    for &ca in cke_core::ca::CaName::ALL {
        infra
            .storage
            .put_ca_certificate(None, ca, &format!("PEM {ca}"))
            .await
            .unwrap();
    }
}

/// Create the key [`LEADER`] so leader-guarded writes succeed.
pub async fn elect(infra: &FakeInfra) {
    infra
        .storage
        .kv()
        .commit(vec![], vec![cke_storage::TxnOp::Put(LEADER.into(), b"test".to_vec())])
        .await
        .unwrap();
}
