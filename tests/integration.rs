use std::time::Duration;

use crowdnode::{
    config::Config,
    node::Server,
    traits::PeerHealthView,
    types::{NamespaceKey, Resource},
};
use libp2p::{Multiaddr, identity::Keypair};

const CONVERGENCE: Duration = Duration::from_secs(60);
const POLL: Duration = Duration::from_millis(250);

// ─── Helpers ────────────────────────────────────────────────────────────────

fn loopback() -> Vec<Multiaddr> {
    vec![
        "/ip4/127.0.0.1/tcp/0"
            .parse()
            .expect("parse listen multiaddr"),
    ]
}

fn spawn_node(gpu_model: &str, worker: bool) -> Server {
    let keypair = Keypair::generate_ed25519();
    let peer_id = keypair.public().to_peer_id();
    let resource = Resource::new(
        &peer_id,
        gpu_model,
        24,
        35.0,
        vec!["llama3.2".to_string()],
        worker,
    );
    Server::new(keypair, loopback(), Config::short_intervals(), resource).expect("create node")
}

async fn eventually(what: &str, mut check: impl AsyncFnMut() -> bool) {
    let result = tokio::time::timeout(CONVERGENCE, async {
        while !check().await {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

async fn connected_pair() -> (Server, Server) {
    let a = spawn_node("RTX 4090", true);
    let addr_a = a.start().await.expect("start node A");

    let b = spawn_node("A100", false);
    b.bootstrap(&[addr_a.to_string()])
        .await
        .expect("bootstrap B from A");
    b.start().await.expect("start node B");
    (a, b)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_returns_full_address_and_is_idempotent() {
    let node = spawn_node("RTX 3090", true);
    let first = node.start().await.expect("start node");
    let second = node.start().await.expect("start again");

    assert_eq!(first, second);
    assert!(first.to_string().ends_with(&format!("/p2p/{}", node.peer_id())));
    assert_eq!(node.primary_addr(), Some(first));

    node.stop().await;
    node.stop().await;
    assert!(node.start().await.is_err(), "a stopped node stays stopped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_node_bootstraps_from_its_own_address() {
    let node = spawn_node("RTX 3090", true);
    let addr = node.start().await.expect("start node");

    node.bootstrap(&[addr.to_string()])
        .await
        .expect("bootstrap with only itself as seed");
    assert_eq!(node.peer_count().await.expect("count peers"), 0);

    let joiner = spawn_node("A100", false);
    joiner
        .bootstrap(&[addr.to_string()])
        .await
        .expect("bootstrap joiner from the first node");
    joiner.start().await.expect("start joiner");

    let node_id = node.peer_id();
    eventually("joiner to mark the first node healthy", async || {
        joiner.healthy_peers().contains_key(&node_id)
    })
    .await;

    joiner.stop().await;
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_discover_each_other_with_metadata() {
    let (a, b) = connected_pair().await;
    let a_id = a.peer_id();
    let b_id = b.peer_id();

    eventually("B to mark A healthy", async || {
        b.healthy_peers().contains_key(&a_id)
    })
    .await;
    eventually("A to mark B healthy", async || {
        a.healthy_peers().contains_key(&b_id)
    })
    .await;

    let seen_by_b = b.healthy_peers();
    let metadata = seen_by_b[&a_id]
        .metadata
        .clone()
        .expect("fresh metadata for A");
    assert_eq!(metadata.gpu_model, "RTX 4090");
    assert_eq!(metadata.peer_id, a_id.to_base58());
    assert!(metadata.worker_mode);

    assert!(b.has_peer(&a_id).await.expect("query connected peers"));
    assert!(!b.healthy_peers().contains_key(&b_id), "a node never lists itself");

    b.stop().await;
    a.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn advertised_node_is_a_provider() {
    let (a, b) = connected_pair().await;
    let a_id = a.peer_id();
    let key = NamespaceKey::peers().expect("derive namespace key");

    eventually("A to show up as namespace provider", async || {
        b.check_provider(&a_id, &key).await.unwrap_or(false)
    })
    .await;

    b.stop().await;
    a.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_peer_is_evicted() {
    let (a, b) = connected_pair().await;
    let a_id = a.peer_id();

    eventually("B to mark A healthy", async || {
        b.healthy_peers().contains_key(&a_id)
    })
    .await;

    a.stop().await;

    eventually("B to drop A", async || !b.healthy_peers().contains_key(&a_id)).await;
    assert!(
        b.health().is_peer_unhealthy(&a_id) || b.health().peer_info(&a_id).is_none(),
        "evicted peer is tombstoned or already forgotten"
    );

    b.stop().await;
}
