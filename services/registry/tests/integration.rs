//! Integration tests for the replicated registry

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use camino::{Utf8Path, Utf8PathBuf};
use consensus::{LocalStore, LogIndex, Member, Membership, MemoryNetwork, MemoryStore, NodeId, RaftConfig};
use http_body_util::BodyExt;
use registry::{
    Digest, GarbageCollector, GcConfig, MediaType, Outcome, ReadConsistency, Registry, RegistryBuilder,
    RegistryError, RegistryOperation,
};
use serde_json::json;
use tower::ServiceExt;

fn raft_config() -> RaftConfig {
    RaftConfig {
        tick_ms: 10,
        propose_timeout_ms: 1000,
        ..RaftConfig::default()
    }
}

struct Cluster {
    network: MemoryNetwork<RegistryOperation>,
    nodes: BTreeMap<NodeId, Registry>,
}

impl Cluster {
    async fn start(ids: &[NodeId]) -> Self {
        let bootstrap = Membership::new(ids.iter().map(|id| Member::voter(*id, format!("node-{id}"))));
        let network = MemoryNetwork::new();
        let mut nodes = BTreeMap::new();
        for id in ids {
            let registry = RegistryBuilder::new(*id)
                .raft(raft_config())
                .bootstrap(bootstrap.clone())
                .start(MemoryStore::new(), network.transport(*id))
                .await
                .unwrap();
            network.register(*id, registry.mailbox());
            nodes.insert(*id, registry);
        }
        Self { network, nodes }
    }

    fn node(&self, id: NodeId) -> &Registry {
        &self.nodes[&id]
    }

    async fn leader_among(&self, ids: &[NodeId]) -> NodeId {
        for _ in 0..1000 {
            if let Some(id) = ids.iter().find(|id| self.node(**id).is_leader()) {
                return *id;
            }
            tokio::time::sleep(raft_config().tick()).await;
        }
        panic!("no leader elected among {ids:?}");
    }

    async fn leader(&self) -> NodeId {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        self.leader_among(&ids).await
    }

    async fn converge(&self, leader: NodeId) -> LogIndex {
        let index = self.node(leader).raft().barrier().await.unwrap();
        for registry in self.nodes.values() {
            registry
                .raft()
                .wait_applied(index, Duration::from_secs(10))
                .await
                .unwrap();
        }
        index
    }
}

fn image_manifest(config: &Digest, layers: &[&Digest]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| {
            json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest,
                "size": 100
            })
        })
        .collect();
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config,
            "size": 100
        },
        "layers": layers
    }))
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn publish_tag_and_collect() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.leader().await;
    let registry = cluster.node(leader);

    let aaa = Digest::sha256_of(b"aaa");
    registry.register_blob(aaa.clone(), 100, Some("node-1".into())).await.unwrap();

    let body = image_manifest(&aaa, &[]);
    let published = registry
        .publish_manifest("lib/app", MediaType::OciManifest.as_str(), &body)
        .await
        .unwrap();
    let bbb = published.output.digest.clone();
    assert_eq!(bbb, Digest::sha256_of(&body));

    registry.update_tag("lib/app", "v1", bbb.clone()).await.unwrap();
    cluster.converge(leader).await;

    for (id, node) in &cluster.nodes {
        let pointer = node.read_tag("lib/app", "v1", ReadConsistency::Stale).await.unwrap();
        assert_eq!(pointer.digest, bbb, "node {id}");
        let blob = node.read_blob(&aaa, ReadConsistency::Stale).await.unwrap();
        assert_eq!(blob.reference_count, 1, "node {id}");
        let manifest = node.read_manifest(&bbb, ReadConsistency::Stale).await.unwrap();
        assert_eq!(manifest.references, BTreeSet::from([aaa.clone()]));
    }

    let follower = *cluster.nodes.keys().find(|id| **id != leader).unwrap();
    let mut follower_gc = GarbageCollector::new(
        cluster.node(follower).clone(),
        GcConfig {
            interval_secs: 1,
            grace_period_secs: 0,
        },
    );
    let mut gc = GarbageCollector::new(
        registry.clone(),
        GcConfig {
            interval_secs: 1,
            grace_period_secs: 0,
        },
    );

    // Everything is referenced.
    assert!(gc.collect_once().await.unwrap().deleted.is_empty());

    registry.delete_tag("lib/app", "v1").await.unwrap();
    assert!(follower_gc.collect_once().await.unwrap().deleted.is_empty());

    let report = gc.collect_once().await.unwrap();
    assert_eq!(report.deleted, [bbb.clone()]);
    assert_eq!(
        registry.read_blob(&aaa, ReadConsistency::Linearizable).await.unwrap().reference_count,
        0
    );

    let report = gc.collect_once().await.unwrap();
    assert_eq!(report.deleted, [aaa.clone()]);
    assert!(gc.collect_once().await.unwrap().deleted.is_empty());

    cluster.converge(leader).await;
    for node in cluster.nodes.values() {
        assert_eq!(
            node.read_blob(&aaa, ReadConsistency::Stale).await,
            Err(RegistryError::BlobNotFound(aaa.clone()))
        );
        assert_eq!(
            node.read_manifest(&bbb, ReadConsistency::Stale).await,
            Err(RegistryError::ManifestNotFound(bbb.clone()))
        );
        assert!(node.repositories(ReadConsistency::Stale).await.unwrap().is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn unresolved_references_never_reach_the_log() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.leader().await;
    let registry = cluster.node(leader);
    cluster.converge(leader).await;

    let config = Digest::sha256_of(b"config");
    let missing = Digest::sha256_of(b"missing");
    registry.register_blob(config.clone(), 100, None).await.unwrap();
    let before = registry.status().last_log_index;

    let body = image_manifest(&config, &[&missing]);
    let err = registry
        .publish_manifest("lib/app", MediaType::OciManifest.as_str(), &body)
        .await
        .unwrap_err();
    assert_eq!(err, RegistryError::UnresolvedReference(missing));

    let err = registry
        .publish_manifest("lib/app", "application/vnd.docker.container.image.v1+json", &body)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::SchemaViolation(_)));

    assert_eq!(registry.status().last_log_index, before);
}

#[tokio::test(start_paused = true)]
async fn unmounting_releases_repository_tags() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.leader().await;
    let registry = cluster.node(leader);

    let config = Digest::sha256_of(b"config");
    registry.register_blob(config.clone(), 100, None).await.unwrap();
    let manifest = registry
        .publish_manifest("lib/app", MediaType::OciManifest.as_str(), &image_manifest(&config, &[]))
        .await
        .unwrap()
        .output
        .digest;

    let before = registry.status().last_log_index;
    assert_eq!(
        registry.update_tag("mirror/app", "v1", manifest.clone()).await,
        Err(RegistryError::NotMounted {
            repository: "mirror/app".into(),
            digest: manifest.clone()
        })
    );
    assert_eq!(registry.status().last_log_index, before);

    registry.mount_blob("mirror/app", manifest.clone()).await.unwrap();
    registry.update_tag("lib/app", "v1", manifest.clone()).await.unwrap();
    registry.update_tag("mirror/app", "v1", manifest.clone()).await.unwrap();

    let unmounted = registry.unmount_blob("lib/app", manifest.clone()).await.unwrap();
    assert_eq!(
        unmounted.output,
        Outcome::Unmounted {
            existed: true,
            untagged: vec!["v1".into()]
        }
    );
    cluster.converge(leader).await;
    for (id, node) in &cluster.nodes {
        assert_eq!(
            node.repositories(ReadConsistency::Stale).await.unwrap(),
            ["mirror/app"],
            "node {id}"
        );
        assert!(node.read_manifest_in("lib/app", &manifest, ReadConsistency::Stale).await.is_err());
        assert!(node.read_manifest_in("mirror/app", &manifest, ReadConsistency::Stale).await.is_ok());
    }

    let mut gc = GarbageCollector::new(
        registry.clone(),
        GcConfig {
            interval_secs: 1,
            grace_period_secs: 0,
        },
    );
    // Still tagged in the mirror.
    assert!(!gc.collect_once().await.unwrap().deleted.contains(&manifest));

    registry.unmount_blob("mirror/app", manifest.clone()).await.unwrap();
    assert_eq!(gc.collect_once().await.unwrap().deleted, [manifest.clone()]);
}

#[tokio::test(start_paused = true)]
async fn garbage_waits_for_the_grace_period() {
    let cluster = Cluster::start(&[1]).await;
    let registry = cluster.node(cluster.leader().await);
    let orphan = Digest::sha256_of(b"uploaded before its manifest");
    registry.register_blob(orphan.clone(), 10, None).await.unwrap();

    let mut gc = GarbageCollector::new(
        registry.clone(),
        GcConfig {
            interval_secs: 60,
            grace_period_secs: 600,
        },
    );
    let report = gc.collect_once().await.unwrap();
    assert_eq!(report.unreferenced, 1);
    assert!(report.deleted.is_empty());

    tokio::time::advance(Duration::from_secs(300)).await;
    assert!(gc.collect_once().await.unwrap().deleted.is_empty());

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(gc.collect_once().await.unwrap().deleted, [orphan.clone()]);
    assert_eq!(
        registry.read_blob(&orphan, ReadConsistency::Stale).await,
        Err(RegistryError::BlobNotFound(orphan))
    );
}

#[tokio::test(start_paused = true)]
async fn minority_partition_cannot_write() {
    let cluster = Cluster::start(&[1, 2, 3, 4, 5]).await;
    let old_leader = cluster.leader().await;
    let committed = Digest::sha256_of(b"before partition");
    cluster
        .node(old_leader)
        .register_blob(committed.clone(), 1, None)
        .await
        .unwrap();
    cluster.converge(old_leader).await;

    let minority_peer = *cluster.nodes.keys().find(|id| **id != old_leader).unwrap();
    let majority: Vec<NodeId> = cluster
        .nodes
        .keys()
        .copied()
        .filter(|id| *id != old_leader && *id != minority_peer)
        .collect();
    cluster
        .network
        .partition(&[&[old_leader, minority_peer], &majority]);

    let lost = Digest::sha256_of(b"written to the minority");
    assert_eq!(
        cluster.node(old_leader).register_blob(lost.clone(), 1, None).await,
        Err(RegistryError::Timeout)
    );

    let new_leader = cluster.leader_among(&majority).await;
    let during = Digest::sha256_of(b"written to the majority");
    cluster
        .node(new_leader)
        .register_blob(during.clone(), 2, None)
        .await
        .unwrap();

    tokio::time::sleep(raft_config().election_timeout() * 6).await;
    for id in [old_leader, minority_peer] {
        assert_eq!(
            cluster.node(id).register_blob(lost.clone(), 1, None).await,
            Err(RegistryError::NoQuorum),
            "node {id}"
        );
        // Stale reads still work without a quorum.
        assert!(cluster.node(id).read_blob(&committed, ReadConsistency::Stale).await.is_ok());
    }

    cluster.network.heal();
    let leader = cluster.leader_among(&majority).await;
    cluster.converge(leader).await;
    for (id, node) in &cluster.nodes {
        assert_eq!(
            node.read_blob(&during, ReadConsistency::Stale).await.unwrap().size,
            2,
            "node {id}"
        );
        assert_eq!(
            node.read_blob(&lost, ReadConsistency::Stale).await,
            Err(RegistryError::BlobNotFound(lost.clone())),
            "node {id}"
        );
    }
}

async fn start_on_disk(root: &Utf8Path, config: &RaftConfig) -> Registry {
    let network = MemoryNetwork::new();
    let registry = RegistryBuilder::new(1)
        .raft(config.clone())
        .bootstrap(Membership::new([Member::voter(1, "node-1")]))
        .start(LocalStore::new(root), network.transport(1))
        .await
        .unwrap();
    network.register(1, registry.mailbox());
    registry
}

#[tokio::test(start_paused = true)]
async fn restart_recovers_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).expect("utf-8 path");
    let config = RaftConfig {
        snapshot_threshold: 4,
        ..raft_config()
    };

    let registry = start_on_disk(&root, &config).await;
    while !registry.is_leader() {
        tokio::time::sleep(config.tick()).await;
    }

    let digests: Vec<Digest> = (0..10u8).map(|n| Digest::sha256_of(&[n])).collect();
    for digest in &digests {
        registry.register_blob(digest.clone(), 1, None).await.unwrap();
    }
    let body = image_manifest(&digests[0], &[&digests[1]]);
    let manifest = registry
        .publish_manifest("lib/app", MediaType::OciManifest.as_str(), &body)
        .await
        .unwrap();
    let last = registry
        .update_tag("lib/app", "latest", manifest.output.digest.clone())
        .await
        .unwrap()
        .index;
    registry.shutdown().await;

    let registry = start_on_disk(&root, &config).await;
    registry
        .raft()
        .wait_applied(last, Duration::from_secs(10))
        .await
        .unwrap();
    for digest in &digests {
        assert!(registry.read_blob(digest, ReadConsistency::Stale).await.is_ok());
    }
    let pointer = registry
        .read_tag("lib/app", "latest", ReadConsistency::Stale)
        .await
        .unwrap();
    assert_eq!(pointer.digest, manifest.output.digest);
    assert_eq!(
        registry
            .read_blob(&digests[1], ReadConsistency::Stale)
            .await
            .unwrap()
            .reference_count,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn applying_twice_has_no_effect() {
    let cluster = Cluster::start(&[1]).await;
    let registry = cluster.node(cluster.leader().await);
    let digest = Digest::sha256_of(b"once");
    let committed = registry.register_blob(digest.clone(), 3, None).await.unwrap();
    assert_eq!(committed.output, Outcome::BlobRegistered { created: true });

    let again = registry.register_blob(digest.clone(), 3, None).await.unwrap();
    assert_eq!(again.output, Outcome::BlobRegistered { created: false });

    assert_eq!(
        registry.register_blob(digest.clone(), 4, None).await,
        Err(RegistryError::CorruptionDetected {
            digest,
            recorded: 3,
            proposed: 4
        })
    );
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_http_surface() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.leader().await;
    let registry = cluster.node(leader);

    let config = Digest::sha256_of(b"config");
    registry.register_blob(config.clone(), 100, None).await.unwrap();
    let manifest = registry
        .publish_manifest("lib/app", MediaType::OciManifest.as_str(), &image_manifest(&config, &[]))
        .await
        .unwrap();
    for tag in ["v2", "v1"] {
        registry
            .update_tag("lib/app", tag, manifest.output.digest.clone())
            .await
            .unwrap();
    }
    cluster.converge(leader).await;

    let follower = *cluster.nodes.keys().find(|id| **id != leader).unwrap();
    let app = registry::router(cluster.node(follower).clone());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/v2/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v2/lib/app/tags/list")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"name": "lib/app", "tags": ["v1", "v2"]})
    );

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/v2/_catalog").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(response).await, json!({"repositories": ["lib/app"]}));

    // Linearizable reads need the leader.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v2/lib/app/tags/list?consistency=linearizable")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v2/Bad..Name/tags/list")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["errors"][0]["code"], "NAME_INVALID");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/admin/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = body_json(response).await;
    assert_eq!(status["id"], follower);
    assert_eq!(status["leader"], leader);
    assert_eq!(status["role"], "follower");
    assert_eq!(status["members"].as_array().unwrap().len(), 3);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/members")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"id": 4, "address": "node-4"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
    let errors = body_json(response).await;
    assert_eq!(errors["errors"][0]["code"], "NOT_LEADER");
    assert_eq!(errors["errors"][0]["detail"]["leader"], leader);

    let leader_app = registry::router(registry.clone());
    let response = leader_app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/members/9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = leader_app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/members")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"id": 4, "address": "node-4", "voter": false}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["index"].as_u64().unwrap() > 0);
    assert_eq!(registry.status().members.len(), 4);
}
