//! Cluster lifecycle scenarios: bootstrap, token joins, role rebalancing,
//! voter failure, removal and certificate rotation, driven through an
//! in-process multi-node harness.

mod common;

use common::{bootstrap_node, test_cert, test_key, ClusterNet, TestNode};

use corral::error::Error;
use corral::membership::{MembershipCoordinator, MemberUpdateRequest};
use corral::store::RaftRole;
use corral::transport::PeerTransport as _;

const CLUSTER_CERT_TAG: char = 'K';
const NEW_CERT_TAG: char = 'R';

#[tokio::test]
async fn test_bootstrap_founding_voter() {
    let net = ClusterNet::new();
    let a = bootstrap_node(
        &net,
        "a",
        "10.0.0.1:8443",
        &test_cert(CLUSTER_CERT_TAG),
        &test_key(CLUSTER_CERT_TAG),
    )
    .await;

    let info = a.coordinator.cluster_info().await.unwrap();
    assert!(info.enabled);
    assert_eq!(info.server_name, "a");

    let members = a.coordinator.list_member_views().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name, "a");
    assert_eq!(members[0].role, RaftRole::Voter);
    assert_eq!(members[0].status, "online");
    assert!(members[0].leader);

    assert_eq!(net.leader().await.as_deref(), Some("10.0.0.1:8443"));

    // Bootstrapping twice is rejected.
    assert!(matches!(
        a.coordinator.bootstrap("a").await.unwrap_err(),
        Error::AlreadyClustered
    ));
}

#[tokio::test]
async fn test_join_via_token() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let b = TestNode::new(&net, "b", "10.0.0.2:8443").await;
    b.join_with_token(&a, &cert).await;

    let members = a.coordinator.list_member_views().await.unwrap();
    assert_eq!(members.len(), 2);

    let voters = members
        .iter()
        .filter(|member| member.role == RaftRole::Voter)
        .count();
    assert_eq!(voters, 2);

    // The joiner received the cluster keypair.
    assert_eq!(
        b.coordinator.trust().read_cluster_cert().unwrap().unwrap(),
        cert
    );
}

#[tokio::test]
async fn test_second_redemption_fails() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let token = a.coordinator.issue_join_token("b").await.unwrap();
    a.coordinator
        .handle_redeem("b", &token.secret, &test_cert('b'))
        .await
        .unwrap();

    assert!(matches!(
        a.coordinator
            .handle_redeem("b", &token.secret, &test_cert('b'))
            .await
            .unwrap_err(),
        Error::TokenInvalid
    ));
}

#[tokio::test]
async fn test_rebalance_grows_to_three_voters_then_standby() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let b = TestNode::new(&net, "b", "10.0.0.2:8443").await;
    b.join_with_token(&a, &cert).await;
    let c = TestNode::new(&net, "c", "10.0.0.3:8443").await;
    c.join_with_token(&a, &cert).await;

    assert_eq!(c.raft_role(&net).await, Some(RaftRole::Voter));

    let d = TestNode::new(&net, "d", "10.0.0.4:8443").await;
    d.join_with_token(&a, &cert).await;

    assert_eq!(d.raft_role(&net).await, Some(RaftRole::StandBy));

    // Rebalancing a settled cluster changes nothing.
    a.coordinator.rebalance().await.unwrap();
    assert_eq!(a.raft_role(&net).await, Some(RaftRole::Voter));
    assert_eq!(b.raft_role(&net).await, Some(RaftRole::Voter));
    assert_eq!(c.raft_role(&net).await, Some(RaftRole::Voter));
    assert_eq!(d.raft_role(&net).await, Some(RaftRole::StandBy));
}

#[tokio::test]
async fn test_offline_voter_demoted_and_standby_promoted() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let b = TestNode::new(&net, "b", "10.0.0.2:8443").await;
    b.join_with_token(&a, &cert).await;
    let c = TestNode::new(&net, "c", "10.0.0.3:8443").await;
    c.join_with_token(&a, &cert).await;
    let d = TestNode::new(&net, "d", "10.0.0.4:8443").await;
    d.join_with_token(&a, &cert).await;

    // b goes dark past the offline threshold.
    net.set_down(&b.address).await;
    net.stale_heartbeat(&b.address).await;

    a.coordinator.rebalance().await.unwrap();

    assert_eq!(b.raft_role(&net).await, Some(RaftRole::Spare));
    assert_eq!(d.raft_role(&net).await, Some(RaftRole::Voter));

    let views = a.coordinator.list_member_views().await.unwrap();
    let online_voters = views
        .iter()
        .filter(|view| view.role == RaftRole::Voter && view.status == "online")
        .count();
    assert_eq!(online_voters, 3);
}

#[tokio::test]
async fn test_follower_self_removal_redirects_to_leader() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let b = TestNode::new(&net, "b", "10.0.0.2:8443").await;
    b.join_with_token(&a, &cert).await;
    let c = TestNode::new(&net, "c", "10.0.0.3:8443").await;
    c.join_with_token(&a, &cert).await;
    let d = TestNode::new(&net, "d", "10.0.0.4:8443").await;
    d.join_with_token(&a, &cert).await;

    // d deletes itself; the request is forwarded to the leader.
    let outcome = d.coordinator.remove_member("d", false).await.unwrap();
    assert!(matches!(
        outcome,
        corral::membership::RemovalOutcome::Forwarded(Some(_))
    ));

    let members = a.coordinator.list_member_views().await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().all(|member| member.name != "d"));

    // d restarts as a standalone node with an empty cluster.
    assert!(!d.coordinator.db().await.is_clustered().await.unwrap());
    assert!(!d.coordinator.trust().has_cluster_cert());
}

#[tokio::test]
async fn test_remove_leader_of_two_node_cluster() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let b = TestNode::new(&net, "b", "10.0.0.2:8443").await;
    b.join_with_token(&a, &cert).await;

    // Keep b as a stand-by so removal has to promote it first.
    b.coordinator
        .db()
        .await
        .replace_raft_nodes(&{
            let mut nodes = net.state.cluster_db.raft_nodes().await.unwrap();
            for node in &mut nodes {
                if node.address == b.address {
                    node.role = RaftRole::StandBy;
                }
            }
            nodes
        })
        .await
        .unwrap();

    // Deleting the leader from the follower forwards and promotes b.
    b.coordinator.remove_member("a", false).await.unwrap();

    assert_eq!(net.leader().await.as_deref(), Some(b.address.as_str()));
    assert_eq!(b.raft_role(&net).await, Some(RaftRole::Voter));

    let members = b.coordinator.list_member_views().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name, "b");

    // a is standalone again.
    assert!(!a.coordinator.db().await.is_clustered().await.unwrap());
}

#[tokio::test]
async fn test_cert_rotation_aborts_with_offline_peer() {
    let net = ClusterNet::new();
    let old_cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &old_cert, &test_key(CLUSTER_CERT_TAG))
        .await;

    let b = TestNode::new(&net, "b", "10.0.0.2:8443").await;
    b.join_with_token(&a, &old_cert).await;
    let c = TestNode::new(&net, "c", "10.0.0.3:8443").await;
    c.join_with_token(&a, &old_cert).await;

    net.set_down(&c.address).await;
    net.stale_heartbeat(&c.address).await;

    let new_cert = test_cert(NEW_CERT_TAG);
    let new_key = test_key(NEW_CERT_TAG);
    let err = a
        .coordinator
        .rotate_certificate(&new_cert, &new_key, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerUnreachable { .. }));

    // The old certificate is still active everywhere.
    assert_eq!(
        a.coordinator.trust().read_cluster_cert().unwrap().unwrap(),
        old_cert
    );
    assert_eq!(
        b.coordinator.trust().read_cluster_cert().unwrap().unwrap(),
        old_cert
    );

    // Once the peer is back, a retry succeeds on every member.
    net.set_up(&c.address).await;
    net.fresh_heartbeat(&c.address).await;

    a.coordinator
        .rotate_certificate(&new_cert, &new_key, false)
        .await
        .unwrap();

    for node in [&a, &b, &c] {
        assert_eq!(
            node.coordinator.trust().read_cluster_cert().unwrap().unwrap(),
            new_cert,
        );
    }
}

#[tokio::test]
async fn test_member_update_is_idempotent_with_etag() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let update = MemberUpdateRequest {
        description: "first rack".into(),
        roles: Vec::new(),
        failure_domain: Some("rack1".into()),
    };
    a.coordinator.update_member("a", &update, None).await.unwrap();

    let view = a.coordinator.get_member_view("a").await.unwrap();
    let etag = MembershipCoordinator::member_etag(&view);

    // The same body against the same ETag is a no-op.
    a.coordinator
        .update_member("a", &update, Some(&etag))
        .await
        .unwrap();
    let view = a.coordinator.get_member_view("a").await.unwrap();
    assert_eq!(MembershipCoordinator::member_etag(&view), etag);

    // A stale ETag is rejected.
    let err = a
        .coordinator
        .update_member(
            "a",
            &MemberUpdateRequest {
                description: "changed".into(),
                roles: Vec::new(),
                failure_domain: None,
            },
            Some("bogus"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_database_role_cannot_be_patched() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let err = a
        .coordinator
        .update_member(
            "a",
            &MemberUpdateRequest {
                description: String::new(),
                roles: vec!["database".into()],
                failure_domain: None,
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
}

#[tokio::test]
async fn test_rename_member() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;
    let b = TestNode::new(&net, "b", "10.0.0.2:8443").await;
    b.join_with_token(&a, &cert).await;

    a.coordinator.rename_member("b", "beta").await.unwrap();
    assert!(a.coordinator.get_member_view("beta").await.is_ok());

    assert!(matches!(
        a.coordinator.rename_member("beta", "a").await.unwrap_err(),
        Error::NameExists(_)
    ));
}

#[tokio::test]
async fn test_handover_promotes_replacement() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let b = TestNode::new(&net, "b", "10.0.0.2:8443").await;
    b.join_with_token(&a, &cert).await;
    let c = TestNode::new(&net, "c", "10.0.0.3:8443").await;
    c.join_with_token(&a, &cert).await;
    let d = TestNode::new(&net, "d", "10.0.0.4:8443").await;
    d.join_with_token(&a, &cert).await;

    assert_eq!(c.raft_role(&net).await, Some(RaftRole::Voter));
    assert_eq!(d.raft_role(&net).await, Some(RaftRole::StandBy));

    // c hands its voter role away; the stand-by takes over.
    a.coordinator.handover(&c.address).await.unwrap();

    assert_eq!(c.raft_role(&net).await, Some(RaftRole::Spare));
    assert_eq!(d.raft_role(&net).await, Some(RaftRole::Voter));
}

#[tokio::test]
async fn test_join_rejects_schema_mismatch() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let request = corral::transport::AcceptRequest {
        name: "old".into(),
        address: "10.0.0.9:8443".into(),
        schema_version: corral::SCHEMA_VERSION - 1,
        api_extensions: corral::API_EXTENSIONS,
        architecture: "x86_64".into(),
        storage_pools: Vec::new(),
        networks: Vec::new(),
    };
    let err = a.coordinator.accept_member(&request).await.unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch { .. }));

    // No member row was left behind.
    assert_eq!(a.coordinator.list_member_views().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_join_rejects_mismatched_network_config() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let mut config = std::collections::HashMap::new();
    config.insert("ipv4.address".to_string(), "10.1.1.1/24".to_string());
    net.state
        .cluster_db
        .create_network("corbr0", "bridge", &config, corral::store::ResourceState::Created)
        .await
        .unwrap();

    let mut bad_config = std::collections::HashMap::new();
    bad_config.insert("ipv4.address".to_string(), "10.2.2.2/24".to_string());
    let request = corral::transport::AcceptRequest {
        name: "b".into(),
        address: "10.0.0.2:8443".into(),
        schema_version: corral::SCHEMA_VERSION,
        api_extensions: corral::API_EXTENSIONS,
        architecture: "x86_64".into(),
        storage_pools: Vec::new(),
        networks: vec![corral::store::NetworkInfo {
            name: "corbr0".into(),
            driver: "bridge".into(),
            description: String::new(),
            state: corral::store::ResourceState::Created,
            config: bad_config,
        }],
    };

    let err = a.coordinator.accept_member(&request).await.unwrap_err();
    assert!(matches!(err, Error::ConfigMismatch { .. }));
    assert_eq!(a.coordinator.list_member_views().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_name_and_address_rejected() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;

    let request = corral::transport::AcceptRequest {
        name: "a".into(),
        address: "10.0.0.5:8443".into(),
        schema_version: corral::SCHEMA_VERSION,
        api_extensions: corral::API_EXTENSIONS,
        architecture: "x86_64".into(),
        storage_pools: Vec::new(),
        networks: Vec::new(),
    };
    assert!(matches!(
        a.coordinator.accept_member(&request).await.unwrap_err(),
        Error::NameExists(_)
    ));

    let request = corral::transport::AcceptRequest {
        name: "other".into(),
        address: a.address.clone(),
        schema_version: corral::SCHEMA_VERSION,
        api_extensions: corral::API_EXTENSIONS,
        architecture: "x86_64".into(),
        storage_pools: Vec::new(),
        networks: Vec::new(),
    };
    assert!(matches!(
        a.coordinator.accept_member(&request).await.unwrap_err(),
        Error::AddressExists(_)
    ));
}

#[tokio::test]
async fn test_transport_probe_tracks_liveness() {
    let net = ClusterNet::new();
    let cert = test_cert(CLUSTER_CERT_TAG);
    let a = bootstrap_node(&net, "a", "10.0.0.1:8443", &cert, &test_key(CLUSTER_CERT_TAG)).await;
    let _ = a;

    let transport = common::net_transport(&net);
    assert!(transport.probe("10.0.0.1:8443").await);
    net.set_down("10.0.0.1:8443").await;
    assert!(!transport.probe("10.0.0.1:8443").await);
}
