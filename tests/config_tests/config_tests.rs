//! Configuration Tests
//!
//! Tests verify:
//! - Parsing of the options object
//! - Single node vs cluster selection
//! - Url parsing and precedence of explicit fields
//! - Validation failures

use serde_json::json;

use coalescekv::config::{DEFAULT_HIGH_WATER_MARK, DEFAULT_PORT};
use coalescekv::{CacheConfig, CacheError, ClusterNode, NodeAddress, Topology};

// =============================================================================
// Helper Functions
// =============================================================================

fn single(config: &CacheConfig) -> &NodeAddress {
    match &config.connection.topology {
        Topology::Single(address) => address,
        other => panic!("Expected single node, got {:?}", other),
    }
}

fn config_error(result: coalescekv::Result<CacheConfig>) -> String {
    match result {
        Err(CacheError::Config(message)) => message,
        other => panic!("Expected config error, got {:?}", other),
    }
}

// =============================================================================
// Single Node Tests
// =============================================================================

#[test]
fn test_single_node_options() {
    let config = CacheConfig::from_json(&json!({
        "host": "cache.local",
        "port": 6380,
        "password": "secret",
        "db": 2,
        "ttl": 60
    }))
    .unwrap();

    let address = single(&config);
    assert_eq!(address.host, "cache.local");
    assert_eq!(address.port, 6380);
    assert_eq!(address.password.as_deref(), Some("secret"));
    assert_eq!(address.db, 2);
    assert_eq!(config.ttl, Some(60));
    assert_eq!(config.high_water_mark, DEFAULT_HIGH_WATER_MARK);
}

#[test]
fn test_defaults() {
    let config = CacheConfig::from_json(&json!({ "host": "localhost" })).unwrap();

    let address = single(&config);
    assert_eq!(address.port, DEFAULT_PORT);
    assert_eq!(address.password, None);
    assert_eq!(address.db, 0);
    assert_eq!(config.ttl, None);
    assert_eq!(config.connection.connect_timeout_ms, 5000);
    assert_eq!(config.connection.reconnect_delay_ms, 1000);
}

#[test]
fn test_port_as_string() {
    let config = CacheConfig::from_json(&json!({ "host": "h", "port": "6390" })).unwrap();

    assert_eq!(single(&config).port, 6390);
}

#[test]
fn test_invalid_port_string() {
    let message = config_error(CacheConfig::from_json(&json!({ "host": "h", "port": "abc" })));

    assert!(message.contains("Invalid port"));
}

#[test]
fn test_zero_ttl_means_no_expiry() {
    let config = CacheConfig::from_json(&json!({ "host": "h", "ttl": 0 })).unwrap();

    assert_eq!(config.ttl, None);
}

#[test]
fn test_tuning_options() {
    let config = CacheConfig::from_json(&json!({
        "host": "h",
        "highWaterMark": 100,
        "connectTimeoutMs": 250,
        "reconnectDelayMs": 50,
        "unknownOption": true
    }))
    .unwrap();

    assert_eq!(config.high_water_mark, 100);
    assert_eq!(config.connection.connect_timeout_ms, 250);
    assert_eq!(config.connection.reconnect_delay_ms, 50);
}

// =============================================================================
// Url Tests
// =============================================================================

#[test]
fn test_url() {
    let config = CacheConfig::from_json(&json!({ "url": "redis://:pw@example.com:7000/4" })).unwrap();

    let address = single(&config);
    assert_eq!(address.host, "example.com");
    assert_eq!(address.port, 7000);
    assert_eq!(address.password.as_deref(), Some("pw"));
    assert_eq!(address.db, 4);
}

#[test]
fn test_url_with_username_and_defaults() {
    let config = CacheConfig::from_json(&json!({ "url": "redis://user:pw@example.com" })).unwrap();

    let address = single(&config);
    assert_eq!(address.port, DEFAULT_PORT);
    assert_eq!(address.password.as_deref(), Some("pw"));
    assert_eq!(address.db, 0);
}

#[test]
fn test_explicit_fields_override_url() {
    let config = CacheConfig::from_json(&json!({
        "url": "redis://example.com:7000/4",
        "db": 1,
        "password": "override"
    }))
    .unwrap();

    let address = single(&config);
    assert_eq!(address.host, "example.com");
    assert_eq!(address.port, 7000);
    assert_eq!(address.db, 1);
    assert_eq!(address.password.as_deref(), Some("override"));
}

#[test]
fn test_unsupported_url_scheme() {
    let message = config_error(CacheConfig::from_json(&json!({ "url": "http://example.com" })));

    assert!(message.contains("scheme"));
}

// =============================================================================
// Cluster Tests
// =============================================================================

#[test]
fn test_cluster_nodes() {
    let config = CacheConfig::from_json(&json!({
        "nodes": [
            { "port": 7000 },
            { "host": "10.0.0.2", "port": "7001", "password": "node-pw" }
        ],
        "redisOptions": { "password": "fallback" }
    }))
    .unwrap();

    match config.connection.topology {
        Topology::Cluster {
            nodes,
            fallback_password,
        } => {
            assert_eq!(nodes.len(), 2);
            assert_eq!(nodes[0], ClusterNode::new(7000));
            assert_eq!(nodes[1].host, "10.0.0.2");
            assert_eq!(nodes[1].port, 7001);
            assert_eq!(nodes[1].password.as_deref(), Some("node-pw"));
            assert_eq!(fallback_password.as_deref(), Some("fallback"));
        }
        other => panic!("Expected cluster, got {:?}", other),
    }
}

#[test]
fn test_cluster_fallback_to_top_level_password() {
    let config = CacheConfig::from_json(&json!({
        "nodes": [{ "port": 7000 }],
        "password": "top"
    }))
    .unwrap();

    match config.connection.topology {
        Topology::Cluster {
            fallback_password, ..
        } => assert_eq!(fallback_password.as_deref(), Some("top")),
        other => panic!("Expected cluster, got {:?}", other),
    }
}

#[test]
fn test_nodes_must_be_an_array() {
    let message = config_error(CacheConfig::from_json(&json!({ "nodes": { "port": 7000 } })));

    assert_eq!(
        message,
        "Option nodes must be an array of connection parameters for cluster"
    );
}

#[test]
fn test_malformed_node_descriptor() {
    let message = config_error(CacheConfig::from_json(&json!({ "nodes": [{ "host": "h" }] })));

    assert!(message.contains("Malformed cluster node"));
}

#[test]
fn test_empty_nodes() {
    let message = config_error(CacheConfig::from_json(&json!({ "nodes": [] })));

    assert!(message.contains("at least one"));
}

#[test]
fn test_nodes_and_host_are_exclusive() {
    let message = config_error(CacheConfig::from_json(&json!({
        "host": "h",
        "nodes": [{ "port": 7000 }]
    })));

    assert!(message.contains("mutually exclusive"));
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_missing_options() {
    let message = config_error(CacheConfig::from_json(&serde_json::Value::Null));

    assert_eq!(message, "Missing option 'host'");
}

#[test]
fn test_missing_host() {
    let message = config_error(CacheConfig::from_json(&json!({ "port": 6379 })));

    assert_eq!(message, "Missing option 'host'");
}

#[test]
fn test_non_object_options() {
    assert!(matches!(
        CacheConfig::from_json(&json!("localhost")),
        Err(CacheError::Config(_))
    ));
}

#[test]
fn test_zero_high_water_mark() {
    let message = config_error(CacheConfig::from_json(&json!({ "host": "h", "highWaterMark": 0 })));

    assert!(message.contains("highWaterMark"));
}

// =============================================================================
// Builder Tests
// =============================================================================

#[test]
fn test_builder_single_node() {
    let config = CacheConfig::builder()
        .host("127.0.0.1")
        .port(6400)
        .db(1)
        .ttl(30)
        .high_water_mark(10)
        .reconnect_delay_ms(20)
        .build()
        .unwrap();

    let address = single(&config);
    assert_eq!(address.addr(), "127.0.0.1:6400");
    assert_eq!(address.db, 1);
    assert_eq!(config.ttl, Some(30));
    assert_eq!(config.high_water_mark, 10);
    assert_eq!(
        config.connection.reconnect_delay(),
        std::time::Duration::from_millis(20)
    );
}

#[test]
fn test_builder_cluster() {
    let config = CacheConfig::builder()
        .node(ClusterNode::new(7000))
        .node(ClusterNode::new(7001))
        .password("pw")
        .build()
        .unwrap();

    assert!(matches!(
        config.connection.topology,
        Topology::Cluster { ref nodes, .. } if nodes.len() == 2
    ));
}

#[test]
fn test_builder_matches_json() {
    let built = CacheConfig::builder()
        .host("h")
        .port(1234)
        .ttl(5)
        .build()
        .unwrap();
    let parsed = CacheConfig::from_json(&json!({ "host": "h", "port": 1234, "ttl": 5 })).unwrap();

    assert_eq!(built, parsed);
}

#[test]
fn test_builder_requires_host() {
    assert!(matches!(
        CacheConfig::builder().ttl(5).build(),
        Err(CacheError::Config(_))
    ));
}
