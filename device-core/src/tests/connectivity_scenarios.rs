use sha2::{Digest, Sha256};

use super::{Device, CMD, PRESENCE};
use crate::ota::{hex, OtaState};
use crate::supervisor::ConnectionState;

#[test]
fn test_boot_arms_will_before_announcing_online() {
    let mut dev = Device::boot();
    dev.connect();

    let will = dev.net.registered_will().unwrap();
    assert_eq!(will.topic, PRESENCE);
    assert_eq!(will.payload, b"offline");
    assert!(will.retain);
    assert_eq!(dev.net.will_armed_before_publish(PRESENCE), Some(true));
    assert_eq!(dev.presence().as_deref(), Some("online"));
    assert!(dev.net.is_subscribed(CMD));
}

#[test]
fn test_heartbeat_failure_tears_down_through_disconnected() {
    let mut dev = Device::boot();
    dev.connect();
    dev.run_for(1);

    dev.net.fail_publishes(true);
    dev.run_for(26);
    assert!(!dev.runtime.supervisor().is_connected());
    assert_eq!(dev.presence().as_deref(), Some("offline"));

    let history: Vec<_> = dev.runtime.supervisor().history().collect();
    let stale = history
        .iter()
        .position(|s| *s == ConnectionState::Stale)
        .expect("no stale transition");
    assert_eq!(history[stale + 1], ConnectionState::Disconnected);
    assert_eq!(history[stale + 2], ConnectionState::LinkConnecting);

    dev.net.fail_publishes(false);
    dev.run_for(10);
    assert!(dev.runtime.supervisor().is_connected());
    assert!(dev.runtime.supervisor().session_epoch() >= 2);
    assert_eq!(dev.presence().as_deref(), Some("online"));
}

#[test]
fn test_link_loss_recovers_after_backoff() {
    let mut dev = Device::boot();
    dev.connect();

    dev.net.set_link_available(false);
    dev.run_for(5);
    assert_ne!(dev.runtime.connection_state(), ConnectionState::SessionConnected);
    assert_eq!(dev.presence().as_deref(), Some("offline"));
    let attempts = dev.net.link_attempts();
    assert!(attempts <= 3, "{attempts} link attempts in 5 s");

    dev.net.set_link_available(true);
    dev.run_for(40);
    assert!(dev.runtime.supervisor().is_connected());
    assert_eq!(dev.presence().as_deref(), Some("online"));
}

#[test]
fn test_library_reported_drop_reconnects() {
    let mut dev = Device::boot();
    dev.connect();
    dev.net.drop_session();
    dev.tick();
    assert_eq!(dev.runtime.connection_state(), ConnectionState::Disconnected);
    assert_eq!(dev.presence().as_deref(), Some("offline"));

    dev.run_for(5);
    assert!(dev.runtime.supervisor().is_connected());
    assert_eq!(dev.runtime.supervisor().session_epoch(), 2);
}

#[test]
fn test_foreign_topics_are_ignored() {
    let mut dev = Device::boot();
    dev.connect();
    dev.net.inject_raw(
        "saphari/acme/devices/pump-8/cmd",
        r#"{"cmd_id":"x","action":"relay","pin":4,"state":1}"#,
    );
    dev.net.inject_raw(
        "saphari/other/devices/pump-7/cmd",
        r#"{"cmd_id":"y","action":"relay","pin":4,"state":1}"#,
    );
    dev.tick();
    assert!(dev.acks().is_empty());
    assert_eq!(dev.board.writes(), 0);
}

#[test]
fn test_acks_survive_failed_publish_and_go_out_once() {
    let mut dev = Device::boot();
    dev.connect();
    dev.net.fail_publishes(true);
    dev.send(r#"{"cmd_id":"q1","action":"digital_write","pin":2,"state":1}"#);
    dev.tick();
    assert!(dev.acks().is_empty());
    assert_eq!(dev.runtime.pending_acks(), 1);

    dev.net.fail_publishes(false);
    dev.tick();
    let acks = dev.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["commandId"], "q1");
    assert_eq!(dev.runtime.pending_acks(), 0);
}

#[test]
fn test_outage_spanning_health_check_reconnects_healthy() {
    let mut dev = Device::boot();
    dev.connect();
    dev.net.set_link_available(false);
    dev.run_for(65);
    assert!(!dev.runtime.health().is_healthy);

    dev.net.set_link_available(true);
    dev.run_for(35);
    assert!(dev.runtime.supervisor().is_connected());
    assert_eq!(dev.presence().as_deref(), Some("online"));
    assert!(dev.runtime.health().is_healthy);
    assert_eq!(dev.runtime.health().error_count, 0);

    let url = "https://updates.example.com/pump/fw-v2.bin";
    let image = b"firmware-v2".to_vec();
    let digest = hex(&Sha256::digest(&image));
    dev.server.host(url, image);
    dev.send(&format!(
        r#"{{"cmd_id":"ota-after","action":"ota_update","url":"{url}","checksum":"{digest}"}}"#
    ));
    dev.tick();
    let acks = dev.acks();
    let ack = acks.iter().find(|a| a["commandId"] == "ota-after").unwrap();
    assert_eq!(ack["ok"], true);
    assert_ne!(dev.runtime.ota().state(), OtaState::Idle);
}

#[test]
fn test_reconnect_while_unhealthy_announces_degraded() {
    let mut dev = Device::boot();
    dev.connect();
    dev.net.drop_session();
    dev.board.set_free_heap(4_000);
    dev.run_for(5);
    assert!(dev.runtime.supervisor().is_connected());
    assert!(!dev.runtime.health().is_healthy);
    assert_eq!(dev.presence().as_deref(), Some("degraded"));
}
