use serde_json::Value;
use sha2::{Digest, Sha256};

use super::Device;
use crate::ota::{hex, OtaState};
use crate::runtime::RebootReason;

const URL: &str = "https://updates.example.com/pump/fw-v2.bin";

fn image_v2() -> Vec<u8> {
    (0..20_000u32).map(|i| (i * 7 % 256) as u8).collect()
}

fn sha(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn ota_cmd(id: &str, url: &str, digest: &str) -> String {
    format!(r#"{{"cmd_id":"{id}","action":"ota_update","url":"{url}","checksum":"{digest}"}}"#)
}

fn ack_for<'a>(acks: &'a [Value], id: &str) -> &'a Value {
    acks.iter()
        .find(|a| a["commandId"] == id)
        .unwrap_or_else(|| panic!("no ack for {id}"))
}

fn phases(dev: &Device) -> Vec<String> {
    dev.ota_status()
        .iter()
        .map(|s| s["state"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// Boot, connect, push a good image and run until the engine asks for a reboot.
fn apply_update(dev: &mut Device) {
    let image = image_v2();
    dev.server.host(URL, image.clone());
    dev.connect();
    dev.send(&ota_cmd("ota-1", URL, &sha(&image)));
    assert_eq!(dev.run_for(60), Some(RebootReason::OtaApplied));
    assert_eq!(dev.flash.next_boot_image(), image);
}

#[test]
fn test_valid_update_commits_and_comes_back_online() {
    let mut dev = Device::boot();
    apply_update(&mut dev);

    let acks = dev.acks();
    assert_eq!(ack_for(&acks, "ota-1")["ok"], true);
    let seen = phases(&dev);
    for phase in ["starting", "downloading", "validating", "applying", "rebooting"] {
        assert!(seen.iter().any(|s| s == phase), "missing {phase} in {seen:?}");
    }
    assert!(dev.ota_status().iter().all(|s| s["deviceId"] == "pump-7"));

    dev.reboot();
    assert_eq!(dev.presence().as_deref(), Some("offline"));
    assert_eq!(dev.runtime.ota().state(), OtaState::PendingVerify);

    dev.connect();
    assert_eq!(dev.runtime.ota().state(), OtaState::Committed);
    assert!(dev.flash.running_confirmed());
    assert_eq!(dev.flash.running_image_bytes(), image_v2());
    assert_eq!(dev.presence().as_deref(), Some("online"));
    assert_eq!(phases(&dev).last().map(String::as_str), Some("success"));
}

#[test]
fn test_digest_mismatch_aborts_and_keeps_original_image() {
    let mut dev = Device::boot();
    dev.server.host(URL, image_v2());
    dev.connect();
    dev.send(&ota_cmd("ota-bad", URL, &sha(b"some other image")));

    assert_eq!(dev.run_for(30), None);
    assert_eq!(dev.runtime.ota().state(), OtaState::Aborted);
    assert_eq!(dev.flash.next_boot_image(), b"firmware-v1");
    assert_eq!(dev.flash.running_image_bytes(), b"firmware-v1");

    let statuses = dev.ota_status();
    let last = statuses.last().unwrap();
    assert_eq!(last["state"], "error");
    assert!(last["message"].as_str().unwrap().contains("digest mismatch"));

    // The engine is free again
    let image = image_v2();
    dev.send(&ota_cmd("ota-retry", URL, &sha(&image)));
    assert_eq!(dev.run_for(60), Some(RebootReason::OtaApplied));
}

#[test]
fn test_failed_verification_rolls_back_to_previous_image() {
    let mut dev = Device::boot();
    apply_update(&mut dev);

    dev.reboot();
    dev.net.refuse_all_sessions(true);
    assert_eq!(dev.run_for(125), Some(RebootReason::OtaRolledBack));
    assert_eq!(dev.runtime.ota().state(), OtaState::RolledBack);
    assert_eq!(dev.presence().as_deref(), Some("offline"));
    assert_eq!(dev.flash.next_boot_image(), b"firmware-v1");

    dev.reboot();
    assert_eq!(dev.flash.running_image_bytes(), b"firmware-v1");
    assert!(dev.flash.running_confirmed());
    assert_eq!(dev.runtime.ota().state(), OtaState::RolledBack);

    dev.net.refuse_all_sessions(false);
    dev.connect();
    let statuses = dev.ota_status();
    let last = statuses.last().unwrap();
    assert_eq!(last["state"], "error");
    assert!(last["message"].as_str().unwrap().contains("rolled back"));
    assert_eq!(dev.presence().as_deref(), Some("online"));
}

#[test]
fn test_second_update_request_is_rejected() {
    let mut dev = Device::boot();
    let image = image_v2();
    dev.server.host(URL, image.clone());
    dev.connect();
    dev.send(&ota_cmd("first", URL, &sha(&image)));
    dev.send(&ota_cmd("second", URL, &sha(&image)));
    dev.tick();

    let acks = dev.acks();
    assert_eq!(ack_for(&acks, "first")["ok"], true);
    let second = ack_for(&acks, "second");
    assert_eq!(second["ok"], false);
    assert_eq!(second["errorMessage"], "update already in progress");
    assert_eq!(dev.server.open_count(), 0);

    assert_eq!(dev.run_for(60), Some(RebootReason::OtaApplied));
    assert_eq!(dev.server.open_count(), 1);
}

#[test]
fn test_update_refused_when_unhealthy() {
    let mut dev = Device::boot();
    dev.server.host(URL, image_v2());
    dev.connect();
    dev.board.set_free_heap(4_000);
    dev.run_for(61);
    assert!(!dev.runtime.health().is_healthy);
    assert_eq!(dev.presence().as_deref(), Some("degraded"));

    dev.send(&ota_cmd("ota-sick", URL, &sha(&image_v2())));
    dev.tick();
    let acks = dev.acks();
    let ack = ack_for(&acks, "ota-sick");
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["errorMessage"], "device unhealthy, update refused");
    assert_eq!(dev.runtime.ota().state(), OtaState::Idle);
}

#[test]
fn test_plain_http_source_refused() {
    let mut dev = Device::boot();
    dev.connect();
    dev.send(&ota_cmd("ota-http", "http://updates.example.com/fw.bin", &"0".repeat(64)));
    dev.tick();
    let acks = dev.acks();
    let ack = ack_for(&acks, "ota-http");
    assert_eq!(ack["ok"], false);
    assert!(ack["errorMessage"].as_str().unwrap().contains("https"));
}
