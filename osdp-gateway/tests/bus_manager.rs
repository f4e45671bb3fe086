//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::time::Duration;

use osdp_gateway::{
    BaudRate, DeviceState, GatewayError, Notification, ReaderConfigBuilder, SecureKey,
    SecurityMode, DEFAULT_INSTALLATION_KEY,
};

use common::{reader_config, recv_until, Harness};

#[tokio::test]
async fn baud_conflict_on_shared_port_is_rejected_by_the_bus() {
    let harness = Harness::new();
    harness.gateway.start().await.unwrap();

    harness
        .gateway
        .bus()
        .add_device(reader_config("R3", "COM3", 1, &[]))
        .await
        .unwrap();

    let conflicting = ReaderConfigBuilder::new()
        .name("R4")
        .unwrap()
        .port("COM3")
        .unwrap()
        .baud_rate(BaudRate::B19200)
        .address(2)
        .unwrap()
        .build()
        .unwrap();
    let err = harness.gateway.bus().add_device(conflicting).await.unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
    // No session was created for the rejected reader.
    assert_eq!(harness.gateway.bus().devices().len(), 1);
}

#[tokio::test]
async fn duplicate_address_on_a_bus_is_rejected() {
    let harness = Harness::new();
    harness.gateway.start().await.unwrap();
    harness
        .gateway
        .bus()
        .add_device(reader_config("a", "COM3", 7, &[]))
        .await
        .unwrap();
    let err = harness
        .gateway
        .bus()
        .add_device(reader_config("b", "COM3", 7, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
}

#[tokio::test]
async fn add_device_requires_a_running_manager() {
    let harness = Harness::new();
    let err = harness
        .gateway
        .bus()
        .add_device(reader_config("a", "COM3", 1, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotRunning));
}

#[tokio::test]
async fn online_offline_transitions_raise_status_events() {
    let harness = Harness::new();
    let mut notifications = harness.subscribe();
    let reader = harness
        .gateway
        .readers()
        .create(reader_config("door", "COM3", 1, &[]))
        .await
        .unwrap();
    harness.gateway.start().await.unwrap();

    assert_eq!(
        harness.gateway.bus().device(reader.id).unwrap().state,
        DeviceState::Registered
    );

    harness.codec.go_online("COM3", 1);
    let status = recv_until(&mut notifications, |n| match n {
        Notification::ReaderStatus(status) => Some(status),
        _ => None,
    })
    .await;
    assert!(status.online);
    assert_eq!(status.reader_name, "door");
    assert_eq!(
        harness.gateway.bus().device(reader.id).unwrap().state,
        DeviceState::Online
    );

    harness.codec.go_offline("COM3", 1);
    let status = recv_until(&mut notifications, |n| match n {
        Notification::ReaderStatus(status) => Some(status),
        _ => None,
    })
    .await;
    assert!(!status.online);
    // Back to Registered: the bus keeps polling for recovery.
    assert_eq!(
        harness.gateway.bus().device(reader.id).unwrap().state,
        DeviceState::Registered
    );
}

#[tokio::test]
async fn port_open_failure_surfaces_as_status_and_poisons_the_bus() {
    let harness = Harness::new();
    harness.codec.fail_port("COM9");
    let mut notifications = harness.subscribe();
    harness.gateway.start().await.unwrap();

    let err = harness
        .gateway
        .bus()
        .add_device(reader_config("dead", "COM9", 1, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Transport(_)));

    let status = recv_until(&mut notifications, |n| match n {
        Notification::ReaderStatus(status) => Some(status),
        _ => None,
    })
    .await;
    assert!(!status.online);
    assert!(status.message.unwrap().contains("COM9"));

    // The bus is terminally failed for this run; other ports still work.
    let err = harness
        .gateway
        .bus()
        .add_device(reader_config("dead2", "COM9", 2, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Transport(_)));
    harness
        .gateway
        .bus()
        .add_device(reader_config("alive", "COM3", 1, &[]))
        .await
        .unwrap();
}

#[tokio::test]
async fn install_mode_registers_with_the_default_base_key() {
    let harness = Harness::new();
    let config = ReaderConfigBuilder::new()
        .name("installing")
        .unwrap()
        .port("COM3")
        .unwrap()
        .address(1)
        .unwrap()
        .security_mode(SecurityMode::Install)
        .build()
        .unwrap();
    harness.gateway.readers().create(config).await.unwrap();
    harness.gateway.start().await.unwrap();

    let key = harness.codec.registered_key("COM3", 1).unwrap();
    assert_eq!(key, Some(SecureKey::new(DEFAULT_INSTALLATION_KEY)));
}

#[tokio::test]
async fn secure_mode_without_key_is_not_brought_up() {
    let harness = Harness::new();
    let mut notifications = harness.subscribe();
    harness.gateway.start().await.unwrap();

    // The configuration service would reject this, so drive the bus
    // directly with a hand-built config.
    let mut config = reader_config("keyless", "COM3", 1, &[]);
    config.security_mode = SecurityMode::Secure;
    let err = harness.gateway.bus().add_device(config).await.unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
    assert!(harness.gateway.bus().devices().is_empty());

    let status = recv_until(&mut notifications, |n| match n {
        Notification::ReaderStatus(status) => Some(status),
        _ => None,
    })
    .await;
    assert!(status.message.unwrap().contains("Secure"));
}

#[tokio::test]
async fn secure_channel_installation_on_first_online() {
    let harness = Harness::new();
    let config = ReaderConfigBuilder::new()
        .name("R5")
        .unwrap()
        .port("COM3")
        .unwrap()
        .address(1)
        .unwrap()
        .security_mode(SecurityMode::Install)
        .build()
        .unwrap();
    let reader = harness.gateway.readers().create(config).await.unwrap();
    let mut notifications = harness.subscribe();
    harness.gateway.start().await.unwrap();

    harness.codec.go_online("COM3", 1);

    // An informational status event announces the installation.
    let status = recv_until(&mut notifications, |n| match n {
        Notification::ReaderStatus(status) if status.message.is_some() => Some(status),
        _ => None,
    })
    .await;
    assert!(status.online);
    assert!(status
        .message
        .unwrap()
        .contains("secure channel key installed"));

    // Exactly one random key was generated and installed.
    let installed = harness.codec.installed_keys(1);
    assert_eq!(installed.len(), 1);
    assert_ne!(installed[0], SecureKey::new(DEFAULT_INSTALLATION_KEY));

    // The new key and Secure mode were persisted atomically.
    let stored = harness.gateway.readers().get(reader.id).await.unwrap().unwrap();
    assert_eq!(stored.security_mode, SecurityMode::Secure);
    assert_eq!(stored.secure_key, Some(installed[0]));

    // The session reflects the new posture.
    assert_eq!(
        harness.gateway.bus().device(reader.id).unwrap().security_mode,
        SecurityMode::Secure
    );

    // Going offline and online again must not reinstall.
    harness.codec.go_offline("COM3", 1);
    harness.codec.go_online("COM3", 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.codec.installed_keys(1).len(), 1);
}

#[tokio::test]
async fn remove_device_detaches_and_frees_the_address() {
    let harness = Harness::new();
    let mut notifications = harness.subscribe();
    let reader = harness
        .gateway
        .readers()
        .create(reader_config("door", "COM3", 1, &[]))
        .await
        .unwrap();
    harness.gateway.start().await.unwrap();
    harness.codec.go_online("COM3", 1);
    recv_until(&mut notifications, |n| match n {
        Notification::ReaderStatus(s) if s.online => Some(()),
        _ => None,
    })
    .await;

    harness.gateway.bus().remove_device(reader.id).await.unwrap();
    let status = recv_until(&mut notifications, |n| match n {
        Notification::ReaderStatus(status) => Some(status),
        _ => None,
    })
    .await;
    assert!(!status.online);
    assert!(harness.gateway.bus().device(reader.id).is_none());

    // The bus closed with its last device; the address is reusable.
    harness
        .gateway
        .bus()
        .add_device(reader_config("door2", "COM3", 1, &[]))
        .await
        .unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_detaches_sessions() {
    let harness = Harness::new();
    let reader = harness
        .gateway
        .readers()
        .create(reader_config("door", "COM3", 1, &[]))
        .await
        .unwrap();
    harness.gateway.start().await.unwrap();
    harness.gateway.start().await.unwrap();
    assert!(harness.gateway.bus().device(reader.id).is_some());

    harness.gateway.stop().await.unwrap();
    harness.gateway.stop().await.unwrap();
    assert!(harness.gateway.bus().device(reader.id).is_none());
    assert!(!harness.gateway.is_running());

    // Start again: devices come back from configuration.
    harness.gateway.start().await.unwrap();
    assert!(harness.gateway.bus().device(reader.id).is_some());
    harness.gateway.stop().await.unwrap();
}
