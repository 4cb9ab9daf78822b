//! Whole-node behaviour on in-memory ports

mod common;

use common::*;
use embassy_time::Duration;
use node_rs::actuators::{ActuatorCommand, RelayId};
use node_rs::config;
use node_rs::connectivity::ConnectivityState;
use node_rs::credentials::CredentialStore;
use node_rs::indicator::IndicatorStatus;
use node_rs::ota::UpdateResult;
use node_rs::portal::FormResponse;
use node_rs::session::QoS;
use node_rs::telemetry::SensorSnapshot;

const NETWORK: &str = "greenhouse";
const SECRET: &str = "leafy-2025";

/// Flash already holding credentials for [`NETWORK`]
fn provisioned_flash() -> SharedFlash {
    let flash = SharedFlash::new();
    let mut store = CredentialStore::new(flash.clone(), config::CREDENTIALS_FLASH_OFFSET);
    store.save(&credentials(NETWORK, SECRET)).unwrap();
    flash
}

fn radio_in_range() -> ScriptedRadio {
    let radio = ScriptedRadio::default();
    radio.add_network(NETWORK, SECRET);
    radio
}

/// A node that joined the station and holds a broker session
fn online_node() -> Harness {
    let mut h = Harness::boot(provisioned_flash(), radio_in_range());
    h.tick();
    assert!(h.node.session().is_connected());
    h
}

fn command(h: &mut Harness, json: &str) {
    h.broker.deliver(COMMAND_TOPIC, json);
    h.tick();
}

fn state_of(h: &Harness) -> ConnectivityState {
    h.node.connectivity().state()
}

#[test]
fn blank_node_provisions_and_joins_with_submitted_credentials() {
    let mut h = Harness::boot(SharedFlash::new(), ScriptedRadio::default());

    h.tick();
    assert_eq!(state_of(&h), ConnectivityState::Provisioning);
    assert_eq!(h.radio.access_point().as_deref(), Some(config::PORTAL_AP_NAME));
    assert!(h.portal.is_active());
    assert!(h.radio.joins().is_empty());
    assert_eq!(h.node.indicator().status(), IndicatorStatus::Provisioning);

    h.radio.add_network(NETWORK, SECRET);
    h.portal.submit(NETWORK, SECRET);
    h.tick();
    assert_eq!(h.portal.responses(), vec![FormResponse::Saved]);
    assert!(!h.portal.is_active());
    assert_eq!(h.radio.access_point(), None);
    assert_eq!(state_of(&h), ConnectivityState::StationConnecting);

    h.tick();
    assert_eq!(state_of(&h), ConnectivityState::StationConnected);
    assert_eq!(h.radio.joins(), vec![NETWORK.to_string()]);
    assert_eq!(
        h.node.connectivity().credentials(),
        Some(&credentials(NETWORK, SECRET))
    );

    let mut store = CredentialStore::new(h.flash.clone(), config::CREDENTIALS_FLASH_OFFSET);
    assert_eq!(store.load(), Some(credentials(NETWORK, SECRET)));
}

#[test]
fn empty_network_name_keeps_the_portal_open() {
    let mut h = Harness::boot(SharedFlash::new(), ScriptedRadio::default());
    h.tick();

    h.portal.submit("", SECRET);
    h.tick();
    assert!(matches!(
        h.portal.responses().as_slice(),
        [FormResponse::Rejected(_)]
    ));
    assert_eq!(state_of(&h), ConnectivityState::Provisioning);
    assert!(h.portal.is_active());

    let mut store = CredentialStore::new(h.flash.clone(), config::CREDENTIALS_FLASH_OFFSET);
    assert_eq!(store.load(), None);
}

#[test]
fn stored_credentials_survive_a_restart() {
    let flash = SharedFlash::new();
    {
        let mut h = Harness::boot(flash.clone(), ScriptedRadio::default());
        h.tick();
        h.portal.submit(NETWORK, SECRET);
        h.tick();
    }

    let radio = radio_in_range();
    let mut h = Harness::boot(flash, radio);
    assert_eq!(
        h.node.connectivity().credentials(),
        Some(&credentials(NETWORK, SECRET))
    );

    h.tick();
    assert_eq!(state_of(&h), ConnectivityState::StationConnected);
    assert_eq!(h.radio.0.borrow().ap_starts, 0);
}

#[test]
fn factory_credentials_are_used_but_never_written() {
    let flash = SharedFlash::new();
    let mut h = Harness::boot_with(
        flash.clone(),
        radio_in_range(),
        Some(credentials(NETWORK, SECRET)),
    );

    h.tick();
    assert_eq!(state_of(&h), ConnectivityState::StationConnected);

    let mut store = CredentialStore::new(flash, config::CREDENTIALS_FLASH_OFFSET);
    assert_eq!(store.load(), None);
}

#[test]
fn failed_joins_escalate_to_the_portal() {
    let mut h = Harness::boot(provisioned_flash(), ScriptedRadio::default());

    h.tick();
    assert_eq!(state_of(&h), ConnectivityState::StationRetrying);
    assert_eq!(h.node.indicator().status(), IndicatorStatus::Retrying);

    for _ in 0..5_000 {
        if state_of(&h) == ConnectivityState::Provisioning {
            break;
        }
        h.tick();
    }
    assert_eq!(state_of(&h), ConnectivityState::Provisioning);
    assert_eq!(
        h.radio.joins().len() as u32,
        1 + config::WIFI_RETRY_ESCALATION
    );
    assert!(h.portal.is_active());

    // No station joins while the portal is up
    h.run_for(Duration::from_secs(120));
    assert_eq!(
        h.radio.joins().len() as u32,
        1 + config::WIFI_RETRY_ESCALATION
    );
}

#[test]
fn retries_wait_the_full_interval() {
    let mut h = Harness::boot(provisioned_flash(), ScriptedRadio::default());
    h.tick();
    assert_eq!(h.radio.joins().len(), 1);

    h.run_for(Duration::from_secs(25));
    assert_eq!(h.radio.joins().len(), 1);

    h.radio.add_network(NETWORK, SECRET);
    h.run_for(Duration::from_secs(10));
    assert_eq!(h.radio.joins().len(), 2);
    assert_eq!(state_of(&h), ConnectivityState::StationConnected);
    assert_eq!(h.node.connectivity().retry_count(), 0);
}

#[test]
fn session_announces_itself_and_subscribes() {
    let h = online_node();

    assert_eq!(h.node.indicator().status(), IndicatorStatus::Online);
    assert_eq!(h.broker.statuses().first().map(String::as_str), Some("online"));

    let broker = h.broker.0.borrow();
    assert_eq!(broker.subscriptions[0], (COMMAND_TOPIC.to_string(), QoS::AtLeastOnce));
    let (will_topic, will_payload) = broker.will.clone().unwrap();
    assert_eq!(will_topic, DATA_TOPIC);
    assert_eq!(field(&will_payload, "status").as_deref(), Some("offline"));
    assert_eq!(field(&will_payload, "node_id").as_deref(), Some(NODE_ID));
}

#[test]
fn unreachable_broker_restarts_on_the_fifth_failure() {
    let mut h = Harness::boot(provisioned_flash(), radio_in_range());
    h.broker.set_reachable(false);

    h.tick();
    assert_eq!(state_of(&h), ConnectivityState::StationConnected);
    assert_eq!(h.broker.connect_attempts(), 1);
    assert_eq!(h.node.indicator().status(), IndicatorStatus::BrokerDown);

    for attempts in 2..=4 {
        h.run_for(Duration::from_secs(5));
        assert_eq!(h.broker.connect_attempts(), attempts);
        assert_eq!(h.system.restarts(), 0);
    }

    h.run_for(Duration::from_secs(5));
    assert_eq!(h.broker.connect_attempts(), 5);
    assert_eq!(h.system.restarts(), 1);
}

#[test]
fn broker_recovery_resets_the_failure_count() {
    let mut h = Harness::boot(provisioned_flash(), radio_in_range());
    h.broker.set_reachable(false);
    h.tick();
    h.run_for(Duration::from_secs(15));
    assert_eq!(h.broker.connect_attempts(), 4);

    h.broker.set_reachable(true);
    h.run_for(Duration::from_secs(5));
    assert!(h.node.session().is_connected());
    assert_eq!(h.node.session().consecutive_failures(), 0);
    assert_eq!(h.system.restarts(), 0);
}

#[test]
fn lost_station_drops_the_session_and_rejoins() {
    let mut h = online_node();
    assert_eq!(h.broker.connect_attempts(), 1);

    h.radio.drop_link();
    h.tick();
    assert_eq!(state_of(&h), ConnectivityState::StationRetrying);
    assert!(!h.node.session().is_connected());
    assert!(!h.broker.0.borrow().connected);

    h.tick();
    assert_eq!(state_of(&h), ConnectivityState::StationConnected);
    assert_eq!(h.radio.joins().len(), 2);
    assert_eq!(h.broker.connect_attempts(), 2);
    assert!(h.node.session().is_connected());
}

#[test]
fn relay_command_switches_only_that_relay() {
    let mut h = online_node();
    h.broker.clear_published();
    h.driver.clear();

    command(&mut h, r#"{"action":"RELAY_CONTROL","relay":3,"state":true}"#);

    let relay = RelayId::new(3).unwrap();
    assert_eq!(h.node.actuators().state().relays, [false, false, true, false]);
    assert_eq!(h.driver.commands(), vec![ActuatorCommand::Relay(relay, true)]);
    assert_eq!(h.broker.statuses(), vec!["relay_updated".to_string()]);
}

#[test]
fn out_of_range_relay_is_rejected() {
    let mut h = online_node();
    h.broker.clear_published();
    h.driver.clear();

    command(&mut h, r#"{"action":"RELAY_CONTROL","relay":9,"state":true}"#);

    assert_eq!(h.node.actuators().state().relays, [false; 4]);
    assert!(h.driver.commands().is_empty());
    assert!(h.broker.statuses().is_empty());
}

#[test]
fn malformed_command_is_dropped() {
    let mut h = online_node();
    h.broker.clear_published();

    command(&mut h, "{not json");
    command(&mut h, r#"{"relay":1}"#);

    assert!(h.broker.statuses().is_empty());
    assert_eq!(state_of(&h), ConnectivityState::StationConnected);
    assert!(h.node.session().is_connected());
}

#[test]
fn servo_angle_is_clamped() {
    let mut h = online_node();
    h.broker.clear_published();

    command(&mut h, r#"{"action":"SERVO_CONTROL","angle":250}"#);
    assert_eq!(h.node.actuators().state().servo_angle, 180);

    command(&mut h, r#"{"action":"SERVO_CONTROL","angle":-20}"#);
    assert_eq!(h.node.actuators().state().servo_angle, 0);

    assert_eq!(
        h.broker.statuses(),
        vec!["servo_updated".to_string(), "servo_updated".to_string()]
    );
}

#[test]
fn repeated_command_drives_hardware_once() {
    let mut h = online_node();
    h.broker.clear_published();
    h.driver.clear();

    command(&mut h, r#"{"action":"LIGHT_CONTROL","state":true}"#);
    command(&mut h, r#"{"action":"LIGHT_CONTROL","state":true}"#);

    assert_eq!(h.driver.commands(), vec![ActuatorCommand::Light(true)]);
    assert_eq!(h.broker.statuses().len(), 2);
}

#[test]
fn gas_override_holds_the_fan_on() {
    let mut h = online_node();
    h.broker.clear_published();

    h.sensors.set(SensorSnapshot {
        temperature: Some(20.0),
        humidity: None,
        gas_level: Some(2_500),
    });
    h.run_for(Duration::from_secs(2));
    assert!(h.node.automation().gas_override_active());
    assert!(h.node.actuators().state().fan);
    assert!(h.broker.statuses().contains(&"auto_control".to_string()));

    // A manual off is overridden on the same pass
    command(&mut h, r#"{"action":"FAN_CONTROL","state":false}"#);
    assert!(h.node.actuators().state().fan);

    h.sensors.set(SensorSnapshot {
        temperature: Some(20.0),
        humidity: None,
        gas_level: Some(500),
    });
    h.run_for(Duration::from_secs(2));
    assert!(!h.node.automation().gas_override_active());
    assert!(!h.node.actuators().state().fan);
}

#[test]
fn disabled_smart_mode_leaves_outputs_alone() {
    let mut h = online_node();
    command(&mut h, r#"{"action":"SMART_MODE","enabled":false}"#);
    assert!(!h.node.automation().is_enabled());

    h.sensors.set(SensorSnapshot {
        temperature: Some(35.0),
        humidity: None,
        gas_level: Some(100),
    });
    h.run_for(Duration::from_secs(4));
    assert!(!h.node.actuators().state().fan);

    command(&mut h, r#"{"action":"SMART_MODE","enabled":true}"#);
    h.run_for(Duration::from_secs(2));
    assert!(h.node.actuators().state().fan);
}

#[test]
fn light_follows_the_schedule_once_time_is_known() {
    let mut h = Harness::boot(provisioned_flash(), radio_in_range());
    // 2023-11-14 13:00 UTC, 18:30 local
    h.time.0.set(Some(1_699_966_800));

    h.tick();
    assert!(h.node.wall_clock().is_synced());
    assert!(h.node.actuators().state().light);
    assert_eq!(
        h.broker.statuses(),
        vec!["online".to_string(), "auto_control".to_string()]
    );

    command(
        &mut h,
        r#"{"action":"SET_LIGHT_SCHEDULE","on_hour":20,"off_hour":23}"#,
    );
    h.tick();
    assert!(!h.node.actuators().state().light);
}

#[test]
fn telemetry_and_heartbeat_follow_their_intervals() {
    let mut h = Harness::boot(provisioned_flash(), radio_in_range());
    h.sensors.set(SensorSnapshot {
        temperature: Some(24.5),
        humidity: None,
        gas_level: Some(400),
    });

    h.tick();
    let count = |h: &Harness, kind: &str| {
        h.broker
            .published_on(DATA_TOPIC)
            .iter()
            .filter(|payload| field(payload, "type").as_deref() == Some(kind))
            .count()
    };
    assert_eq!(count(&h, "sensor_data"), 1);
    assert_eq!(count(&h, "heartbeat"), 1);

    let telemetry = h
        .broker
        .published_on(DATA_TOPIC)
        .into_iter()
        .find(|payload| payload.contains("sensor_data"))
        .unwrap();
    assert!(telemetry.contains(r#""gas_sensor":400"#));
    assert!(telemetry.contains(r#""node_id":"246F28AABBCC""#));
    assert!(telemetry.contains(r#""relays":[false,false,false,false]"#));

    let heartbeat = h
        .broker
        .published_on(DATA_TOPIC)
        .into_iter()
        .find(|payload| payload.contains("heartbeat"))
        .unwrap();
    assert_eq!(
        heartbeat,
        r#"{"type":"heartbeat","node_id":"246F28AABBCC","status":"online","uptime":42000,"wifi_rssi":-55}"#
    );

    h.run_for(Duration::from_secs(10));
    assert_eq!(count(&h, "heartbeat"), 2);
    assert_eq!(count(&h, "sensor_data"), 1);

    h.run_for(Duration::from_secs(20));
    assert_eq!(count(&h, "heartbeat"), 4);
    assert_eq!(count(&h, "sensor_data"), 2);
}

#[test]
fn nothing_is_published_without_a_session() {
    let mut h = Harness::boot(provisioned_flash(), radio_in_range());
    h.broker.set_reachable(false);
    h.run_for(Duration::from_secs(12));

    assert!(h.broker.0.borrow().published.is_empty());
}

#[test]
fn reboot_command_confirms_then_restarts() {
    let mut h = online_node();
    h.broker.clear_published();

    command(&mut h, r#"{"action":"REBOOT"}"#);

    assert_eq!(h.broker.statuses(), vec!["rebooting".to_string()]);
    assert_eq!(h.system.restarts(), 1);
}

#[test]
fn status_request_reports_online() {
    let mut h = online_node();
    h.broker.clear_published();

    command(&mut h, r#"{"action":"STATUS_REQUEST"}"#);

    assert_eq!(h.broker.statuses(), vec!["online".to_string()]);
}

#[test]
fn firmware_update_outcomes_are_reported() {
    let mut h = online_node();
    h.broker.clear_published();

    command(
        &mut h,
        r#"{"action":"FIRMWARE_UPDATE","url":"http://10.0.0.2/fw.bin"}"#,
    );
    assert_eq!(h.updater.requested(), vec!["http://10.0.0.2/fw.bin".to_string()]);
    assert_eq!(
        h.broker.statuses(),
        vec!["updating".to_string(), "no_update_needed".to_string()]
    );
    assert_eq!(h.system.restarts(), 0);

    h.broker.clear_published();
    h.updater.will_return(UpdateResult::Failed("server returned 404"));
    command(
        &mut h,
        r#"{"action":"FIRMWARE_UPDATE","url":"http://10.0.0.2/fw.bin"}"#,
    );
    assert_eq!(
        h.broker.statuses(),
        vec!["updating".to_string(), "update_failed".to_string()]
    );
    assert_eq!(h.system.restarts(), 0);

    h.broker.clear_published();
    h.updater.will_return(UpdateResult::Ok);
    command(
        &mut h,
        r#"{"action":"FIRMWARE_UPDATE","url":"http://10.0.0.2/fw.bin"}"#,
    );
    assert_eq!(
        h.broker.statuses(),
        vec!["updating".to_string(), "update_success".to_string()]
    );
    assert_eq!(h.system.restarts(), 1);
}
