use super::*;

#[test]
fn http_base_urls_become_device_socket_urls() {
    let device_id = DeviceId::new("dev1");
    assert_eq!(
        device_ws_url("http://127.0.0.1:8080", &device_id)
            .expect("url")
            .as_str(),
        "ws://127.0.0.1:8080/ws/dev1"
    );
    assert_eq!(
        device_ws_url("https://control.example/api/", &device_id)
            .expect("url")
            .as_str(),
        "wss://control.example/api/ws/dev1"
    );
}

#[test]
fn rejects_unusable_server_urls() {
    let device_id = DeviceId::new("dev1");
    assert!(device_ws_url("ftp://example.com", &device_id).is_err());
    assert!(device_ws_url("not a url", &device_id).is_err());
    assert!(device_ws_url("http://example.com", &DeviceId::new("")).is_err());
}

#[test]
fn commands_are_acknowledged_or_rejected() {
    let device_id = DeviceId::new("dev1");
    let text = r#"{"command":{"target":"system","value":"on"},"command_id":"c-1"}"#;

    let ack = reply_for(&device_id, text, None).expect("reply");
    assert!(ack.is_success());
    assert_eq!(ack.command_id.as_str(), "c-1");
    assert_eq!(ack.device_id, device_id);

    let nack = reply_for(&device_id, text, Some("overheated")).expect("reply");
    assert!(!nack.is_success());
    assert_eq!(nack.message.as_deref(), Some("overheated"));
}

#[test]
fn error_frames_get_no_reply() {
    let device_id = DeviceId::new("dev1");
    assert!(reply_for(&device_id, r#"{"error":"Unknown command ID"}"#, None).is_none());
    assert!(reply_for(&device_id, "garbage", None).is_none());
}

#[test]
fn notifications_use_the_wire_category_key() {
    let frame = notification(&DeviceId::new("dev1"), "distance_service", "Obstacle ahead");
    let value = serde_json::to_value(&frame).expect("json");
    assert_eq!(value["service_type"], "distance_service");
    assert_eq!(value["device_id"], "dev1");
    assert!(value.get("category").is_none());
}
