use super::*;

async fn storage_with(device: &str) -> (Storage, DeviceId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let device_id = DeviceId::new(device);
    assert!(storage.register_device(&device_id).await.expect("register"));
    (storage, device_id)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn registration_seeds_switched_off_status() {
    let (storage, dev1) = storage_with("dev1").await;

    assert!(!storage.register_device(&dev1).await.expect("re-register"));
    assert!(storage.device_exists(&dev1).await.expect("exists"));
    assert!(!storage
        .device_exists(&DeviceId::new("ghost"))
        .await
        .expect("exists"));

    let status = storage
        .services_status(&dev1)
        .await
        .expect("status")
        .expect("registered");
    for field in SWITCH_FIELDS {
        assert_eq!(status[field], Value::from("off"));
    }
    for field in NUMERIC_FIELDS {
        assert_eq!(status[field], Value::from(5));
    }
}

#[tokio::test]
async fn system_command_flips_every_switch_and_records_history() {
    let (storage, dev1) = storage_with("dev1").await;

    storage
        .apply_command(&dev1, "system", "on")
        .await
        .expect("apply");

    let status = storage.services_status(&dev1).await.expect("status").expect("row");
    for field in SWITCH_FIELDS {
        assert_eq!(status[field], Value::from("on"), "{field}");
    }
    let history = storage
        .list_action_history(&dev1, HISTORY_PAGE_SIZE)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].service_type, "system");
    assert_eq!(history[0].description, "system set to on");
}

#[tokio::test]
async fn setpoints_land_in_numeric_fields() {
    let (storage, dev1) = storage_with("dev1").await;

    storage
        .apply_command(&dev1, "air_cond_service", "22")
        .await
        .expect("temperature");
    storage
        .apply_command(&dev1, "headlight_service", "80")
        .await
        .expect("brightness");
    storage
        .apply_command(&dev1, "headlight_service", "on")
        .await
        .expect("switch");
    storage
        .apply_command(&dev1, "temp_threshold", "40")
        .await
        .expect("threshold");

    let status = storage.services_status(&dev1).await.expect("status").expect("row");
    assert_eq!(status["air_cond_temp"], Value::from(22));
    assert_eq!(status["headlight_brightness"], Value::from(80));
    assert_eq!(status["headlight_service"], Value::from("on"));
    assert_eq!(status["air_cond_service"], Value::from("off"));
    assert_eq!(status["temp_threshold"], Value::from("40"));

    let descriptions: Vec<String> = storage
        .list_action_history(&dev1, HISTORY_PAGE_SIZE)
        .await
        .expect("history")
        .into_iter()
        .map(|entry| entry.description)
        .collect();
    assert_eq!(
        descriptions,
        [
            "temp_threshold set to 40",
            "headlight_service set to on",
            "headlight_brightness set to 80",
            "air_cond_temp set to 22",
        ]
    );
}

#[tokio::test]
async fn non_integer_setpoint_rolls_back() {
    let (storage, dev1) = storage_with("dev1").await;

    storage
        .apply_command(&dev1, "air_cond_service", "22.5")
        .await
        .expect_err("not an integer");

    let status = storage.services_status(&dev1).await.expect("status").expect("row");
    assert_eq!(status["air_cond_temp"], Value::from(5));
    assert!(storage
        .list_action_history(&dev1, HISTORY_PAGE_SIZE)
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn offline_switches_everything_off() {
    let (storage, dev1) = storage_with("dev1").await;
    storage
        .apply_command(&dev1, "system", "on")
        .await
        .expect("on");

    storage.record_offline(&dev1).await.expect("offline");

    let status = storage.services_status(&dev1).await.expect("status").expect("row");
    assert_eq!(status["system_status"], Value::from("off"));
    assert_eq!(status["distance_service"], Value::from("off"));
    let history = storage
        .list_action_history(&dev1, HISTORY_PAGE_SIZE)
        .await
        .expect("history");
    assert_eq!(history[0].description, "system set to off");
}

#[tokio::test]
async fn history_is_limited_and_newest_first() {
    let (storage, dev1) = storage_with("dev1").await;
    for value in 1..=20 {
        storage
            .apply_command(&dev1, "drowsiness_threshold", &value.to_string())
            .await
            .expect("apply");
    }

    let history = storage
        .list_action_history(&dev1, HISTORY_PAGE_SIZE)
        .await
        .expect("history");
    assert_eq!(history.len(), 15);
    assert_eq!(history[0].description, "drowsiness_threshold set to 20");
    assert_eq!(history[14].description, "drowsiness_threshold set to 6");
}

#[tokio::test]
async fn unknown_device_has_no_status() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage
        .services_status(&DeviceId::new("ghost"))
        .await
        .expect("status")
        .is_none());
}

#[test]
fn in_memory_urls_have_no_path() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/control_plane.db?mode=rwc"),
        Some(PathBuf::from("./data/control_plane.db"))
    );
}
