use super::*;

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn empty_database_url_falls_back_to_default() {
    assert_eq!(
        normalize_database_url("   "),
        "sqlite://./data/control_plane.db"
    );
}

#[test]
fn in_memory_url_is_left_alone() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(sqlite_path("sqlite::memory:"), None);
}

#[test]
fn shared_cache_memory_url_has_no_file_path() {
    let url = "sqlite:file:shared?mode=memory&cache=shared";
    assert_eq!(sqlite_path(url), None);
    assert_eq!(prepare_database_url(url).expect("memory url"), url);
}

#[test]
fn file_overrides_replace_defaults() {
    let mut settings = Settings::default();
    apply_file_overrides(
        &mut settings,
        r#"
bind_addr = "0.0.0.0:9000"
database_url = "sqlite://./var/devices.db"
command_timeout_secs = "12"
"#,
    );
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite://./var/devices.db");
    assert_eq!(settings.command_timeout(), Duration::from_secs(12));
}

#[test]
fn unparseable_file_and_timeout_are_ignored() {
    let mut settings = Settings::default();
    apply_file_overrides(&mut settings, "this is = = not toml");
    apply_file_overrides(&mut settings, r#"command_timeout_secs = "soon""#);
    assert_eq!(settings.server_bind, "127.0.0.1:8080");
    assert_eq!(settings.command_timeout(), Duration::from_secs(5));
}

#[test]
fn zero_timeout_is_clamped() {
    let settings = Settings {
        command_timeout_secs: 0,
        ..Settings::default()
    };
    assert_eq!(settings.command_timeout(), Duration::from_secs(1));
}

#[test]
fn creates_parent_dir_for_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
