use super::*;

#[test]
fn safe_filename_replaces_dangerous_chars() {
    assert_eq!(safe_filename("a/b\\c:d*e"), "a_b_c_d_e");
    assert_eq!(safe_filename("file<>|name"), "file___name");
}

#[test]
fn ensure_dir_creates_and_returns() {
    let tmp = tempfile::tempdir().unwrap();
    let new_dir = tmp.path().join("subdir");
    let result = ensure_dir(&new_dir).unwrap();
    assert_eq!(result, new_dir);
    assert!(new_dir.exists());
}

#[test]
fn atomic_write_creates_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("test.txt");
    atomic_write(&path, "hello").unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
}

#[test]
fn atomic_write_overwrites() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("test.txt");
    atomic_write(&path, "first").unwrap();
    atomic_write(&path, "second").unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
}

#[test]
fn truncate_chars_handles_utf8() {
    let s = "héllo wörld";
    let truncated = truncate_chars(s, 5, "...");
    assert!(truncated.ends_with("..."));
    assert_eq!(truncated.chars().count(), 8);
}

#[test]
fn truncate_chars_noop_when_short() {
    assert_eq!(truncate_chars("hi", 10, "..."), "hi");
}

#[test]
fn get_broker_home_honours_env_override() {
    unsafe { std::env::set_var("BROKER_HOME", "/tmp/broker-test-home") };
    let home = get_broker_home().unwrap();
    assert_eq!(home, PathBuf::from("/tmp/broker-test-home"));
    unsafe { std::env::remove_var("BROKER_HOME") };
}
