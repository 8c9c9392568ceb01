use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use conductor_core::logs::{LogTail, TailEvent};
use conductor_core::models::CoreErrorKind;

fn test_log_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("conductor-{test_name}-{nanos}.log"))
}

fn append(path: &PathBuf, text: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

fn line(text: &str) -> TailEvent {
    TailEvent::Line(text.to_string())
}

#[tokio::test]
async fn tail_starts_with_last_lines_then_follows_appends() {
    let path = test_log_path("tail-follow");
    append(&path, "one\ntwo\nthree\nfour\nfive\n");

    let mut tail = LogTail::open(&path, 3).await.unwrap();
    assert_eq!(tail.next_event().await.unwrap(), line("three"));
    assert_eq!(tail.next_event().await.unwrap(), line("four"));
    assert_eq!(tail.next_event().await.unwrap(), line("five"));
    assert_eq!(tail.next_event().await.unwrap(), TailEvent::NoData);

    append(&path, "six\n");
    assert_eq!(tail.next_event().await.unwrap(), line("six"));
    assert_eq!(tail.next_event().await.unwrap(), TailEvent::NoData);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn partial_lines_wait_for_their_newline() {
    let path = test_log_path("tail-partial");
    append(&path, "first\r\nsec");

    let mut tail = LogTail::open(&path, 10).await.unwrap();
    assert_eq!(tail.next_event().await.unwrap(), line("first"));
    assert_eq!(tail.next_event().await.unwrap(), TailEvent::NoData);

    append(&path, "ond\n");
    assert_eq!(tail.next_event().await.unwrap(), line("second"));

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn empty_file_and_zero_history_report_no_data() {
    let path = test_log_path("tail-empty");
    append(&path, "old\n");

    let mut tail = LogTail::open(&path, 0).await.unwrap();
    assert_eq!(tail.next_event().await.unwrap(), TailEvent::NoData);

    append(&path, "new\n");
    assert_eq!(tail.next_event().await.unwrap(), line("new"));

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn missing_log_is_not_found() {
    let path = test_log_path("tail-missing");
    let error = match LogTail::open(&path, 5).await {
        Ok(_) => panic!("opening a missing log should fail"),
        Err(error) => error,
    };
    assert_eq!(error.kind, CoreErrorKind::NotFound);
}
