mod common;

use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;

use ngi_conductor::process::{LaunchRequest, LocalProcessConnector, ProcessConnector, read_exit_code};
use ngi_conductor::status::UNKNOWN_EXIT_CODE;

use common::temp_root;

fn request(dir: &Utf8Path, command: &str) -> LaunchRequest {
    LaunchRequest {
        command: command.to_string(),
        working_dir: dir.join("ANALYSIS/P1/P1_101/echo"),
        exit_code_path: dir.join("ANALYSIS/P1/P1_101/echo/P1-P1_101-echo.exit_code"),
        job_name: "P1-P1_101-echo".to_string(),
    }
}

fn wait_for_exit(connector: &LocalProcessConnector, pid: &str, request: &LaunchRequest) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(code) = connector.poll(pid, &request.exit_code_path).unwrap() {
            return code;
        }
        assert!(Instant::now() < deadline, "process {pid} did not finish");
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn local_process_reports_its_exit_code() {
    let (_temp, root) = temp_root();
    let connector = LocalProcessConnector::new();
    let request = request(&root, "echo hello; exit 3");

    let pid = connector.execute(&request).unwrap();
    assert!(pid.chars().all(|ch| ch.is_ascii_digit()));
    assert_eq!(wait_for_exit(&connector, &pid, &request), 3);
    assert_eq!(read_exit_code(&request.exit_code_path), Some(3));

    let stdout = std::fs::read_to_string(
        request.log_dir().join("P1-P1_101-echo.out").as_std_path(),
    )
    .unwrap();
    assert_eq!(stdout, "hello\n");
}

#[test]
fn relaunch_clears_the_previous_exit_code() {
    let (_temp, root) = temp_root();
    let connector = LocalProcessConnector::new();
    let failing = request(&root, "exit 1");
    let pid = connector.execute(&failing).unwrap();
    assert_eq!(wait_for_exit(&connector, &pid, &failing), 1);

    let passing = request(&root, "true");
    let pid = connector.execute(&passing).unwrap();
    assert_eq!(wait_for_exit(&connector, &pid, &passing), 0);
}

#[test]
fn vanished_process_without_exit_code_is_unknown() {
    let (_temp, root) = temp_root();
    let connector = LocalProcessConnector::new();
    let missing = root.join("never.exit_code");
    // Far above any default pid_max.
    assert_eq!(
        connector.poll("99999999", &missing).unwrap(),
        Some(UNKNOWN_EXIT_CODE)
    );
}

#[test]
fn cleanup_removes_the_work_directory() {
    let (_temp, root) = temp_root();
    let work_dir = root.join("work");
    std::fs::create_dir_all(work_dir.join("a/b").as_std_path()).unwrap();
    LocalProcessConnector::new().cleanup(&work_dir);
    assert!(!work_dir.as_std_path().exists());
}
