//! Tests for timeouts and caller-driven cancellation.

use std::time::Duration;

use process_pipeline::{Command, cancellation};

#[smol_potat::test]
async fn timeout_terminates_with_sigterm() {
    let err = Command::builder("sleep")
        .arg("5")
        .timeout(Duration::from_millis(100))
        .spawn()
        .join()
        .await
        .unwrap_err();

    assert_eq!(err.signal_name.as_deref(), Some("SIGTERM"));
    assert!(err.exit_code.is_none());
    assert!(err.cause.is_none());
    assert!(err.duration < Duration::from_secs(5));
    assert!(err.message.starts_with("Command was terminated with SIGTERM"));
}

#[smol_potat::test]
async fn cancellation_carries_the_reason_as_cause() {
    let (handle, token) = cancellation();
    let process = Command::builder("sleep")
        .arg("5")
        .cancel_token(token)
        .spawn();

    handle.cancel("operator requested shutdown");
    let err = process.join().await.unwrap_err();

    assert_eq!(err.signal_name.as_deref(), Some("SIGTERM"));
    let cause = err.cause.as_ref().unwrap();
    assert!(cause.to_string().contains("operator requested shutdown"));
    assert!(err.duration < Duration::from_secs(5));
}

#[smol_potat::test]
async fn cancellation_error_exposes_the_cause_chain() {
    use std::error::Error as _;

    let (handle, token) = cancellation();
    let process = Command::builder("sleep")
        .arg("5")
        .cancel_token(token)
        .spawn();

    handle.cancel("cleanup");
    let err = process.join().await.unwrap_err();

    let source = err.source().unwrap();
    assert_eq!(source.to_string(), "command cancelled: cleanup");
}

#[smol_potat::test]
async fn cancel_after_settlement_is_a_no_op() {
    let (handle, token) = cancellation();
    let process = Command::builder("echo")
        .arg("done")
        .cancel_token(token)
        .spawn();

    let first = process.join().await.unwrap();
    assert_eq!(first.stdout, "done");

    handle.cancel("too late");
    let second = process.join().await.unwrap();
    assert_eq!(second.stdout, "done");
}

#[smol_potat::test]
async fn dropped_handle_never_cancels() {
    let (handle, token) = cancellation();
    drop(handle);

    let result = Command::builder("echo")
        .arg("uncancelled")
        .cancel_token(token)
        .spawn()
        .join()
        .await
        .unwrap();

    assert_eq!(result.stdout, "uncancelled");
}

#[smol_potat::test]
async fn output_before_termination_is_kept() {
    let err = Command::builder("sh")
        .arg("-c")
        .arg("echo before; exec sleep 5")
        .timeout(Duration::from_millis(200))
        .spawn()
        .join()
        .await
        .unwrap_err();

    assert_eq!(err.signal_name.as_deref(), Some("SIGTERM"));
    assert_eq!(err.stdout, "before");
    assert_eq!(err.output, "before");
}
