//! Tests for lazy line iteration over stdout, stderr, and the merged stream.

use futures::StreamExt;
use process_pipeline::Command;

async fn collect_ok(mut stream: process_pipeline::LineStream) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(item) = stream.next().await {
        lines.push(item.unwrap());
    }
    lines
}

#[smol_potat::test]
async fn stdout_lines_preserve_blanks() {
    let process = Command::builder("printf").arg("a\n\nb\n").spawn();

    let lines = collect_ok(process.stdout()).await;
    assert_eq!(lines, vec!["a", "", "b"]);
}

#[smol_potat::test]
async fn crlf_terminators_are_stripped() {
    let process = Command::builder("printf").arg("x\r\ny\r\n").spawn();

    let lines = collect_ok(process.stdout()).await;
    assert_eq!(lines, vec!["x", "y"]);
}

#[smol_potat::test]
async fn unterminated_tail_is_still_a_line() {
    let process = Command::builder("printf").arg("a\nb").spawn();

    let lines = collect_ok(process.stdout()).await;
    assert_eq!(lines, vec!["a", "b"]);
}

#[smol_potat::test]
async fn streamed_output_does_not_reappear_in_the_result() {
    let process = Command::builder("printf").arg("one\ntwo\n").spawn();

    let lines = collect_ok(process.stdout()).await;
    assert_eq!(lines, vec!["one", "two"]);

    let result = process.join().await.unwrap();
    assert_eq!(result.stdout, "");
    assert_eq!(result.output, "");
}

#[smol_potat::test]
async fn stderr_streams_independently_of_stdout_capture() {
    let process = Command::builder("sh")
        .arg("-c")
        .arg("echo visible; echo hidden 1>&2")
        .spawn();

    let err_lines = collect_ok(process.stderr()).await;
    assert_eq!(err_lines, vec!["hidden"]);

    let result = process.join().await.unwrap();
    assert_eq!(result.stdout, "visible");
    assert_eq!(result.stderr, "");
}

#[smol_potat::test]
async fn merged_stream_yields_lines_from_both_streams() {
    let mut process = Command::builder("sh")
        .arg("-c")
        .arg("echo out; echo err 1>&2")
        .spawn();

    let mut lines = Vec::new();
    while let Some(item) = process.next().await {
        lines.push(item.unwrap());
    }

    // Interleaving between the two streams is not deterministic.
    lines.sort();
    assert_eq!(lines, vec!["err", "out"]);
}

#[smol_potat::test]
async fn failing_process_yields_lines_then_the_error() {
    let process = Command::builder("sh")
        .arg("-c")
        .arg("echo hi; exit 3")
        .spawn();

    let mut stream = process.stdout();
    assert_eq!(stream.next().await.unwrap().unwrap(), "hi");

    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.exit_code, Some(3));
    assert!(stream.next().await.is_none());
}

#[smol_potat::test]
async fn second_claim_of_the_same_stream_fails() {
    let process = Command::builder("echo").arg("claimed").spawn();

    let first = process.stdout();
    let mut second = process.stdout();
    let err = second.next().await.unwrap().unwrap_err();
    let cause = err.cause.as_ref().unwrap();
    assert!(cause.to_string().contains("already being consumed"));

    let lines = collect_ok(first).await;
    assert_eq!(lines, vec!["claimed"]);
}

#[smol_potat::test]
async fn claim_after_settlement_sees_an_empty_stream() {
    let process = Command::builder("echo").arg("spent").spawn();
    let result = process.join().await.unwrap();
    assert_eq!(result.stdout, "spent");

    // The output went into the awaited result; a late claim has nothing left.
    let mut stream = process.stdout();
    assert!(stream.next().await.is_none());
}

#[smol_potat::test]
async fn merged_claim_conflicts_with_a_prior_stdout_claim() {
    let process = Command::builder("echo").arg("x").spawn();

    let _stdout = process.stdout();
    let mut merged = process.lines();
    let err = merged.next().await.unwrap().unwrap_err();
    assert!(err.cause.is_some());
}

#[smol_potat::test]
async fn spawn_failure_surfaces_through_iteration() {
    let process = Command::new("definitely-not-a-real-program-for-these-tests").spawn();

    // Iteration must settle with the same error the await would produce,
    // not wait forever on a stream that was never opened.
    let mut stream = process.stdout();
    let err = stream.next().await.unwrap().unwrap_err();
    let cause = err.cause.as_ref().unwrap();
    let io_err = cause.downcast_ref::<std::io::Error>().unwrap();
    assert_eq!(io_err.kind(), std::io::ErrorKind::NotFound);
    assert!(stream.next().await.is_none());
}

#[smol_potat::test]
async fn spawn_failure_surfaces_through_merged_iteration() {
    let mut process = Command::new("definitely-not-a-real-program-for-these-tests").spawn();

    let err = process.next().await.unwrap().unwrap_err();
    assert!(err.cause.is_some());
    assert!(process.next().await.is_none());
}

#[smol_potat::test]
async fn iteration_alone_drives_the_process() {
    // No join() call anywhere: polling the stream must be enough to run
    // the child to completion and observe all of its output.
    let process = Command::builder("printf").arg("alpha\nbeta\n").spawn();

    let lines = collect_ok(process.stdout()).await;
    assert_eq!(lines, vec!["alpha", "beta"]);
}
