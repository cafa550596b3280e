//! Lifecycle tests for `PtySession` against real ptys and processes.
//!
//! These cover the teardown policy: the close notice, idempotent close,
//! prompt exit after the polite signals, and escalation to SIGKILL only once
//! the grace period has run out.

mod common;

use common::{read_to_eof, read_until, shell_config};
use futures::StreamExt;
use ish::packet::WindowSize;
use ish::session::{
    PtySession, SessionError, SessionHandle, SessionId, SessionState, CLOSE_NOTICE,
};
use std::time::{Duration, Instant};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

struct Started {
    session: PtySession,
    client: UnixStream,
    reports: mpsc::UnboundedReceiver<SessionId>,
    /// Normally owned by the dispatcher; these tests drive the session directly.
    _read_half: OwnedReadHalf,
}

async fn start(config: &ish::config::Config) -> Started {
    let (server_side, client) = UnixStream::pair().unwrap();
    let (reports_tx, reports) = mpsc::unbounded_channel();
    let (session, read_half) = PtySession::start(SessionId(1), server_side, config, reports_tx)
        .await
        .unwrap();
    Started {
        session,
        client,
        reports,
        _read_half: read_half,
    }
}

/// One full Data payload worth of input.
const INPUT_LINE: &[u8; 32] = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n";

/// Write to a child that never reads stdin until the pty refuses input.
/// Returns the first error.
async fn fill_input_queue(session: &PtySession) -> SessionError {
    let session = session.clone();
    let writes = tokio::task::spawn_blocking(move || {
        for _ in 0..1_000_000 {
            if let Err(e) = session.write_data(INPUT_LINE) {
                return Some(e);
            }
        }
        None
    });
    tokio::time::timeout(Duration::from_secs(10), writes)
        .await
        .expect("pty write blocked instead of failing")
        .unwrap()
        .expect("pty input queue never filled")
}

#[tokio::test]
async fn data_reaches_the_shell_and_output_comes_back() {
    let config = shell_config("/bin/sh", &[], 5);
    let Started {
        session,
        mut client,
        ..
    } = start(&config).await;

    session.write_data(b"echo hi-$((1+1))\n").unwrap();
    read_until(&mut client, "hi-2").await;

    let errors: Vec<_> = session.close().collect().await;
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
}

#[tokio::test]
async fn resize_applies_all_fields() {
    let config = shell_config("/bin/sh", &[], 5);
    let Started {
        session,
        client: _client,
        ..
    } = start(&config).await;

    let size = WindowSize {
        rows: 30,
        cols: 100,
        x_pixels: 800,
        y_pixels: 600,
    };
    session.resize(size).unwrap();
    assert_eq!(session.window_size().unwrap(), size);

    let _: Vec<_> = session.close().collect().await;
}

#[tokio::test]
async fn close_writes_notice_then_closes_connection() {
    let config = shell_config("/bin/sh", &[], 5);
    let Started {
        session,
        mut client,
        mut reports,
        ..
    } = start(&config).await;

    let errors: Vec<_> = session.close().collect().await;
    assert!(errors.is_empty());
    assert_eq!(session.state(), SessionState::Closed);

    let output = read_to_eof(&mut client).await;
    assert!(
        output.contains(std::str::from_utf8(CLOSE_NOTICE).unwrap()),
        "got: {output:?}"
    );

    // Explicit close still files exactly one report.
    assert_eq!(reports.recv().await, Some(SessionId(1)));
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn close_is_idempotent() {
    let config = shell_config("/bin/sh", &[], 5);
    let Started {
        session,
        mut client,
        mut reports,
        ..
    } = start(&config).await;

    let first = session.close();
    let second = session.close();
    let (first, second) = tokio::join!(
        first.collect::<Vec<_>>(),
        second.collect::<Vec<_>>()
    );
    assert!(first.is_empty());
    assert!(second.is_empty());
    assert_eq!(session.state(), SessionState::Closed);

    let third: Vec<_> = session.close().collect().await;
    assert!(third.is_empty());

    // One notice, one report.
    let output = read_to_eof(&mut client).await;
    assert_eq!(output.matches("Process terminated").count(), 1);
    assert_eq!(reports.recv().await, Some(SessionId(1)));
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn prompt_exit_is_not_force_killed() {
    let config = shell_config("/bin/sleep", &["30"], 5);
    let Started {
        session,
        client: _client,
        ..
    } = start(&config).await;

    let started = Instant::now();
    let errors: Vec<_> = session.close().collect().await;
    let elapsed = started.elapsed();

    assert!(errors.is_empty());
    assert!(session.has_exited());
    assert!(!session.was_force_killed());
    assert!(
        elapsed < Duration::from_secs(3),
        "close took {elapsed:?}, should not wait for the grace period"
    );
}

#[tokio::test]
async fn signal_ignoring_process_is_killed_after_grace_period() {
    let config = shell_config(
        "/bin/sh",
        &["-c", "trap '' TERM HUP; echo armed; while :; do sleep 1; done"],
        1,
    );
    let Started {
        session,
        mut client,
        ..
    } = start(&config).await;
    read_until(&mut client, "armed").await;

    let started = Instant::now();
    let errors: Vec<_> = session.close().collect().await;
    let elapsed = started.elapsed();

    assert!(errors.is_empty());
    assert!(session.was_force_killed());
    assert!(session.has_exited());
    assert!(
        elapsed >= Duration::from_secs(1),
        "killed after {elapsed:?}, before the grace period ended"
    );
    assert!(elapsed < Duration::from_secs(5), "close took {elapsed:?}");
}

#[tokio::test]
async fn child_exit_closes_connection_after_report() {
    let config = shell_config("/bin/sh", &[], 5);
    let Started {
        session,
        mut client,
        mut reports,
        ..
    } = start(&config).await;

    session.write_data(b"exit\n").unwrap();
    let reported = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .unwrap();
    assert_eq!(reported, Some(SessionId(1)));
    assert_eq!(session.state(), SessionState::Terminating);

    // The event loop's response to a report.
    let errors: Vec<_> = session.close().collect().await;
    assert!(errors.is_empty());
    assert!(!session.was_force_killed());

    let output = read_to_eof(&mut client).await;
    assert!(output.contains("Process terminated, closing connection"));
}

#[tokio::test]
async fn write_to_a_full_input_queue_is_a_short_write() {
    let config = shell_config("/bin/sleep", &["1000"], 1);
    let Started {
        session,
        client: _client,
        ..
    } = start(&config).await;

    let err = fill_input_queue(&session).await;
    assert!(
        matches!(
            err,
            SessionError::ShortWrite { written, requested: 32 } if written < 32
        ),
        "got: {err:?}"
    );

    let _: Vec<_> = session.close().collect().await;
}

#[tokio::test]
async fn close_finishes_while_writes_to_a_full_pty_continue() {
    let config = shell_config("/bin/sleep", &["1000"], 1);
    let Started {
        session,
        client: _client,
        ..
    } = start(&config).await;

    fill_input_queue(&session).await;

    // Keep writing from the blocking pool the way the dispatcher would, so
    // teardown runs while the writer is in use.
    let writer = {
        let session = session.clone();
        tokio::task::spawn_blocking(move || loop {
            match session.write_data(INPUT_LINE) {
                Err(SessionError::Closed) => break,
                _ => std::thread::sleep(Duration::from_millis(1)),
            }
        })
    };

    let started = Instant::now();
    let errors: Vec<_> = tokio::time::timeout(Duration::from_secs(5), session.close().collect())
        .await
        .expect("close did not finish with a full pty");
    let elapsed = started.elapsed();

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert!(session.has_exited());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(elapsed < Duration::from_secs(4), "close took {elapsed:?}");

    tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .expect("writer still blocked after close")
        .unwrap();
}
