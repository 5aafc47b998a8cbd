//! Engine behavior against a scripted far side of a line channel pair.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use gsmfleet_at::engine::{AtEngine, EngineOptions, ResultCode};
use gsmfleet_at::{AtError, LineChannel, UnsolicitedEvent};

fn options(timeout_ms: u64) -> EngineOptions {
    EngineOptions {
        command_timeout: Duration::from_millis(timeout_ms),
    }
}

/// The modem half of a channel pair.
struct FakeModem {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

impl FakeModem {
    fn new(channel: LineChannel) -> Self {
        Self {
            tx: channel.writer,
            rx: channel.reader,
        }
    }

    async fn expect(&mut self, command: &str) {
        let got = self.rx.recv().await.expect("engine hung up");
        assert_eq!(got, command);
    }

    async fn send(&self, lines: &[&str]) {
        for line in lines {
            self.tx.send((*line).to_owned()).await.expect("send");
        }
    }
}

#[tokio::test]
async fn open_probes_with_bare_at() {
    let (near, far) = LineChannel::pair();
    let mut modem = FakeModem::new(far);

    let opened = tokio::spawn(AtEngine::open(near, options(5_000)));
    modem.expect("AT").await;
    modem.send(&["OK"]).await;

    opened.await.expect("join").expect("probe should succeed");
}

#[tokio::test]
async fn responses_resolve_in_submission_order() {
    let (near, far) = LineChannel::pair();
    let mut modem = FakeModem::new(far);
    let engine = AtEngine::start(near, options(5_000));

    let e1 = engine.clone();
    let e2 = engine.clone();
    let first = tokio::spawn(async move { e1.submit("AT+CIMI").await });
    // Second command is queued until the first resolves; the engine never
    // writes two commands into the same window.
    let second = tokio::spawn(async move { e2.submit("AT+CGMM").await });

    modem.expect("AT+CIMI").await;
    modem.send(&["", "250026153286173", "", "OK"]).await;

    modem.expect("AT+CGMM").await;
    modem.send(&["E173", "OK"]).await;

    let first = first.await.expect("join").expect("first");
    assert_eq!(first.code, ResultCode::Ok);
    assert_eq!(first.lines, vec!["250026153286173"]);

    let second = second.await.expect("join").expect("second");
    assert_eq!(second.lines, vec!["E173"]);
}

#[tokio::test]
async fn unsolicited_lines_bypass_the_response_buffer() {
    let (near, far) = LineChannel::pair();
    let mut modem = FakeModem::new(far);
    let engine = AtEngine::start(near, options(5_000));
    let mut events = engine.events();

    let e = engine.clone();
    let pending = tokio::spawn(async move { e.submit("AT+CIMI").await });

    modem.expect("AT+CIMI").await;
    // RING lands mid-response; it must not contaminate the payload.
    modem
        .send(&["250026153286173", "RING", "+CMTI: \"ME\",7", "OK"])
        .await;

    let resp = pending.await.expect("join").expect("submit");
    assert_eq!(resp.lines, vec!["250026153286173"]);

    assert_eq!(events.recv().await.expect("event"), UnsolicitedEvent::Ring);
    assert_eq!(
        events.recv().await.expect("event"),
        UnsolicitedEvent::NewMessageIndex("\"ME\",7".into())
    );
}

#[tokio::test(start_paused = true)]
async fn timed_out_command_does_not_block_the_queue() {
    let (near, far) = LineChannel::pair();
    let mut modem = FakeModem::new(far);
    let engine = AtEngine::start(near, options(100));

    let e1 = engine.clone();
    let e2 = engine.clone();
    let stalled = tokio::spawn(async move { e1.submit("AT+CUSD=2").await });
    let follow = tokio::spawn(async move { e2.submit("AT+CGMM").await });

    // The modem swallows the first command. Paused time runs the window out
    // and the engine must write the second command immediately.
    modem.expect("AT+CUSD=2").await;
    let err = stalled.await.expect("join").expect_err("must time out");
    assert!(matches!(err, AtError::Timeout { timeout_ms: 100 }));

    modem.expect("AT+CGMM").await;
    // The stale terminal line for the abandoned command arrives now. It must
    // settle the abandoned slot and be discarded, not answer AT+CGMM.
    modem.send(&["stale payload", "OK"]).await;
    modem.send(&["E3372", "OK"]).await;

    let resp = follow.await.expect("join").expect("second command");
    assert_eq!(resp.lines, vec!["E3372"]);
}

#[tokio::test]
async fn error_resolves_without_payload() {
    let (near, far) = LineChannel::pair();
    let mut modem = FakeModem::new(far);
    let engine = AtEngine::start(near, options(5_000));

    let e = engine.clone();
    let pending = tokio::spawn(async move { e.submit("AT+CIMI").await });

    modem.expect("AT+CIMI").await;
    modem.send(&["+CME ERROR detail", "ERROR"]).await;

    let resp = pending.await.expect("join").expect("submit");
    assert_eq!(resp.code, ResultCode::Error);
    assert!(resp.lines.is_empty());
}

#[tokio::test]
async fn command_echo_is_stripped() {
    let (near, far) = LineChannel::pair();
    let mut modem = FakeModem::new(far);
    let engine = AtEngine::start(near, options(5_000));

    let e = engine.clone();
    let pending = tokio::spawn(async move { e.submit("AT+CGSN").await });

    modem.expect("AT+CGSN").await;
    modem.send(&["AT+CGSN", "867322051234567", "OK"]).await;

    let resp = pending.await.expect("join").expect("submit");
    assert_eq!(resp.lines, vec!["867322051234567"]);
}

#[tokio::test]
async fn garbled_lines_do_not_kill_the_engine() {
    let (near, far) = LineChannel::pair();
    let mut modem = FakeModem::new(far);
    let engine = AtEngine::start(near, options(5_000));

    let e = engine.clone();
    let pending = tokio::spawn(async move { e.submit("AT+CGMM").await });

    modem.expect("AT+CGMM").await;
    // Line noise with multi-byte characters at awkward byte offsets lands
    // mid-response; it is buffered like any payload, never a crash.
    modem.send(&["aé", "é", "E3372", "OK"]).await;

    let resp = pending.await.expect("join").expect("submit");
    assert_eq!(resp.lines, vec!["aé", "é", "E3372"]);
}

#[tokio::test]
async fn dropped_transport_fails_pending_commands() {
    let (near, far) = LineChannel::pair();
    let engine = AtEngine::start(near, options(5_000));

    let e = engine.clone();
    let pending = tokio::spawn(async move { e.submit("AT").await });

    // Modem side vanishes: both halves drop.
    let mut modem = FakeModem::new(far);
    modem.expect("AT").await;
    drop(modem);

    let err = pending.await.expect("join").expect_err("must fail");
    assert!(matches!(err, AtError::EngineClosed));

    // The engine stays poisoned for later submissions.
    let err = engine.submit("AT").await.expect_err("closed");
    assert!(matches!(err, AtError::EngineClosed));
}

#[tokio::test]
async fn close_resolves_in_flight_command() {
    let (near, far) = LineChannel::pair();
    let mut modem = FakeModem::new(far);
    let engine = AtEngine::start(near, options(5_000));

    let e = engine.clone();
    let pending = tokio::spawn(async move { e.submit("AT").await });
    modem.expect("AT").await;

    engine.close();
    let err = pending.await.expect("join").expect_err("must fail");
    assert!(matches!(err, AtError::EngineClosed));
}
