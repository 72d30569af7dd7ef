//! Dispatcher, server and thread-hosted workers talking over loopback TCP.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rstest::rstest;

use super::support::{
    Cluster, Gate, HealthEvent, ProbeFactory, RawWorker, ScriptedProbe, TOKEN, channel_target,
    steady_probes,
};
use crate::dispatcher::{ApplicationId, Policy};
use crate::operation::builtin::{Echo, Fail, Pause};
use crate::operation::{Operation, OperationError};
use crate::protocol::{PROTOCOL_VERSION, WireMessage};
use crate::transport::{FramePipe, PipeError};

const PATIENCE: Duration = Duration::from_secs(15);

fn policy(workers: usize, max_ops: usize, max_queue: usize) -> Policy {
    Policy::new(workers, max_ops, max_queue).expect("valid policy")
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn operations_round_trip_through_workers() {
    let mut cluster = Cluster::new(policy(2, 2, 16));
    cluster.supervise(steady_probes(), Some(32));
    let queuer = cluster.dispatcher.queuer("reports");

    let reply = Echo::new("ping")
        .perform_with_timeout(&queuer, PATIENCE)
        .expect("echo should complete");
    assert_eq!(reply, "ping");

    let failure = Fail::new("no such ledger")
        .perform_with_timeout(&queuer, PATIENCE)
        .expect_err("fail should fail");
    assert_eq!(failure, OperationError::failed("no such ledger"));
}

#[test]
fn ceiling_holds_with_real_workers() {
    let mut cluster = Cluster::new(policy(2, 1, 8));
    cluster.supervise(steady_probes(), None);
    let queuer = cluster.dispatcher.queuer("A");
    let application = ApplicationId::from("A");

    let receivers: Vec<_> = (0..3)
        .map(|_| {
            let (target, receiver) = channel_target::<Pause>();
            Pause::new(Duration::from_millis(200))
                .perform_in_background(&queuer, target)
                .expect("queue pause");
            receiver
        })
        .collect();

    let mut completed = 0;
    let deadline = Instant::now() + PATIENCE;
    while completed < receivers.len() && Instant::now() < deadline {
        let running = cluster
            .dispatcher
            .in_flight_for(&application)
            .expect("in-flight count");
        assert!(running <= 1, "ceiling exceeded: {running} running");
        completed = receivers
            .iter()
            .filter(|receiver| receiver.try_recv().is_ok())
            .count()
            + completed;
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(completed, 3);
}

#[test]
fn unacknowledged_work_moves_to_a_healthy_worker() {
    let mut cluster = Cluster::new(policy(2, 2, 8));
    let mut silent = RawWorker::join(cluster.addr(), 0);
    let gate = Arc::new(Gate::default());
    let supervisor = cluster.supervise_after(steady_probes(), None, Some(Arc::clone(&gate)));

    let (target, receiver) = channel_target::<Echo>();
    Echo::new("retry me")
        .perform_in_background(&cluster.dispatcher.queuer("A"), target)
        .expect("queue echo");
    let handed = silent.receive(Duration::from_secs(5));
    assert!(
        matches!(handed, Some(WireMessage::DoOperation { .. })),
        "silent worker should be offered the operation, got {handed:?}"
    );

    // Never acknowledge; let real workers in.
    gate.open();

    let outcome = receiver.recv_timeout(PATIENCE).expect("outcome delivered");
    assert_eq!(outcome, Ok("retry me".to_owned()));
    assert!(receiver.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(supervisor.failures().snapshot(), vec![0]);
    assert!(matches!(
        silent.try_receive(Duration::from_secs(2)),
        Err(PipeError::Closed)
    ));
}

#[test]
fn execution_timeout_is_reported_once() {
    let mut cluster = Cluster::new(policy(1, 1, 8));
    let supervisor = cluster.supervise(steady_probes(), None);
    let queuer = cluster.dispatcher.queuer("slow");

    let (target, receiver) = channel_target::<Pause>();
    Pause::new(Duration::from_millis(2000))
        .perform_in_background(&queuer, target)
        .expect("queue pause");

    let outcome = receiver.recv_timeout(PATIENCE).expect("outcome delivered");
    assert_eq!(
        outcome,
        Err(OperationError::Timeout {
            kind: Pause::KIND.to_owned(),
            waited_ms: 800,
        })
    );
    assert!(
        receiver.recv_timeout(Duration::from_millis(1500)).is_err(),
        "timed-out operation must not be retried"
    );
    assert_eq!(supervisor.failures().snapshot(), vec![0]);

    let reply = Echo::new("after restart")
        .perform_with_timeout(&queuer, PATIENCE)
        .expect("replacement worker serves");
    assert_eq!(reply, "after restart");
}

#[test]
fn memory_growth_restarts_the_worker_without_failing_it() {
    let sessions = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&sessions);
    let probes: ProbeFactory = Arc::new(move |_| {
        if counted.fetch_add(1, Ordering::SeqCst) == 0 {
            Box::new(ScriptedProbe::new([100, 200]))
        } else {
            Box::new(ScriptedProbe::new([100]))
        }
    });
    let mut cluster = Cluster::new(policy(1, 1, 8));
    let supervisor = cluster.supervise(probes, Some(32));
    let queuer = cluster.dispatcher.queuer("A");

    let first = Echo::new("first")
        .perform_with_timeout(&queuer, PATIENCE)
        .expect("first echo");
    assert_eq!(first, "first");
    let second = Echo::new("second")
        .perform_with_timeout(&queuer, PATIENCE)
        .expect("second echo");
    assert_eq!(second, "second");

    assert!(supervisor.sessions_started(0) >= 2);
    assert!(supervisor.failures().snapshot().is_empty());
    let generations = cluster.reporter.connections_of(0);
    assert!(generations.len() >= 2, "worker should reconnect: {generations:?}");
    assert!(generations.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn disabled_growth_limit_keeps_the_worker() {
    let probes: ProbeFactory = Arc::new(|_| Box::new(ScriptedProbe::new([100, 10_000])));
    let mut cluster = Cluster::new(policy(1, 1, 8));
    let supervisor = cluster.supervise(probes, None);
    let queuer = cluster.dispatcher.queuer("A");

    for message in ["one", "two", "three"] {
        let reply = Echo::new(message)
            .perform_with_timeout(&queuer, PATIENCE)
            .expect("echo");
        assert_eq!(reply, message);
    }
    assert_eq!(supervisor.sessions_started(0), 1);
    assert_eq!(cluster.reporter.connections_of(0).len(), 1);
}

#[rstest]
#[case::wrong_token(PROTOCOL_VERSION, 0, "guess")]
#[case::wrong_version(PROTOCOL_VERSION + 1, 0, TOKEN)]
#[case::unknown_slot(PROTOCOL_VERSION, 9, TOKEN)]
fn refused_workers_are_disconnected(
    #[case] version: u32,
    #[case] worker: usize,
    #[case] token: &str,
) {
    let cluster = Cluster::new(policy(2, 1, 8));
    let mut raw = RawWorker::connect(cluster.addr());

    assert!(!raw.authenticate(version, worker, token));
    assert!(matches!(
        raw.try_receive(Duration::from_secs(2)),
        Err(PipeError::Closed)
    ));
    assert!(
        !cluster
            .reporter
            .events()
            .iter()
            .any(|event| matches!(event, HealthEvent::WorkerConnected { .. }))
    );
}

#[test]
fn a_slot_accepts_one_connection_at_a_time() {
    let cluster = Cluster::new(policy(1, 1, 8));
    let _first = RawWorker::join(cluster.addr(), 0);
    let mut second = RawWorker::connect(cluster.addr());

    assert!(!second.authenticate(PROTOCOL_VERSION, 0, TOKEN));
    assert_eq!(cluster.reporter.connections_of(0).len(), 1);
}

#[test]
fn speaking_out_of_turn_ends_the_connection() {
    let cluster = Cluster::new(policy(1, 1, 8));
    let mut chatty = RawWorker::join(cluster.addr(), 0);

    chatty
        .pipe
        .send(&WireMessage::AcknowledgeOperation { ok: true })
        .expect("send stray acknowledgement");

    assert!(matches!(
        chatty.try_receive(Duration::from_secs(3)),
        Err(PipeError::Closed)
    ));
    assert!(wait_until(|| {
        cluster
            .dispatcher
            .worker_status(0)
            .is_ok_and(|status| !status.connected)
    }));
}

#[test]
fn a_result_cut_off_mid_frame_is_a_dispatch_failure() {
    let cluster = Cluster::new(policy(1, 1, 8));
    let stream = TcpStream::connect(cluster.addr()).expect("connect to dispatch server");
    let mut raw_half = stream.try_clone().expect("clone worker stream");
    let mut stalled = RawWorker {
        pipe: FramePipe::new(stream).expect("worker pipe"),
    };
    assert!(stalled.authenticate(PROTOCOL_VERSION, 0, TOKEN));

    let (target, receiver) = channel_target::<Echo>();
    Echo::new("half a reply")
        .perform_in_background(&cluster.dispatcher.queuer("A"), target)
        .expect("queue echo");
    assert!(matches!(
        stalled.receive(Duration::from_secs(5)),
        Some(WireMessage::DoOperation { .. })
    ));
    stalled
        .pipe
        .send(&WireMessage::AcknowledgeOperation { ok: true })
        .expect("acknowledge");
    // A length prefix and one byte of body, then silence.
    raw_half
        .write_all(&[0, 0, 0, 64, b'{'])
        .expect("write partial frame");

    let outcome = receiver.recv_timeout(PATIENCE).expect("outcome delivered");
    assert!(
        matches!(outcome, Err(OperationError::Dispatch { .. })),
        "a stalled frame is a broken connection, not a slow operation: {outcome:?}"
    );
    assert!(wait_until(|| {
        cluster
            .dispatcher
            .worker_status(0)
            .is_ok_and(|status| status.failed)
    }));
}
