//! End-to-end runs of the full harness: simulated devices, capture
//! sessions, orchestrator, and the quarantine corruption detector.

use std::time::Duration;

use poisonpool::BufferPool;
use std::sync::Arc;
use wringer::{
    CaptureSession, DisplayMode, Orchestrator, Sabotage, SessionConfig, SimDevice, SimScript,
};

fn fast_script(sabotage: Option<Sabotage>) -> SimScript {
    SimScript {
        frame_interval: Duration::from_millis(1),
        frames_per_format: Some(5),
        mode_rotation: vec![DisplayMode::Hd1080p25, DisplayMode::Hd720p5994],
        dropout_after: None,
        fail_input_query: false,
        sabotage,
    }
}

fn fast_config(max_cycles: Option<u64>) -> SessionConfig {
    SessionConfig {
        initial_mode: DisplayMode::Hd720p5994,
        settle: Duration::from_millis(100),
        cycle_pause: Duration::from_millis(10),
        max_cycles,
        ..Default::default()
    }
}

fn build_sessions(count: usize, saboteur: Option<usize>, max_cycles: Option<u64>) -> Vec<CaptureSession> {
    (0..count)
        .map(|index| {
            let sabotage = (saboteur == Some(index)).then(|| Sabotage {
                // Well inside the 100ms settle window: after the
                // poison pass, before verification.
                delay: Duration::from_millis(20),
                offset: 4096,
            });
            let device = SimDevice::new(format!("sim-{index}"), fast_script(sabotage));
            CaptureSession::new(
                index,
                Box::new(device),
                Arc::new(BufferPool::new(index)),
                fast_config(max_cycles),
            )
        })
        .collect()
}

fn assert_abort_converges(session_count: usize) {
    let sessions = build_sessions(session_count, Some(0), None);
    let report = Orchestrator::new(sessions).run();

    assert!(!report.passed, "corruption must fail the run");
    assert_eq!(report.stats.len(), session_count);
    assert!(
        report.stats[0].raised_abort,
        "the sabotaged session raises the abort"
    );
    for stats in &report.stats {
        assert!(stats.cycles >= 1, "[{}] never completed a cycle", stats.index);
    }
}

#[test]
fn single_corrupted_session_aborts() {
    assert_abort_converges(1);
}

#[test]
fn abort_converges_across_four_sessions() {
    assert_abort_converges(4);
}

#[test]
fn abort_converges_across_sixteen_sessions() {
    assert_abort_converges(16);
}

#[test]
fn done_signal_fires_exactly_once() {
    let sessions = build_sessions(4, Some(0), None);
    let orchestrator = Orchestrator::new(sessions);
    let group = Arc::clone(orchestrator.group());
    let report = orchestrator.run();

    assert!(!report.passed);
    assert_eq!(group.completion_signals(), 1);
}

#[test]
fn clean_bounded_run_passes() {
    let sessions = build_sessions(3, None, Some(2));
    let report = Orchestrator::new(sessions).run();

    assert!(report.passed, "no sabotage, no corruption, clean exit");
    assert_eq!(report.stats.len(), 3);
    for stats in &report.stats {
        assert_eq!(stats.cycles, 2);
        assert!(!stats.raised_abort);
        assert!(stats.frames >= 5, "[{}] captured too few frames", stats.index);
    }
}
