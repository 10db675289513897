/*!
 * Status polling and operation reconciliation.
 *
 * Each cycle reads the device's status into the store, then decides what
 * the readings mean for the operation in progress and for an aborted
 * operation that has not yet been seen to halt.
 */
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use skylink_core::logging::operation_span;
use skylink_devices::driver::Evaluation;
use skylink_devices::error::ErrorKind;

use crate::error::DispatchError;
use crate::operation::{OperationStatus, Tracked};
use crate::session::{SessionCore, SessionState, WeakSession};

/// Run one poll cycle
pub(crate) async fn poll_once(core: &mut SessionCore) -> Result<(), DispatchError> {
    let Some(link) = core.link.as_mut() else {
        trace!("Not connected, skipping poll");
        return Ok(());
    };

    let polled = core.driver.poll(link, &core.store).await;
    let now = Instant::now();

    match polled {
        Ok(readings) => {
            for reading in readings {
                match core.store.set_from_device(reading.key, reading.value) {
                    Ok(Some(change)) => core.record_changes([change]),
                    Ok(None) => {}
                    Err(e) => warn!("Discarding reading: {}", e),
                }
            }
            reconcile(core, now);
            settle_halt(core, now, true);
            Ok(())
        }
        Err(e) => {
            warn!("Poll of {} failed: {}", core.name, e);
            let stale = core.store.mark_stale();
            core.record_changes(stale);
            stalled(core, now);
            settle_halt(core, now, false);
            Err(DispatchError::TransportFailure(e))
        }
    }
}

fn reconcile(core: &mut SessionCore, now: Instant) {
    let Some(mut tracked) = core.current.take() else {
        return;
    };

    match core.driver.evaluate(&tracked.op.intent, &tracked.op.target, &core.store) {
        Evaluation::Completed => {
            tracked.set_status(OperationStatus::Completed);
            operation_span(tracked.op.kind(), tracked.op.id.as_str())
                .in_scope(|| info!("Completed at {}", tracked.op.target));
            core.finish(tracked);
            core.set_state(SessionState::Idle);
        }
        Evaluation::Interrupted { kind, reason } => fail(core, tracked, kind, reason),
        Evaluation::Progress(remaining) => {
            let closer = tracked.note_progress(remaining);
            if !closer && now >= tracked.op.deadline {
                let reason = format!("still {} from the target at the deadline", remaining);
                fail(core, tracked, ErrorKind::Timeout, reason);
            } else {
                core.current = Some(tracked);
            }
        }
    }
}

/// A failed poll counts as no progress
fn stalled(core: &mut SessionCore, now: Instant) {
    match core.current.take() {
        Some(tracked) if now >= tracked.op.deadline => {
            let reason = "device stopped answering before the deadline".to_string();
            fail(core, tracked, ErrorKind::Timeout, reason);
        }
        other => core.current = other,
    }
}

fn fail(core: &mut SessionCore, mut tracked: Tracked, kind: ErrorKind, reason: String) {
    operation_span(tracked.op.kind(), tracked.op.id.as_str())
        .in_scope(|| error!("Failed ({}): {}", kind, reason));
    let fault = format!("{} {} failed: {}", tracked.op.kind(), tracked.op.id, reason);
    tracked.fail(kind, reason);
    core.finish(tracked);
    core.fault(fault);
}

fn settle_halt(core: &mut SessionCore, now: Instant, polled: bool) {
    let Some(mut tracked) = core.halting.take() else {
        return;
    };

    if polled && core.driver.is_halted(&core.store) {
        debug!("Device confirmed halt of {}", tracked.op.id);
        core.archive(tracked.op);
        return;
    }

    let grace = core.timing.halt_grace();
    let since = tracked.halting_since.unwrap_or(now);
    if now.duration_since(since) >= grace {
        let reason = format!("device still moving {:?} after halt", grace);
        fail(core, tracked, ErrorKind::DeviceFault, reason);
    } else {
        tracked.halting_since = Some(since);
        core.halting = Some(tracked);
    }
}

/// Poll on a fixed period until the session is dropped or the task aborted
pub(crate) fn spawn(session: WeakSession, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick is immediate and connect() has just polled
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else {
                break;
            };
            if let Err(e) = session.poll_now().await {
                debug!("Background poll of {}: {}", session.name(), e);
            }
        }
        trace!("Poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use skylink_core::config::{DeviceConfig, SessionDefaults, TransportConfig};
    use skylink_devices::device::Intent;
    use skylink_devices::drivers;
    use skylink_devices::sim::{SimConnector, StepFocuserSim};

    use crate::session::Session;

    fn step_focuser(sim: StepFocuserSim) -> (Session, SimConnector) {
        let connector = SimConnector::new(Arc::new(Mutex::new(sim)));
        let config = DeviceConfig::new(
            "step",
            "step-focuser",
            TransportConfig::Simulated {
                model: "step-focuser".into(),
            },
        );
        let driver = drivers::build(&config).unwrap();
        let identity =
            skylink_devices::device::DeviceIdentity::from_config(&config, driver.kind(), driver.model());
        let timing = SessionDefaults {
            autopoll: false,
            command_timeout_ms: 200,
            ..SessionDefaults::default()
        };
        let session = Session::new(identity, driver, Arc::new(connector.clone()), timing);
        (session, connector)
    }

    #[tokio::test]
    async fn test_poll_without_connection_is_skipped() {
        let (session, _) = step_focuser(StepFocuserSim::new(0));
        session.poll_now().await.unwrap();
        assert_eq!(session.state().await, SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_past_deadline_times_out() {
        let (session, connector) = step_focuser(StepFocuserSim::new(0));
        session.connect().await.unwrap();
        let handle = session
            .submit_with_deadline(Intent::MoveRelative(5000), Duration::from_secs(2))
            .await
            .unwrap();

        connector.inject(|faults| faults.silent = true);
        session.poll_now().await.unwrap_err();
        assert_eq!(handle.status(), OperationStatus::InProgress);

        time::advance(Duration::from_secs(2)).await;
        session.poll_now().await.unwrap_err();
        assert_eq!(handle.status(), OperationStatus::Failed(ErrorKind::Timeout));
        assert_eq!(session.state().await, SessionState::Faulted);
    }

    #[tokio::test]
    async fn test_relative_move_completes() {
        let (session, _) = step_focuser(StepFocuserSim::new(500).with_step(200));
        session.connect().await.unwrap();
        let handle = session.submit(Intent::MoveRelative(-400)).await.unwrap();

        for _ in 0..3 {
            session.poll_now().await.unwrap();
        }
        assert_eq!(handle.status(), OperationStatus::Completed);
        let position = session.get_property("position").await.unwrap();
        assert_eq!(position.value, Some(100i64.into()));
    }
}
