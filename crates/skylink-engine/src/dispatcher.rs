/*!
 * Command dispatch.
 *
 * Runs on the locked session core. A submit either starts exactly one
 * operation or returns an error having changed nothing: the store is only
 * written with values the device acknowledged.
 */
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use skylink_core::logging::operation_span;
use skylink_devices::device::Intent;

use crate::error::DispatchError;
use crate::event::SessionEventKind;
use crate::operation::{Operation, OperationHandle, OperationStatus, Tracked};
use crate::session::{SessionCore, SessionState};

/// Validate and start an operation
pub(crate) async fn submit(
    core: &mut SessionCore,
    intent: Intent,
    timeout: Duration,
) -> Result<OperationHandle, DispatchError> {
    core.ensure_accepting()?;
    core.driver.check_intent(&intent, &core.store)?;

    let mut op = Operation::new(intent, Instant::now() + timeout);
    let link = core.link.as_mut().ok_or(DispatchError::NotConnected)?;

    debug!("Dispatching {} with a {:?} deadline", op.intent, timeout);
    let ack = match core.driver.start(link, &op.intent, &core.store).await {
        Ok(ack) => ack,
        Err(e) => {
            warn!("Device refused {}: {}", op.intent, e);
            return Err(e.into());
        }
    };

    for reading in ack.confirmed {
        match core.store.set_from_confirmed_write(reading.key, reading.value) {
            Ok(Some(change)) => core.notify(SessionEventKind::PropertyChanged(change)),
            Ok(None) => {}
            Err(e) => warn!("Ignoring acknowledged write: {}", e),
        }
    }
    op.target = ack.target;

    let (mut tracked, handle) = Tracked::new(op);
    tracked.set_status(OperationStatus::InProgress);
    operation_span(tracked.op.kind(), tracked.op.id.as_str())
        .in_scope(|| info!("Started {} towards {}", tracked.op.intent, tracked.op.target));

    core.publish_operation(&tracked);
    core.current = Some(tracked);
    core.set_state(SessionState::Busy);
    Ok(handle)
}

/// Halt the operation in progress.
///
/// The operation is marked aborted at once; the poller keeps watching it
/// until the device confirms it has stopped.
pub(crate) async fn abort(core: &mut SessionCore) -> Result<(), DispatchError> {
    if core.current.is_none() {
        debug!("Abort with nothing in progress");
        return Ok(());
    }
    let link = core.link.as_mut().ok_or(DispatchError::NotConnected)?;
    core.driver.abort(link).await?;

    if let Some(mut tracked) = core.current.take() {
        tracked.set_status(OperationStatus::Aborted);
        tracked.halting_since = Some(Instant::now());
        operation_span(tracked.op.kind(), tracked.op.id.as_str())
            .in_scope(|| info!("Aborted, waiting for the device to halt"));
        core.publish_operation(&tracked);
        core.halting = Some(tracked);
    }
    core.set_state(SessionState::Idle);
    Ok(())
}
