/*!
 * Concrete drivers and lookup by configured name.
 */
use skylink_core::config::DeviceConfig;
use skylink_core::types::Value;

use crate::device::Intent;
use crate::driver::{Driver, Evaluation};
use crate::error::{DriverError, Result};
use crate::property::PropertyStore;

pub mod alpaca_telescope;
pub mod dew_heater;
pub mod dome;
pub mod frame_focuser;
pub mod step_focuser;

pub use alpaca_telescope::AlpacaTelescope;
pub use dew_heater::DewHeater;
pub use dome::Dome;
pub use frame_focuser::FrameFocuser;
pub use step_focuser::StepFocuser;

/// Names accepted by [`build`]
pub const DRIVER_NAMES: &[&str] = &[
    frame_focuser::NAME,
    step_focuser::NAME,
    dome::NAME,
    dew_heater::NAME,
    alpaca_telescope::NAME,
];

/// Build the driver a device entry names
pub fn build(config: &DeviceConfig) -> Result<Box<dyn Driver>> {
    let driver: Box<dyn Driver> = match config.driver.as_str() {
        frame_focuser::NAME => Box::new(FrameFocuser::from_config(config)),
        step_focuser::NAME => Box::new(StepFocuser::from_config(config)),
        dome::NAME => Box::new(Dome::from_config(config)),
        dew_heater::NAME => Box::new(DewHeater::from_config(config)),
        alpaca_telescope::NAME => Box::new(AlpacaTelescope::from_config(config)),
        other => {
            return Err(DriverError::unsupported(format!(
                "unknown driver {:?}, expected one of {:?}",
                other, DRIVER_NAMES
            )))
        }
    };
    Ok(driver)
}

/// Default focuser travel when the configuration gives none
pub(crate) const DEFAULT_MAX_POSITION: i64 = 100_000;

/// Resolve a focuser move intent to an absolute target within travel
pub(crate) fn focus_target(intent: &Intent, store: &PropertyStore, max_position: i64) -> Result<i64> {
    let target = match intent {
        Intent::MoveAbsolute(target) => *target,
        Intent::MoveRelative(offset) => {
            let current = store
                .int("position")
                .ok_or_else(|| DriverError::rejected("current position is unknown"))?;
            current.saturating_add(*offset)
        }
        other => return Err(DriverError::unsupported(other.name())),
    };
    if !(0..=max_position).contains(&target) {
        return Err(DriverError::rejected(format!(
            "target {} outside travel 0..={}",
            target, max_position
        )));
    }
    Ok(target)
}

/// Focuser completion: at the target and stopped
pub(crate) fn evaluate_focus(target: &Value, store: &PropertyStore) -> Evaluation {
    match (store.int("position"), target.as_int()) {
        (Some(position), Some(target)) if position == target && store.bool("moving") == Some(false) => {
            Evaluation::Completed
        }
        (Some(position), Some(target)) => Evaluation::Progress(position.abs_diff(target) as f64),
        _ => Evaluation::remaining(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylink_core::config::TransportConfig;

    use crate::property::{PropertySpec, ValueKind};

    fn focuser_store(position: i64, moving: bool) -> PropertyStore {
        let mut store = PropertyStore::from_schema(&[
            PropertySpec::read_write("position", ValueKind::Int),
            PropertySpec::read_only("moving", ValueKind::Bool),
        ]);
        store.set_from_device("position", Value::Int(position)).unwrap();
        store.set_from_device("moving", Value::Bool(moving)).unwrap();
        store
    }

    #[test]
    fn test_build_by_name() {
        let sim = TransportConfig::Simulated {
            model: "dome".to_string(),
        };
        for name in DRIVER_NAMES {
            let driver = build(&DeviceConfig::new("d", *name, sim.clone())).unwrap();
            assert_eq!(driver.name(), *name);
        }
        assert!(matches!(
            build(&DeviceConfig::new("d", "camera", sim)),
            Err(DriverError::Unsupported(_))
        ));
    }

    #[test]
    fn test_focus_target() {
        let store = focuser_store(1000, false);
        assert_eq!(focus_target(&Intent::MoveRelative(-250), &store, 5000).unwrap(), 750);
        assert!(matches!(
            focus_target(&Intent::MoveAbsolute(6000), &store, 5000),
            Err(DriverError::Rejected(_))
        ));
        assert!(matches!(
            focus_target(&Intent::MoveRelative(-2000), &store, 5000),
            Err(DriverError::Rejected(_))
        ));
        let empty = PropertyStore::default();
        assert!(focus_target(&Intent::MoveRelative(5), &empty, 5000).is_err());
    }

    #[test]
    fn test_evaluate_focus() {
        let target = Value::Int(2000);
        assert_eq!(
            evaluate_focus(&target, &focuser_store(1500, true)),
            Evaluation::Progress(500.0)
        );
        assert_eq!(
            evaluate_focus(&target, &focuser_store(2000, true)),
            Evaluation::Progress(0.0)
        );
        assert_eq!(evaluate_focus(&target, &focuser_store(2000, false)), Evaluation::Completed);
    }
}
