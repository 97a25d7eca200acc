//! Tests for the controller state machine: command legality per state,
//! the settling engine, timeout handling, and stop safety.

use std::sync::Arc;
use std::time::Duration;

use thorlabs_motion::backend::sim::{SimBackend, SimFaults};
use thorlabs_motion::backend::Direction;
use thorlabs_motion::catalog::controllers::ControllerType;
use thorlabs_motion::catalog::stages;
use thorlabs_motion::config::Settings;
use thorlabs_motion::controller::{ControllerState, MotorController};
use thorlabs_motion::MotionError;

const SERIAL: u32 = 27_400_001;

fn fast_settings() -> Settings {
    Settings {
        poll_interval_ms: 2,
        default_timeout_s: 0.2,
        ..Settings::default()
    }
}

fn motor_with_sim() -> (Arc<SimBackend>, MotorController) {
    let backend = Arc::new(SimBackend::new());
    backend.add_device(SERIAL, Some("PRM1Z8"));
    backend.set_motion_rate(SERIAL, 1e9);
    let motor = MotorController::new(
        backend.clone(),
        SERIAL,
        ControllerType::Kdc101,
        &fast_settings(),
    );
    motor.bind_stage(stages::resolve("PRM1Z8").unwrap());
    (backend, motor)
}

#[tokio::test]
async fn test_disconnected_commands_touch_no_hardware() {
    let (backend, motor) = motor_with_sim();

    // Motion from any non-connected state is a movement error ("not
    // ready"); identify needs a session and reports a connection error.
    assert!(matches!(
        motor.home(true, None).await.unwrap_err(),
        MotionError::Movement(_)
    ));
    assert!(matches!(
        motor.move_absolute(10.0, true, None).await.unwrap_err(),
        MotionError::Movement(_)
    ));
    assert!(matches!(
        motor.identify().await.unwrap_err(),
        MotionError::Connection(_)
    ));
    assert_eq!(backend.total_sends(SERIAL), 0);
}

#[tokio::test]
async fn test_connect_is_bounded_by_timeout() {
    let (backend, motor) = motor_with_sim();
    backend.set_faults(
        SERIAL,
        SimFaults {
            stall_open: true,
            ..SimFaults::default()
        },
    );

    let start = std::time::Instant::now();
    let err = motor
        .connect(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, MotionError::Connection(_)));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(motor.state().await, ControllerState::Disconnected);

    // The stall is transient; a later connect succeeds within the
    // settings default deadline.
    backend.set_faults(SERIAL, SimFaults::default());
    motor.connect(None).await.unwrap();
    assert_eq!(motor.state().await, ControllerState::Connected);
}

#[tokio::test]
async fn test_double_connect_rejected() {
    let (_backend, motor) = motor_with_sim();
    motor.connect(None).await.unwrap();
    assert!(matches!(
        motor.connect(None).await.unwrap_err(),
        MotionError::Connection(_)
    ));
    // Disconnect and reconnect is a legal cycle.
    motor.disconnect().await.unwrap();
    motor.connect(None).await.unwrap();
}

#[tokio::test]
async fn test_busy_controller_rejects_motion_without_sends() {
    let (backend, motor) = motor_with_sim();
    backend.set_faults(
        SERIAL,
        SimFaults {
            never_settle: true,
            ..SimFaults::default()
        },
    );
    motor.connect(None).await.unwrap();
    motor.move_absolute(30.0, false, None).await.unwrap();
    assert_eq!(motor.state().await, ControllerState::Moving);

    let sends = backend.total_sends(SERIAL);
    assert!(matches!(
        motor.home(true, None).await.unwrap_err(),
        MotionError::Movement(_)
    ));
    assert!(matches!(
        motor.jog(Direction::Forward, None).await.unwrap_err(),
        MotionError::Movement(_)
    ));
    assert_eq!(backend.total_sends(SERIAL), sends);

    motor.stop().await;
}

#[tokio::test]
async fn test_timeout_sends_exactly_one_stop_and_enters_error() {
    let (backend, motor) = motor_with_sim();
    backend.set_faults(
        SERIAL,
        SimFaults {
            never_settle: true,
            ..SimFaults::default()
        },
    );
    motor.connect(None).await.unwrap();

    let err = motor
        .move_absolute(45.0, true, Some(Duration::from_millis(40)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(motor.state().await, ControllerState::Error);
    assert_eq!(backend.send_count(SERIAL, "stop"), 1);

    // ERROR refuses motion until explicitly recovered.
    assert!(matches!(
        motor.move_absolute(10.0, true, None).await.unwrap_err(),
        MotionError::Movement(_)
    ));
    motor.stop().await;
    assert_eq!(motor.state().await, ControllerState::Connected);
    backend.set_faults(SERIAL, SimFaults::default());
    motor.move_absolute(10.0, true, None).await.unwrap();
}

#[tokio::test]
async fn test_timeout_reports_elapsed_seconds() {
    let (backend, motor) = motor_with_sim();
    backend.set_faults(
        SERIAL,
        SimFaults {
            never_settle: true,
            ..SimFaults::default()
        },
    );
    motor.connect(None).await.unwrap();

    match motor
        .home(true, Some(Duration::from_millis(30)))
        .await
        .unwrap_err()
    {
        MotionError::Timeout { elapsed } => assert!(elapsed >= 0.03),
        other => panic!("Expected timeout, got {other}"),
    }
}

#[tokio::test]
async fn test_stop_is_safe_in_every_state() {
    let (backend, motor) = motor_with_sim();

    // Disconnected: a no-op, not an error.
    motor.stop().await;
    assert_eq!(backend.total_sends(SERIAL), 0);

    motor.connect(None).await.unwrap();
    motor.stop().await;
    assert_eq!(motor.state().await, ControllerState::Connected);

    // Mid-move: halts and returns to CONNECTED.
    backend.set_faults(
        SERIAL,
        SimFaults {
            never_settle: true,
            ..SimFaults::default()
        },
    );
    motor.move_absolute(90.0, false, None).await.unwrap();
    motor.stop().await;
    assert_eq!(motor.state().await, ControllerState::Connected);
}

#[tokio::test]
async fn test_stop_send_failure_enters_error() {
    let (backend, motor) = motor_with_sim();
    motor.connect(None).await.unwrap();
    backend.set_faults(
        SERIAL,
        SimFaults {
            fail_send: true,
            ..SimFaults::default()
        },
    );

    motor.stop().await;
    assert_eq!(motor.state().await, ControllerState::Error);

    // Clearing the fault lets stop() recover the controller.
    backend.set_faults(SERIAL, SimFaults::default());
    motor.stop().await;
    assert_eq!(motor.state().await, ControllerState::Connected);
}

#[tokio::test]
async fn test_failed_command_send_enters_error() {
    let (backend, motor) = motor_with_sim();
    motor.connect(None).await.unwrap();
    backend.set_faults(
        SERIAL,
        SimFaults {
            fail_send: true,
            ..SimFaults::default()
        },
    );

    assert!(matches!(
        motor.home(true, None).await.unwrap_err(),
        MotionError::Communication(_)
    ));
    assert_eq!(motor.state().await, ControllerState::Error);
}

#[tokio::test]
async fn test_blocking_move_settles_and_returns_to_connected() {
    let (_backend, motor) = motor_with_sim();
    motor.connect(None).await.unwrap();

    motor.home(true, None).await.unwrap();
    assert!(motor.is_homed().await.unwrap());

    motor.move_absolute(120.0, true, None).await.unwrap();
    assert_eq!(motor.state().await, ControllerState::Connected);
    let position = motor.get_position().await.unwrap();
    assert!((position - 120.0).abs() < 0.01);
}

#[tokio::test]
async fn test_failed_connect_returns_to_disconnected() {
    let (backend, motor) = motor_with_sim();
    backend.set_faults(
        SERIAL,
        SimFaults {
            fail_open: true,
            ..SimFaults::default()
        },
    );

    assert!(matches!(
        motor.connect(None).await.unwrap_err(),
        MotionError::Connection(_)
    ));
    assert_eq!(motor.state().await, ControllerState::Disconnected);

    // The failure is transient; a later connect succeeds.
    backend.set_faults(SERIAL, SimFaults::default());
    motor.connect(None).await.unwrap();
    assert_eq!(motor.state().await, ControllerState::Connected);
}
