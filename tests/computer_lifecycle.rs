//! Computer lifecycle and event delivery, driven through a context.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ccore::computer::{Peripheral, TASK_COMPLETE};
use ccore::{ComputerContext, ComputerSide, ComputerState, MachineResult, Value};

use common::{
    callback_factory, recording_factory, run_for, step, test_config, wait_until, Recorder,
};

#[test]
fn test_turn_on_and_receive_events() {
    let recorder = Recorder::default();
    let context = ComputerContext::new(test_config(), recording_factory(recorder.clone())).unwrap();
    let computer = context.create_computer(1, Some("first".to_string()));

    assert_eq!(computer.state(), ComputerState::Off);
    assert!(!computer.queue_event("ignored", vec![]));

    computer.turn_on();
    assert!(wait_until(&context, || computer.state() == ComputerState::On));
    assert_eq!(computer.label().as_deref(), Some("first"));

    assert!(computer.queue_event("a", vec![Value::from(1.0)]));
    assert!(computer.queue_event("b", vec![]));
    assert!(wait_until(&context, || recorder.len() == 2));
    assert_eq!(recorder.names(), vec!["a", "b"]);

    let (id, first) = &recorder.events()[0];
    assert_eq!(*id, 1);
    assert_eq!(first.args, vec![Value::Number(1.0)]);

    assert!(context.shutdown(common::DEFAULT_TIMEOUT));
}

#[test]
fn test_filtered_pull_order() {
    let recorder = Recorder::default();
    let factory = {
        let recorder = recorder.clone();
        callback_factory(move || {
            let recorder = recorder.clone();
            let mut booted = false;
            step(move |event, env| {
                if let Some(event) = event {
                    recorder.record(env.computer.id(), event);
                }
                let filter = if booted { None } else { Some("disk".to_string()) };
                booted = true;
                MachineResult::Yield { filter }
            })
        })
    };
    let context = ComputerContext::new(test_config(), factory).unwrap();
    let computer = context.create_computer(1, None);
    computer.turn_on();
    assert!(wait_until(&context, || computer.state() == ComputerState::On));

    computer.queue_event("redstone", vec![]);
    computer.queue_event("disk", vec![]);
    computer.queue_event("terminate", vec![]);

    assert!(wait_until(&context, || recorder.len() == 3));
    assert_eq!(recorder.names(), vec!["disk", "redstone", "terminate"]);
}

#[test]
fn test_shutdown_when_off_is_noop() {
    let context =
        ComputerContext::new(test_config(), recording_factory(Recorder::default())).unwrap();
    let computer = context.create_computer(1, None);

    computer.shutdown();
    computer.reboot();
    assert_eq!(computer.state(), ComputerState::Off);
    assert!(!computer.has_pending_command());

    run_for(&context, Duration::from_millis(50));
    assert_eq!(computer.state(), ComputerState::Off);
}

#[test]
fn test_shutdown_and_reboot() {
    let boots = Arc::new(AtomicUsize::new(0));
    let factory = {
        let boots = Arc::clone(&boots);
        callback_factory(move || {
            boots.fetch_add(1, Ordering::SeqCst);
            step(|_, _| MachineResult::Yield { filter: None })
        })
    };
    let context = ComputerContext::new(test_config(), factory).unwrap();
    let computer = context.create_computer(1, None);

    computer.turn_on();
    assert!(wait_until(&context, || computer.is_on()));

    computer.reboot();
    assert!(wait_until(&context, || {
        boots.load(Ordering::SeqCst) == 2 && computer.state() == ComputerState::On
    }));

    computer.shutdown();
    assert!(wait_until(&context, || computer.state() == ComputerState::Off));
    assert!(!computer.queue_event("late", vec![]));

    computer.turn_on();
    assert!(wait_until(&context, || computer.is_on()));
    assert_eq!(boots.load(Ordering::SeqCst), 3);
}

#[test]
fn test_completed_machine_turns_off() {
    let factory = callback_factory(|| step(|_, _| MachineResult::Completed));
    let context = ComputerContext::new(test_config(), factory).unwrap();
    let computer = context.create_computer(1, None);

    computer.turn_on();
    assert!(wait_until(&context, || {
        computer.state() == ComputerState::Off && !computer.has_pending_command()
    }));
    assert_eq!(computer.last_error(), None);
}

#[test]
fn test_machine_error_crashes_computer() {
    let factory = callback_factory(|| {
        step(|event, _| match event {
            Some(event) if event.name == "fail" => MachineResult::Error("bad thing".to_string()),
            _ => MachineResult::Yield { filter: None },
        })
    });
    let context = ComputerContext::new(test_config(), factory).unwrap();
    let computer = context.create_computer(1, None);

    computer.turn_on();
    assert!(wait_until(&context, || computer.is_on()));
    computer.queue_event("fail", vec![]);

    assert!(wait_until(&context, || computer.state() == ComputerState::Crashed));
    assert_eq!(computer.last_error().as_deref(), Some("bad thing"));

    // A crashed computer can be turned on again.
    computer.turn_on();
    assert!(wait_until(&context, || computer.is_on()));
    assert_eq!(computer.last_error(), None);
}

#[test]
fn test_panic_crashes_only_that_computer() {
    let factory = callback_factory(|| {
        step(|event, _| match event {
            Some(event) if event.name == "panic" => panic!("machine bug"),
            _ => MachineResult::Yield { filter: None },
        })
    });
    let context = ComputerContext::new(test_config(), factory).unwrap();
    let broken = context.create_computer(1, None);
    let healthy = context.create_computer(2, None);

    broken.turn_on();
    healthy.turn_on();
    assert!(wait_until(&context, || broken.is_on() && healthy.is_on()));

    broken.queue_event("panic", vec![]);
    assert!(wait_until(&context, || broken.state() == ComputerState::Crashed));
    assert!(broken
        .last_error()
        .is_some_and(|message| message.contains("internal error")));

    assert!(healthy.queue_event("ping", vec![]));
    run_for(&context, Duration::from_millis(50));
    assert!(healthy.is_on());
}

#[test]
fn test_failing_factory_crashes_on_boot() {
    let factory: Arc<dyn ccore::MachineFactory> = Arc::new(
        |_env: ccore::MachineEnvironment| -> ccore::Result<Box<dyn ccore::Machine>> {
            Err(ccore::CoreError::Machine("no bios".to_string()))
        },
    );
    let context = ComputerContext::new(test_config(), factory).unwrap();
    let computer = context.create_computer(1, None);

    computer.turn_on();
    assert!(wait_until(&context, || computer.state() == ComputerState::Crashed));
    assert!(computer
        .last_error()
        .is_some_and(|message| message.contains("no bios")));
}

#[test]
fn test_main_thread_task_result() {
    let recorder = Recorder::default();
    let factory = {
        let recorder = recorder.clone();
        callback_factory(move || {
            let recorder = recorder.clone();
            step(move |event, env| {
                match event {
                    None => {
                        env.computer
                            .issue_main_thread_task(Box::new(|| Ok(vec![Value::from("done")])))
                            .unwrap();
                        env.computer
                            .issue_main_thread_task(Box::new(|| Err("nope".to_string())))
                            .unwrap();
                    }
                    Some(event) => recorder.record(env.computer.id(), event),
                }
                MachineResult::Yield {
                    filter: Some(TASK_COMPLETE.to_string()),
                }
            })
        })
    };
    let context = ComputerContext::new(test_config(), factory).unwrap();
    let computer = context.create_computer(1, None);
    computer.turn_on();

    assert!(wait_until(&context, || recorder.len() == 2));
    let events = recorder.events();
    assert_eq!(
        events[0].1.args,
        vec![Value::Number(1.0), Value::Bool(true), Value::from("done")]
    );
    assert_eq!(
        events[1].1.args,
        vec![Value::Number(2.0), Value::Bool(false), Value::from("nope")]
    );
}

#[test]
fn test_environment_changes_become_events() {
    let recorder = Recorder::default();
    let context = ComputerContext::new(test_config(), recording_factory(recorder.clone())).unwrap();
    let computer = context.create_computer(1, None);
    computer.turn_on();
    assert!(wait_until(&context, || computer.is_on()));

    computer.environment().set_redstone_input(ComputerSide::Back, 20);
    assert_eq!(computer.environment().redstone_input(ComputerSide::Back), 15);
    computer
        .environment()
        .set_peripheral(ComputerSide::Top, Some(Arc::new("modem") as Peripheral));

    assert!(wait_until(&context, || recorder.len() == 2));
    assert_eq!(recorder.names(), vec!["redstone", "peripheral"]);
    assert_eq!(
        recorder.find("peripheral").unwrap().args,
        vec![Value::from("top")]
    );
}

#[test]
fn test_unload_refuses_further_commands() {
    let context =
        ComputerContext::new(test_config(), recording_factory(Recorder::default())).unwrap();
    let computer = context.create_computer(1, None);
    computer.turn_on();
    assert!(wait_until(&context, || computer.is_on()));

    computer.unload();
    assert!(wait_until(&context, || computer.state() == ComputerState::Off));

    computer.turn_on();
    run_for(&context, Duration::from_millis(50));
    assert_eq!(computer.state(), ComputerState::Off);
    assert!(!computer.queue_event("late", vec![]));
}
