//! Commander-side helpers that drive a component to a summary state.

use std::time::Duration;

use serde_json::json;

use telebus_core::{Error, Fields, Remote, Result};

use crate::state::{State, Transition};

/// Position of a non-fault state on the path from Offline to Enabled.
fn rank(state: State) -> Option<usize> {
    match state {
        State::Offline => Some(0),
        State::Standby => Some(1),
        State::Disabled => Some(2),
        State::Enabled => Some(3),
        State::Fault => None,
    }
}

const UP: [Transition; 3] = [
    Transition::EnterControl,
    Transition::Start,
    Transition::Enable,
];

const DOWN: [Transition; 3] = [
    Transition::ExitControl,
    Transition::Standby,
    Transition::Disable,
];

/// Transition commands that take a component from `from` to `to`.
///
/// Fault is left through `standby`; it is never a valid target.
pub fn transition_path(from: State, to: State) -> Result<Vec<Transition>> {
    if to == State::Fault {
        return Err(Error::InvalidValue(
            "cannot go into Fault with state transition commands".into(),
        ));
    }
    let mut path = Vec::new();
    let mut from = from;
    if from == State::Fault {
        path.push(Transition::Standby);
        from = State::Standby;
    }
    let (Some(mut current), Some(target)) = (rank(from), rank(to)) else {
        return Ok(path);
    };
    while current < target {
        path.push(UP[current]);
        current += 1;
    }
    while current > target {
        path.push(DOWN[current - 1]);
        current -= 1;
    }
    Ok(path)
}

/// Current state as last reported on `summaryState`, waiting up to
/// `timeout` when nothing has been received yet.
pub async fn current_summary_state(remote: &Remote, timeout: Duration) -> Result<State> {
    let evt = remote.evt("summaryState")?;
    let sample = match evt.get() {
        Some(sample) => sample,
        None => evt.next(false, Some(timeout)).await?,
    };
    let code: i32 = sample.field("summaryState")?;
    State::from_i32(code)
        .ok_or_else(|| Error::InvalidValue(format!("unknown summary state {code}")))
}

/// Put the component behind `remote` into `state`.
///
/// `configuration_override` is sent with `start` if that command is needed.
/// `timeout` applies to the initial state read and to each command.
pub async fn set_summary_state(
    remote: &Remote,
    state: State,
    configuration_override: &str,
    timeout: Duration,
) -> Result<()> {
    if state == State::Fault {
        return Err(Error::InvalidValue(
            "cannot go into Fault with state transition commands".into(),
        ));
    }
    let current = current_summary_state(remote, timeout).await?;
    let path = transition_path(current, state)?;
    if path.is_empty() {
        return Ok(());
    }
    tracing::info!(
        component = %remote.session().name_index(),
        from = %current,
        to = %state,
        "Changing summary state"
    );
    for transition in path {
        let data = match transition {
            Transition::Start => {
                let mut fields = Fields::new();
                fields.insert(
                    "configurationOverride".into(),
                    json!(configuration_override),
                );
                Some(fields)
            }
            _ => None,
        };
        remote
            .cmd(transition.command_name())?
            .start(data, timeout, true)
            .await?;
    }
    Ok(())
}

/// Shorthand for [`set_summary_state`] with [`State::Enabled`].
pub async fn enable_csc(
    remote: &Remote,
    configuration_override: &str,
    timeout: Duration,
) -> Result<()> {
    set_summary_state(remote, State::Enabled, configuration_override, timeout).await
}
