//! Demo worker handlers.
//!
//! - `ECHO(args..)` replies `ECHO(args..)`
//! - `COMPUTE(a, b, ..)` replies `RESULT(sum)`, the sum rendered as a string
//! - `COUNTDOWN(n)` replies `TICK(n)` .. `TICK(1)`, then `DONE`, from a helper
//!   thread with its own channel context

use std::thread;
use std::time::Duration;

use anyhow::Context;
use servicelink::{ChildRuntime, ChildSession, Message, RuntimeHandle, Value};

pub const ECHO: &str = "ECHO";
pub const COMPUTE: &str = "COMPUTE";
pub const RESULT: &str = "RESULT";
pub const COUNTDOWN: &str = "COUNTDOWN";
pub const TICK: &str = "TICK";
pub const DONE: &str = "DONE";

/// Pause between TICKs.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Worker runtime with the demo handlers registered.
pub fn demo_runtime() -> ChildRuntime {
    ChildRuntime::new()
        .on(ECHO, echo)
        .on(COMPUTE, compute)
        .on(COUNTDOWN, countdown)
}

fn echo(session: &mut ChildSession, msg: &Message) -> anyhow::Result<()> {
    session.send(ECHO, msg.args.clone())?;
    Ok(())
}

fn compute(session: &mut ChildSession, msg: &Message) -> anyhow::Result<()> {
    let sum = sum_args(&msg.args)?;
    session.send(RESULT, vec![Value::from(format_sum(sum))])?;
    Ok(())
}

fn countdown(session: &mut ChildSession, msg: &Message) -> anyhow::Result<()> {
    let from = msg
        .arg(0)
        .and_then(Value::to_f64)
        .context("COUNTDOWN needs a number")?;
    let from = from.max(0.0) as u32;
    let handle = session.handle();
    thread::Builder::new()
        .name("countdown".into())
        .spawn(move || {
            if let Err(e) = run_countdown(&handle, from) {
                tracing::warn!(error = %e, "Countdown aborted");
            }
        })
        .context("failed to spawn countdown thread")?;
    Ok(())
}

fn run_countdown(handle: &RuntimeHandle, from: u32) -> anyhow::Result<()> {
    let mut context = handle.get_context()?;
    for n in (1..=from).rev() {
        context.send(TICK, vec![Value::from(n)])?;
        thread::sleep(TICK_INTERVAL);
    }
    context.send(DONE, Vec::new())?;
    context.release()?;
    Ok(())
}

/// Sum every argument as a float. Numeric strings count as numbers.
pub fn sum_args(args: &[Value]) -> anyhow::Result<f64> {
    args.iter().enumerate().try_fold(0.0, |acc, (i, value)| {
        value
            .to_f64()
            .map(|x| acc + x)
            .with_context(|| format!("argument {i} is not a number: {value}"))
    })
}

/// Integral sums have no fractional part (`"5"`); others use the shortest
/// form that round-trips (`"2.5"`).
pub fn format_sum(sum: f64) -> String {
    if sum == 0.0 {
        // Covers -0.0.
        return "0".to_string();
    }
    sum.to_string()
}
