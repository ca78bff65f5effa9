//! Timers that fire while a run settles.
//!
//! There is no event loop between runs. Callbacks registered during a run
//! are queued here and fired by the engine after evaluation, in due order,
//! for as long as they fall inside the run's deadline. Whatever is still
//! queued when the run settles is discarded.

use std::fmt;
use std::time::{Duration, Instant};

use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Function, Persistent, Value};

use super::TemplateEnv;

/// Longest delay browsers and Node accept before wrapping to 1ms.
const MAX_DELAY_MS: f64 = 2_147_483_647.0;

/// A timer popped from the queue, ready to fire.
pub(crate) struct DueTimer {
    pub id: i32,
    pub due: Instant,
    pub interval: Option<Duration>,
    pub callback: Persistent<Function<'static>>,
    pub args: Vec<Persistent<Value<'static>>>,
}

/// Pending timers of one context.
#[derive(Default)]
pub(crate) struct TimerQueue {
    next_id: i32,
    pending: Vec<DueTimer>,
    /// Timer currently firing, and whether it was cleared while firing.
    running: Option<(i32, bool)>,
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.pending.len())
            .field("running", &self.running)
            .finish()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a callback; returns the timer id.
    pub fn schedule<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        delay: Duration,
        repeat: bool,
        callback: Function<'js>,
        args: Vec<Value<'js>>,
    ) -> i32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        self.pending.push(DueTimer {
            id,
            due: Instant::now() + delay,
            interval: repeat.then_some(delay),
            callback: Persistent::save(ctx, callback),
            args: args.into_iter().map(|a| Persistent::save(ctx, a)).collect(),
        });
        id
    }

    /// Cancel a pending timer, or stop the firing one from repeating.
    pub fn cancel(&mut self, id: i32) {
        self.pending.retain(|t| t.id != id);
        if let Some((running, cancelled)) = &mut self.running
            && *running == id
        {
            *cancelled = true;
        }
    }

    /// Remove the earliest timer due no later than `deadline`.
    pub fn pop_due(&mut self, deadline: Instant) -> Option<DueTimer> {
        let (index, _) = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= deadline)
            .min_by_key(|(_, t)| (t.due, t.id))?;
        let timer = self.pending.swap_remove(index);
        self.running = Some((timer.id, false));
        Some(timer)
    }

    /// Mark the firing timer as done; returns true if it was cleared meanwhile.
    pub fn finish(&mut self) -> bool {
        self.running.take().is_some_and(|(_, cancelled)| cancelled)
    }

    /// Put an interval timer back for its next tick.
    pub fn reschedule(&mut self, mut timer: DueTimer) {
        if let Some(period) = timer.interval {
            timer.due = (timer.due + period).max(Instant::now());
            self.pending.push(timer);
        }
    }

    /// Drop everything still pending; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        self.running = None;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

fn delay_from(value: Option<Value<'_>>) -> Duration {
    let ms = value.and_then(|v| v.as_number()).unwrap_or(0.0);
    let ms = if ms > MAX_DELAY_MS { 1.0 } else { ms.max(0.0) };
    Duration::from_millis(ms as u64)
}

fn timer_id(value: Option<Value<'_>>) -> Option<i32> {
    value.and_then(|v| v.as_number()).map(|n| n as i32)
}

pub(super) fn install<'js>(ctx: &Ctx<'js>, env: &TemplateEnv) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    for (name, repeat) in [("setTimeout", false), ("setInterval", true)] {
        let queue = env.timers.clone();
        let schedule = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  callback: Function<'js>,
                  delay: Opt<Value<'js>>,
                  args: Rest<Value<'js>>| {
                queue
                    .borrow_mut()
                    .schedule(&ctx, delay_from(delay.0), repeat, callback, args.0)
            },
        )?;
        globals.set(name, schedule)?;
    }

    let queue = env.timers.clone();
    let set_immediate = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, callback: Function<'js>, args: Rest<Value<'js>>| {
            queue
                .borrow_mut()
                .schedule(&ctx, Duration::ZERO, false, callback, args.0)
        },
    )?;
    globals.set("setImmediate", set_immediate)?;

    for name in ["clearTimeout", "clearInterval", "clearImmediate"] {
        let queue = env.timers.clone();
        let clear = Function::new(ctx.clone(), move |id: Opt<Value<'js>>| {
            if let Some(id) = timer_id(id.0) {
                queue.borrow_mut().cancel(id);
            }
        })?;
        globals.set(name, clear)?;
    }

    Ok(())
}
