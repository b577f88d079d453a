//! Speed-scalable virtual clock registered as the embassy-time driver.
//!
//! Virtual time advances at `speed_percent / 100` times real time, so a
//! five-minute scenario can run in seconds. Changing the speed preserves
//! continuity: the virtual "now" never jumps, only its rate changes.
//! A dedicated scheduler thread sleeps until the earliest virtual deadline
//! and wakes the registered wakers.

use core::task::Waker;
use embassy_time_driver::{Driver, TICK_HZ, time_driver_impl};
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant as StdInstant};

/// Slowest and fastest supported simulation speed, in percent.
pub const MIN_SPEED_PERCENT: u32 = 1;
pub const MAX_SPEED_PERCENT: u32 = 10_000;

// Fixed-point Q32.32 for speed scaling. 1.0 == 1<<32
const ONE_Q32: u64 = 1u64 << 32;

#[derive(Debug)]
struct ScaledClock {
    origin_real: StdInstant,   // host reference time
    origin_virtual_ticks: u64, // in embassy ticks
    scale_q32: u64,            // e.g., 0.5 = 0.5 * ONE_Q32
    speed_percent: u32,        // exact percent requested, avoids rounding back from scale_q32
}

#[derive(Default)]
struct SchedulerState {
    // Virtual timestamp -> wakers due at it
    queue: BTreeMap<u64, Vec<Waker>>,
    // Bumped on speed changes so the scheduler re-evaluates its wait
    epoch: u64,
}

static CLOCK: OnceLock<Mutex<ScaledClock>> = OnceLock::new();
static SCHED: OnceLock<Mutex<SchedulerState>> = OnceLock::new();
static CV: OnceLock<Condvar> = OnceLock::new();
static SCHEDULER_STARTED: OnceLock<()> = OnceLock::new();

/// Lock clock or scheduler state. Both hold plain values that stay consistent
/// after a panicking holder, so poisoning is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn clock() -> &'static Mutex<ScaledClock> {
    CLOCK.get_or_init(|| {
        Mutex::new(ScaledClock {
            origin_real: StdInstant::now(),
            origin_virtual_ticks: 0,
            scale_q32: ONE_Q32,
            speed_percent: 100,
        })
    })
}

fn sched() -> &'static Mutex<SchedulerState> {
    SCHED.get_or_init(|| Mutex::new(SchedulerState::default()))
}

fn cv() -> &'static Condvar {
    CV.get_or_init(Condvar::new)
}

fn tick_hz() -> u64 {
    TICK_HZ
}

fn map_real_to_virtual(r: StdInstant) -> u64 {
    let clock = lock(clock());
    let real_dt = r.saturating_duration_since(clock.origin_real);
    let real_ticks = (real_dt.as_nanos() * tick_hz() as u128 / 1_000_000_000u128) as u64;
    let scaled = ((real_ticks as u128) * (clock.scale_q32 as u128) / (ONE_Q32 as u128)) as u64;
    clock.origin_virtual_ticks.wrapping_add(scaled)
}

fn map_virtual_to_real(v_target: u64) -> StdInstant {
    let clock = lock(clock());
    // A target before the virtual origin is already due
    let Some(virt_dt) = v_target.checked_sub(clock.origin_virtual_ticks) else {
        return clock.origin_real;
    };
    let real_ticks = (virt_dt as u128) * (ONE_Q32 as u128) / (clock.scale_q32 as u128);
    let real_ns = real_ticks * 1_000_000_000u128 / (tick_hz() as u128);
    clock.origin_real + Duration::from_nanos(real_ns.min(u64::MAX as u128) as u64)
}

fn ensure_scheduler_thread() {
    SCHEDULER_STARTED.get_or_init(|| {
        std::thread::Builder::new()
            .name("virtual-clock-scheduler".into())
            .spawn(scheduler_thread)
            .expect("failed to start virtual clock scheduler thread");
    });
}

/// Block until some timer is queued, then return the soonest virtual
/// deadline together with the speed epoch it belongs to.
fn next_deadline() -> (u64, u64) {
    let mut guard = lock(sched());
    loop {
        if let Some((&next_at, _)) = guard.queue.first_key_value() {
            return (next_at, guard.epoch);
        }
        guard = cv().wait(guard).unwrap_or_else(PoisonError::into_inner);
    }
}

fn scheduler_thread() {
    // Longest single wait, so speed changes apply promptly even if a notify is missed
    const MAX_WAIT_SLICE: Duration = Duration::from_millis(25);
    loop {
        // CLOCK and SCHED are never held together; the deadline is mapped after the queue lock is released
        let (next_at, snapshot_epoch) = next_deadline();
        let real_target = map_virtual_to_real(next_at);
        let now_r = StdInstant::now();

        if real_target > now_r {
            let wait_dur = (real_target - now_r).min(MAX_WAIT_SLICE);
            let guard = lock(sched());
            if guard.epoch == snapshot_epoch {
                let _ = cv().wait_timeout(guard, wait_dur).unwrap_or_else(PoisonError::into_inner);
            }
            continue;
        }

        let now_v = map_real_to_virtual(StdInstant::now());
        let ready: Vec<Waker> = {
            let mut guard = lock(sched());
            let later = guard.queue.split_off(&now_v.saturating_add(1));
            let due = std::mem::replace(&mut guard.queue, later);
            due.into_values().flatten().collect()
        };
        for waker in ready {
            waker.wake();
        }
    }
}

struct ScaledDriver;

impl Driver for ScaledDriver {
    fn now(&self) -> u64 {
        map_real_to_virtual(StdInstant::now())
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        ensure_scheduler_thread();
        let mut guard = lock(sched());
        let wakers = guard.queue.entry(at).or_default();
        // A future polled repeatedly re-registers the same waker
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
        drop(guard);
        cv().notify_all();
    }
}

time_driver_impl!(static DRIVER: ScaledDriver = ScaledDriver);

/// Set the virtual clock speed, clamped to 1 %..=10000 %.
pub fn set_simulation_speed_percent(percent: u32) {
    let percent = percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
    if get_simulation_speed_percent() == percent {
        return;
    }
    let r_now = StdInstant::now();
    let v_now_old = map_real_to_virtual(r_now);
    let new_scale_q32 = ((percent as u128) * (ONE_Q32 as u128) / 100u128) as u64;

    // Only origin_real moves; origin_virtual_ticks stays put so queued deadlines never land
    // before the origin.
    {
        let mut c = lock(clock());
        let delta_v = v_now_old.saturating_sub(c.origin_virtual_ticks) as u128;
        let real_elapsed_ticks = delta_v * (ONE_Q32 as u128) / (new_scale_q32 as u128);
        let real_elapsed_ns = real_elapsed_ticks * 1_000_000_000u128 / (tick_hz() as u128);
        let elapsed = Duration::from_nanos(real_elapsed_ns.min(u64::MAX as u128) as u64);
        c.origin_real = r_now.checked_sub(elapsed).unwrap_or(r_now);
        c.scale_q32 = new_scale_q32;
        c.speed_percent = percent;
    }
    {
        let mut s = lock(sched());
        s.epoch = s.epoch.wrapping_add(1);
    }
    cv().notify_all();
    log::info!("Simulation speed set to {}%", percent);
}

pub fn get_simulation_speed_percent() -> u32 {
    lock(clock()).speed_percent
}
