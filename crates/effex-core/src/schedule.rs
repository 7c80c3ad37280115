//! Retry and repeat schedules
//!
//! A [`Schedule`] is a pure policy: given the zero-based attempt index and
//! the latest input (a failure for `retry`, a success for `repeat`) it
//! decides whether to go again and after how long.
//!
//! ```text
//! retry(recurs(3) ∩ fixed(10ms))
//!
//!   run ─fail─► decide(0) = Continue(10ms) ─sleep─► run ─fail─► decide(1) ...
//!                                                      decide(3) = Stop ─► fail
//! ```
//!
//! Composition never consults the clock; the interpreter does the sleeping.

use core::fmt;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of consulting a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run again after the delay
    Continue(Duration),

    /// Give up
    Stop,
}

impl Decision {
    /// Delay, if continuing
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Decision::Continue(d) => Some(*d),
            Decision::Stop => None,
        }
    }
}

type StepFn<I> = dyn Fn(u32, &I) -> Decision + Send + Sync;

/// Erased schedule as stored in the effect tree
pub type RawSchedule = Arc<dyn Fn(u32, &(dyn Any + Send)) -> Decision + Send + Sync>;

/// A pure `(attempt, &input) -> Decision` policy
pub struct Schedule<I> {
    step: Arc<StepFn<I>>,
}

impl<I> Clone for Schedule<I> {
    fn clone(&self) -> Self {
        Self {
            step: Arc::clone(&self.step),
        }
    }
}

impl<I> fmt::Debug for Schedule<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Schedule(..)")
    }
}

impl<I: 'static> Schedule<I> {
    /// Build a schedule from a decision function
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(u32, &I) -> Decision + Send + Sync + 'static,
    {
        Self { step: Arc::new(f) }
    }

    /// Consult the schedule
    #[inline]
    pub fn decide(&self, attempt: u32, input: &I) -> Decision {
        (self.step)(attempt, input)
    }

    /// Continue with no delay for attempts `0..n`, then stop
    pub fn recurs(n: u32) -> Self {
        Self::from_fn(move |attempt, _| {
            if attempt < n {
                Decision::Continue(Duration::ZERO)
            } else {
                Decision::Stop
            }
        })
    }

    /// Always continue after `delay`
    pub fn fixed(delay: Duration) -> Self {
        Self::from_fn(move |_, _| Decision::Continue(delay))
    }

    /// Alias of [`Schedule::fixed`]
    pub fn spaced(delay: Duration) -> Self {
        Self::fixed(delay)
    }

    /// Always continue immediately
    pub fn forever() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Fibonacci delays: `base, base, 2*base, 3*base, 5*base, ...`
    pub fn fibonacci(base: Duration) -> Self {
        Self::from_fn(move |attempt, _| Decision::Continue(fibonacci_delay(base, attempt)))
    }

    /// Exponential delays: `base * factor^attempt`, saturating
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self::from_fn(move |attempt, _| {
            let scaled = base.as_secs_f64() * factor.powi(attempt.min(i32::MAX as u32) as i32);
            let delay = Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX);
            Decision::Continue(delay)
        })
    }

    /// Continue only while `pred` holds for the input
    pub fn while_input<P>(pred: P) -> Self
    where
        P: Fn(&I) -> bool + Send + Sync + 'static,
    {
        Self::from_fn(move |_, input| {
            if pred(input) {
                Decision::Continue(Duration::ZERO)
            } else {
                Decision::Stop
            }
        })
    }

    /// Continue only if both continue, with the longer delay
    pub fn intersect(self, other: Schedule<I>) -> Self {
        Self::from_fn(move |attempt, input| {
            match (self.decide(attempt, input), other.decide(attempt, input)) {
                (Decision::Continue(a), Decision::Continue(b)) => Decision::Continue(a.max(b)),
                _ => Decision::Stop,
            }
        })
    }

    /// Continue if either continues, with the shorter delay
    pub fn union(self, other: Schedule<I>) -> Self {
        Self::from_fn(move |attempt, input| {
            match (self.decide(attempt, input), other.decide(attempt, input)) {
                (Decision::Continue(a), Decision::Continue(b)) => Decision::Continue(a.min(b)),
                (Decision::Continue(d), Decision::Stop) | (Decision::Stop, Decision::Continue(d)) => {
                    Decision::Continue(d)
                }
                (Decision::Stop, Decision::Stop) => Decision::Stop,
            }
        })
    }

    /// Clamp every delay to at most `max`
    pub fn up_to_delay(self, max: Duration) -> Self {
        Self::from_fn(move |attempt, input| match self.decide(attempt, input) {
            Decision::Continue(d) => Decision::Continue(d.min(max)),
            Decision::Stop => Decision::Stop,
        })
    }

    /// Delays the schedule would produce for a constant input, up to `limit` attempts
    pub fn delays(&self, input: &I, limit: u32) -> Vec<Duration> {
        (0..limit)
            .map_while(|attempt| self.decide(attempt, input).delay())
            .collect()
    }
}

impl<I: Send + 'static> Schedule<I> {
    /// Erase the input type for the effect tree
    ///
    /// An input of the wrong type stops the schedule.
    pub fn into_raw(self) -> RawSchedule {
        Arc::new(move |attempt, input: &(dyn Any + Send)| match input.downcast_ref::<I>() {
            Some(i) => self.decide(attempt, i),
            None => Decision::Stop,
        })
    }
}

fn fibonacci_delay(base: Duration, attempt: u32) -> Duration {
    let (mut prev, mut cur) = (1u64, 1u64);
    for _ in 1..attempt {
        let next = prev.saturating_add(cur);
        prev = cur;
        cur = next;
        if cur == u64::MAX {
            break;
        }
    }
    let factor = u32::try_from(cur).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_recurs() {
        let s: Schedule<()> = Schedule::recurs(3);
        assert_eq!(s.decide(0, &()), Decision::Continue(Duration::ZERO));
        assert_eq!(s.decide(2, &()), Decision::Continue(Duration::ZERO));
        assert_eq!(s.decide(3, &()), Decision::Stop);

        let never: Schedule<()> = Schedule::recurs(0);
        assert_eq!(never.decide(0, &()), Decision::Stop);
    }

    #[test]
    fn test_fibonacci_sequence() {
        let s: Schedule<()> = Schedule::fibonacci(10 * MS);
        let delays = s.delays(&(), 7);
        let expected: Vec<Duration> = [1, 1, 2, 3, 5, 8, 13].iter().map(|k| 10 * MS * *k).collect();
        assert_eq!(delays, expected);
    }

    #[test]
    fn test_intersect_recurs_fixed() {
        let s: Schedule<()> = Schedule::recurs(3).intersect(Schedule::fixed(10 * MS));
        assert_eq!(s.delays(&(), 10), vec![10 * MS; 3]);
    }

    #[test]
    fn test_union_takes_shorter() {
        let s: Schedule<()> = Schedule::recurs(1)
            .intersect(Schedule::fixed(50 * MS))
            .union(Schedule::recurs(2).intersect(Schedule::fixed(20 * MS)));
        assert_eq!(s.decide(0, &()), Decision::Continue(20 * MS));
        assert_eq!(s.decide(1, &()), Decision::Continue(20 * MS));
        assert_eq!(s.decide(2, &()), Decision::Stop);
    }

    #[test]
    fn test_exponential_and_clamp() {
        let s: Schedule<()> = Schedule::exponential(MS, 2.0).up_to_delay(5 * MS);
        assert_eq!(s.delays(&(), 5), vec![MS, 2 * MS, 4 * MS, 5 * MS, 5 * MS]);

        let huge: Schedule<()> = Schedule::exponential(Duration::from_secs(1), 10.0);
        assert_eq!(huge.decide(400, &()), Decision::Continue(Duration::MAX));
    }

    #[test]
    fn test_while_input() {
        let s: Schedule<u32> = Schedule::while_input(|n| *n < 5);
        assert_eq!(s.decide(0, &1), Decision::Continue(Duration::ZERO));
        assert_eq!(s.decide(0, &5), Decision::Stop);
    }

    #[test]
    fn test_raw_schedule_checks_type() {
        let raw = Schedule::<String>::recurs(2).into_raw();
        let good: Box<dyn Any + Send> = Box::new(String::from("err"));
        let bad: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(raw(0, good.as_ref()), Decision::Continue(Duration::ZERO));
        assert_eq!(raw(0, bad.as_ref()), Decision::Stop);
    }

    proptest! {
        #[test]
        fn prop_recurs_continues_exactly_n_times(n in 0u32..200) {
            let s: Schedule<()> = Schedule::recurs(n);
            prop_assert_eq!(s.delays(&(), n + 10).len() as u32, n);
        }

        #[test]
        fn prop_intersect_is_max_of_fixed(a in 0u64..1000, b in 0u64..1000, attempt in 0u32..50) {
            let s: Schedule<()> = Schedule::fixed(Duration::from_millis(a))
                .intersect(Schedule::fixed(Duration::from_millis(b)));
            prop_assert_eq!(s.decide(attempt, &()), Decision::Continue(Duration::from_millis(a.max(b))));
        }

        #[test]
        fn prop_fibonacci_recurrence(attempt in 2u32..40) {
            let s: Schedule<()> = Schedule::fibonacci(MS);
            let d = |k| s.decide(k, &()).delay().unwrap_or_default();
            prop_assert_eq!(d(attempt), d(attempt - 1) + d(attempt - 2));
        }

        #[test]
        fn prop_up_to_delay_never_exceeds(max in 0u64..500, attempt in 0u32..30) {
            let max = Duration::from_millis(max);
            let s: Schedule<()> = Schedule::fibonacci(MS).up_to_delay(max);
            prop_assert!(s.decide(attempt, &()).delay().unwrap_or_default() <= max);
        }
    }
}
