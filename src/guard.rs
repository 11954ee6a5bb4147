use crate::{
    handshake::{Handshake, Resolution},
    interrupt::{self, ActivationId, Delivery, Expired, TargetThread},
    monitor::{Clock, Monitor, MonitorMsg, MonotonicClock},
};
use crossbeam_channel as channel;
use log::{debug, trace};
use snafu::prelude::*;
use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};

#[cfg(feature = "chrono")]
#[cfg_attr(docsrs, doc(cfg(feature = "chrono")))]
pub mod chrono;

/// Shortest pause the monitor takes between two looks at the clock.
pub const DEFAULT_FLOOR_INTERVAL: Duration = Duration::from_millis(2);

/// An error type that can be raised when a deadline expires.
///
/// The cancellation kind of a guard is this type itself, chosen as a type
/// parameter, so there is no way to configure a guard with an instance.
pub trait Cancellation: Sized + 'static {
    /// Build the error raised in the guarded thread.
    fn deadline_exceeded(expired: Expired) -> Self;
}

/// The cancellation raised by default when a deadline expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("deadline of {duration:?} exceeded after {elapsed:?}"))]
pub struct TimedOut {
    duration: Duration,
    elapsed: Duration,
}

impl TimedOut {
    /// The configured deadline.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// How long the guarded work had been running when the deadline fired.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl Cancellation for TimedOut {
    fn deadline_exceeded(expired: Expired) -> Self {
        TimedOutSnafu {
            duration: expired.duration,
            elapsed: expired.elapsed,
        }
        .build()
    }
}

/// Errors in a deadline's configuration, reported when the guard is built.
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum ConfigError {
    /// A deadline of zero length.
    #[snafu(display("deadline duration must be positive"))]
    ZeroDuration,
    /// Seconds that are not a positive, finite, representable number.
    #[snafu(display("{secs} seconds is not a positive finite deadline"))]
    InvalidSeconds {
        /// The rejected value.
        secs: f64,
    },
    /// A monitor floor interval of zero, which would busy-spin.
    #[snafu(display("monitor floor interval must be positive"))]
    ZeroFloorInterval,
}

/// Errors starting an activation.
#[derive(Debug, Snafu)]
pub enum ActivationError {
    /// The operating system refused to start the monitor thread.
    #[snafu(display("could not spawn the deadline monitor thread: {source}"))]
    SpawnMonitor {
        /// The underlying error.
        source: std::io::Error,
    },
}

/// Settings shared by guards and wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    duration: Duration,
    floor_interval: Duration,
}

impl GuardConfig {
    /// A configuration with the default floor interval.
    pub fn new(duration: Duration) -> Self {
        GuardConfig {
            duration,
            floor_interval: DEFAULT_FLOOR_INTERVAL,
        }
    }

    /// A configuration from fractional seconds.
    pub fn from_secs_f64(secs: f64) -> Result<Self, ConfigError> {
        ensure!(secs.is_finite() && secs > 0.0, InvalidSecondsSnafu { secs });
        let duration = Duration::try_from_secs_f64(secs)
            .ok()
            .context(InvalidSecondsSnafu { secs })?;
        Ok(Self::new(duration))
    }

    /// Replace the monitor's minimum polling interval.
    pub fn with_floor_interval(mut self, floor_interval: Duration) -> Self {
        self.floor_interval = floor_interval;
        self
    }

    /// The deadline length.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The monitor's minimum polling interval.
    pub fn floor_interval(&self) -> Duration {
        self.floor_interval
    }

    /// Check that the configuration can be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.duration.is_zero(), ZeroDurationSnafu);
        ensure!(!self.floor_interval.is_zero(), ZeroFloorIntervalSnafu);
        Ok(())
    }
}

/// A deadline bound to the thread that created it.
///
/// The clock starts when the guard is built, not when it is activated: a guard
/// that sits idle is already spending its deadline. Use [`Deadline`] to anchor
/// at the point of use instead.
///
/// Guards cannot be sent to other threads; cancellation is always delivered to
/// the thread that built the guard.
pub struct DeadlineGuard<E = TimedOut> {
    config: GuardConfig,
    start: Instant,
    target: TargetThread,
    _kind: PhantomData<fn() -> E>,
    _thread_bound: PhantomData<*const ()>,
}

impl DeadlineGuard {
    /// A guard raising [`TimedOut`] after `duration`.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        Self::with_config(GuardConfig::new(duration))
    }

    /// A guard raising [`TimedOut`] after `secs` seconds.
    pub fn from_secs_f64(secs: f64) -> Result<Self, ConfigError> {
        Self::with_config(GuardConfig::from_secs_f64(secs)?)
    }
}

impl<E> DeadlineGuard<E>
where
    E: Cancellation,
{
    /// A guard with explicit settings.
    pub fn with_config(config: GuardConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::anchored(config))
    }

    fn anchored(config: GuardConfig) -> Self {
        DeadlineGuard {
            config,
            start: MonotonicClock.now(),
            target: TargetThread::current(),
            _kind: PhantomData,
            _thread_bound: PhantomData,
        }
    }

    /// The same guard, raising `K` instead. The clock anchor is kept.
    pub fn raising<K: Cancellation>(self) -> DeadlineGuard<K> {
        DeadlineGuard {
            config: self.config,
            start: self.start,
            target: self.target,
            _kind: PhantomData,
            _thread_bound: PhantomData,
        }
    }

    /// The guard's settings.
    pub fn config(&self) -> GuardConfig {
        self.config
    }

    /// The deadline length.
    pub fn duration(&self) -> Duration {
        self.config.duration
    }

    /// When the clock was anchored.
    pub fn start(&self) -> Instant {
        self.start
    }

    /// The thread this guard protects.
    pub fn target(&self) -> &TargetThread {
        &self.target
    }

    /// Time since the clock was anchored.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.config.duration.saturating_sub(self.elapsed())
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.elapsed() > self.config.duration
    }

    /// Start watching the deadline.
    ///
    /// Spawns this activation's monitor and returns at once. The guard is
    /// consumed: a guard protects exactly one scope.
    pub fn activate(self) -> Result<Activation<E>, ActivationError> {
        let id = ActivationId::next();
        let handshake = Arc::new(Handshake::new());
        let (wake, wakeups) = channel::bounded(1);
        Monitor::new(
            id,
            self.config,
            self.start,
            MonotonicClock,
            self.target.clone(),
            handshake.clone(),
            wakeups,
        )
        .spawn()
        .context(SpawnMonitorSnafu)?;
        debug!(
            "Activated {} on {:?} with {:?} left",
            id,
            self.target.id(),
            self.remaining()
        );
        Ok(Activation {
            id,
            target: self.target,
            handshake,
            wake,
            resolved: false,
            _kind: PhantomData,
            _thread_bound: PhantomData,
        })
    }

    /// Activate and run `future` under the deadline.
    pub fn block_on<F: Future>(self, future: F) -> Result<Result<F::Output, E>, ActivationError> {
        Ok(self.activate()?.block_on(future))
    }

    /// Activate and run `f` under the deadline as a single uninterruptible step.
    pub fn run<T, F>(self, f: F) -> Result<Result<T, E>, ActivationError>
    where
        F: FnOnce() -> T,
    {
        Ok(self.activate()?.run(f))
    }
}

impl<E> fmt::Debug for DeadlineGuard<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineGuard")
            .field("config", &self.config)
            .field("start", &self.start)
            .field("target", &self.target)
            .finish()
    }
}

/// One activated scope of a [`DeadlineGuard`].
///
/// The scope ends through [`block_on`](Self::block_on), [`run`](Self::run) or
/// [`resolve`](Self::resolve). Dropping it on any other path, a panic included,
/// resolves it as well, so its monitor never fires afterwards.
pub struct Activation<E = TimedOut> {
    id: ActivationId,
    target: TargetThread,
    handshake: Arc<Handshake>,
    wake: channel::Sender<MonitorMsg>,
    resolved: bool,
    _kind: PhantomData<fn() -> E>,
    _thread_bound: PhantomData<*const ()>,
}

impl<E> Activation<E>
where
    E: Cancellation,
{
    /// This activation's id.
    pub fn id(&self) -> ActivationId {
        self.id
    }

    /// Run `future` on this thread until it completes or the deadline is
    /// delivered at one of its suspension points.
    pub fn block_on<F: Future>(mut self, future: F) -> Result<F::Output, E> {
        let delivery = interrupt::block_on::<E, _>(self.id, future);
        let undelivered = self.finish();
        match delivery {
            Delivery::Interrupted(expired) => Err(E::deadline_exceeded(expired)),
            Delivery::Completed(output) => match undelivered {
                Some(expired) => Err(E::deadline_exceeded(expired)),
                None => Ok(output),
            },
        }
    }

    /// Run `f` as one uninterruptible step; an expiry during it is raised when
    /// it returns.
    pub fn run<T, F>(mut self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> T,
    {
        let output = f();
        match self.finish() {
            Some(expired) => Err(E::deadline_exceeded(expired)),
            None => Ok(output),
        }
    }

    /// End the scope, raising a cancellation that fired but was not yet
    /// delivered.
    pub fn resolve(mut self) -> Result<(), E> {
        match self.finish() {
            Some(expired) => Err(E::deadline_exceeded(expired)),
            None => Ok(()),
        }
    }
}

impl<E> Activation<E> {
    /// Marks the handshake complete and wakes the monitor. Returns a fired
    /// cancellation nobody has received yet.
    fn finish(&mut self) -> Option<Expired> {
        if self.resolved {
            return None;
        }
        self.resolved = true;
        let undelivered = match self.handshake.complete() {
            Resolution::Completed => None,
            Resolution::Fired => self.target.take_pending(self.id),
        };
        if let Err(e) = self.wake.try_send(MonitorMsg::Resolved) {
            trace!("Monitor of {} already gone: {:?}", self.id, e);
        }
        undelivered
    }
}

impl<E> Drop for Activation<E> {
    fn drop(&mut self) {
        if let Some(expired) = self.finish() {
            debug!(
                "Dropping {} with an undelivered cancellation after {:?}",
                self.id, expired.elapsed
            );
        }
    }
}

impl<E> fmt::Debug for Activation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("resolved", &self.resolved)
            .finish()
    }
}

/// A reusable deadline that builds a fresh guard at each point of use.
pub struct Deadline<E = TimedOut> {
    config: GuardConfig,
    _kind: PhantomData<fn() -> E>,
}

impl Deadline {
    /// A deadline raising [`TimedOut`] after `duration`.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        Self::with_config(GuardConfig::new(duration))
    }

    /// A deadline raising [`TimedOut`] after `secs` seconds.
    pub fn from_secs_f64(secs: f64) -> Result<Self, ConfigError> {
        Self::with_config(GuardConfig::from_secs_f64(secs)?)
    }
}

impl<E> Deadline<E>
where
    E: Cancellation,
{
    /// A deadline with explicit settings.
    pub fn with_config(config: GuardConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Deadline {
            config,
            _kind: PhantomData,
        })
    }

    /// The same deadline, raising `K` instead.
    pub fn raising<K: Cancellation>(self) -> Deadline<K> {
        Deadline {
            config: self.config,
            _kind: PhantomData,
        }
    }

    /// The deadline's settings.
    pub fn config(&self) -> GuardConfig {
        self.config
    }

    /// A guard anchored now, protecting the calling thread.
    pub fn guard(&self) -> DeadlineGuard<E> {
        DeadlineGuard::anchored(self.config)
    }

    /// Bound every call of `f` by this deadline.
    pub fn wrap<F>(self, f: F) -> Timed<F, E> {
        Timed { deadline: self, f }
    }
}

impl<E> Clone for Deadline<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Deadline<E> {}

impl<E> fmt::Debug for Deadline<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deadline")
            .field("config", &self.config)
            .finish()
    }
}

/// A callable whose every call is bounded by a [`Deadline`].
///
/// Each call builds its own guard on the calling thread, so concurrent calls
/// from different threads and consecutive calls are timed independently.
pub struct Timed<F, E = TimedOut> {
    deadline: Deadline<E>,
    f: F,
}

impl<F, E> Timed<F, E>
where
    E: Cancellation,
{
    /// Call the wrapped function and run its future under a fresh deadline.
    pub fn call<Fut>(&self) -> Result<Result<Fut::Output, E>, ActivationError>
    where
        F: Fn() -> Fut,
        Fut: Future,
    {
        let guard = self.deadline.guard();
        guard.block_on((self.f)())
    }

    /// Like [`call`](Self::call), passing `arg` through.
    pub fn call_with<A, Fut>(&self, arg: A) -> Result<Result<Fut::Output, E>, ActivationError>
    where
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        let guard = self.deadline.guard();
        guard.block_on((self.f)(arg))
    }

    /// The deadline applied to each call.
    pub fn deadline(&self) -> &Deadline<E> {
        &self.deadline
    }

    /// Unwrap the callable.
    pub fn into_inner(self) -> F {
        self.f
    }
}

impl<F, E> fmt::Debug for Timed<F, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timed(deadline={:?}, f=<function>)", self.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Overrun(Expired);

    impl Cancellation for Overrun {
        fn deadline_exceeded(expired: Expired) -> Self {
            Overrun(expired)
        }
    }

    #[test]
    fn rejects_zero_duration() {
        assert_eq!(
            DeadlineGuard::new(Duration::ZERO).map(|_| ()),
            Err(ConfigError::ZeroDuration)
        );
        assert_eq!(
            Deadline::new(Duration::ZERO).map(|_| ()),
            Err(ConfigError::ZeroDuration)
        );
    }

    #[test]
    fn rejects_bad_seconds() {
        for secs in [-1.0, 0.0, f64::INFINITY, f64::MAX] {
            assert!(matches!(
                GuardConfig::from_secs_f64(secs),
                Err(ConfigError::InvalidSeconds { .. })
            ));
        }
        assert!(matches!(
            DeadlineGuard::from_secs_f64(f64::NAN),
            Err(ConfigError::InvalidSeconds { .. })
        ));
        assert_eq!(
            DeadlineGuard::from_secs_f64(1e-12).map(|_| ()),
            Err(ConfigError::ZeroDuration)
        );
    }

    #[test]
    fn rejects_zero_floor_interval() {
        let config = GuardConfig::new(Duration::from_secs(1)).with_floor_interval(Duration::ZERO);
        assert_eq!(
            DeadlineGuard::<TimedOut>::with_config(config).map(|_| ()),
            Err(ConfigError::ZeroFloorInterval)
        );
    }

    #[test]
    fn fractional_seconds() {
        let guard = DeadlineGuard::from_secs_f64(1.5).expect("config");
        assert_eq!(guard.duration(), Duration::from_millis(1500));
        assert_eq!(guard.config().floor_interval(), DEFAULT_FLOOR_INTERVAL);
    }

    #[test]
    fn guard_targets_constructing_thread() {
        let guard = DeadlineGuard::new(Duration::from_secs(1)).expect("config");
        assert_eq!(guard.target().id(), thread::current().id());
        assert!(guard.target().is_alive());
    }

    #[test]
    fn clock_starts_at_construction() {
        let guard = DeadlineGuard::new(Duration::from_millis(20)).expect("config");
        assert!(!guard.is_expired());
        thread::sleep(Duration::from_millis(30));
        assert!(guard.is_expired());
        assert_eq!(guard.remaining(), Duration::ZERO);
    }

    #[test]
    fn raising_keeps_the_anchor() {
        let guard = DeadlineGuard::new(Duration::from_secs(1)).expect("config");
        let start = guard.start();
        let guard = guard.raising::<Overrun>();
        assert_eq!(guard.start(), start);
        assert_eq!(guard.duration(), Duration::from_secs(1));
    }

    #[test]
    fn deadline_anchors_each_guard_when_built() {
        let deadline = Deadline::new(Duration::from_secs(1)).expect("config");
        let first = deadline.guard();
        thread::sleep(Duration::from_millis(5));
        let second = deadline.guard();
        assert!(second.start() > first.start());
    }

    #[test]
    fn resolve_in_time_is_ok() {
        let activation = DeadlineGuard::new(Duration::from_secs(5))
            .expect("config")
            .activate()
            .expect("monitor");
        assert_eq!(activation.resolve(), Ok(()));
    }

    #[test]
    fn run_raises_expiry_at_exit() {
        let result = DeadlineGuard::new(Duration::from_millis(10))
            .expect("config")
            .raising::<Overrun>()
            .run(|| thread::sleep(Duration::from_millis(100)))
            .expect("monitor");
        match result {
            Err(Overrun(expired)) => {
                assert_eq!(expired.duration, Duration::from_millis(10));
                assert!(expired.elapsed > Duration::from_millis(10));
            }
            Ok(()) => panic!("expected an overrun"),
        }
    }

    #[test]
    fn drop_resolves_without_raising() {
        let activation = DeadlineGuard::new(Duration::from_millis(10))
            .expect("config")
            .activate()
            .expect("monitor");
        let id = activation.id();
        let target = TargetThread::current();
        thread::sleep(Duration::from_millis(50));
        drop(activation);
        assert_eq!(target.take_pending(id), None);
    }

    #[test]
    fn timed_out_reports_its_deadline() {
        let err = TimedOut::deadline_exceeded(Expired {
            duration: Duration::from_secs(1),
            elapsed: Duration::from_millis(1002),
        });
        assert_eq!(err.duration(), Duration::from_secs(1));
        assert_eq!(err.elapsed(), Duration::from_millis(1002));
        assert!(err.to_string().contains("deadline of 1s exceeded"));
    }
}
