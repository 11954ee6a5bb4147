//! Thread-directed cancellation delivery.
//!
//! Every thread that guards work owns a mailbox. The monitor side records a
//! fired deadline in the target thread's mailbox and unparks that thread. The
//! thread side raises it at its next suspension point: in the innermost live
//! [`catch_expiry`] handler if there is one, otherwise in the activation's
//! executor, which drops the protected future.

use crate::guard::Cancellation;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use snafu::prelude::*;
use std::{
    any::TypeId,
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    marker::PhantomData,
    pin::{Pin, pin},
    sync::{
        Arc,
        Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, Wake, Waker},
    thread::{self, Thread, ThreadId},
    time::Duration,
};

/// Process-unique id of one activation of a deadline guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationId(u64);

impl ActivationId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ActivationId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "activation-{}", self.0)
    }
}

/// What the monitor knew when it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// The configured deadline length.
    pub duration: Duration,
    /// Time elapsed since the guard's clock anchor when the monitor fired.
    pub elapsed: Duration,
}

/// Ways a delivery attempt can fail.
#[derive(Debug, Snafu)]
pub(crate) enum InterruptError {
    /// The target thread has already finished; there is nothing left to cancel.
    #[snafu(display("target thread {thread:?} has already finished"))]
    InvalidTarget {
        /// The thread that was targeted.
        thread: ThreadId,
    },
    /// The mailbox stayed locked for longer than a delivery may wait. Retryable.
    #[snafu(display("delivery to thread {thread:?} could not be confirmed"))]
    Unconfirmed {
        /// The thread that was targeted.
        thread: ThreadId,
    },
}

/// Asynchronous, thread-directed delivery of a fired deadline.
pub(crate) trait Interrupt: Send + 'static {
    /// Request that `activation` be cancelled on the target at its next safe
    /// interruption point.
    fn interrupt(&self, activation: ActivationId, expired: Expired) -> Result<(), InterruptError>;
}

/// How long a delivery waits for the target's mailbox. The target only holds it
/// for a map lookup, so running out means something is wrong on that thread.
const DELIVERY_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

struct Mailbox {
    thread: Thread,
    pending: Mutex<FxHashMap<ActivationId, Expired>>,
}

impl Mailbox {
    fn for_current_thread() -> Self {
        Mailbox {
            thread: thread::current(),
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    fn take(&self, activation: ActivationId) -> Option<Expired> {
        self.pending.lock().remove(&activation)
    }

    fn has_pending(&self, activation: ActivationId) -> bool {
        self.pending.lock().contains_key(&activation)
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveEntry {
    activation: ActivationId,
    /// `TypeId` of the cancellation the activation raises.
    kind: TypeId,
}

#[derive(Debug, Clone, Copy)]
struct HandlerEntry {
    activation: ActivationId,
    token: u64,
}

thread_local! {
    static MAILBOX: Arc<Mailbox> = Arc::new(Mailbox::for_current_thread());
    static ACTIVE: RefCell<Vec<ActiveEntry>> = const { RefCell::new(Vec::new()) };
    static HANDLERS: RefCell<Vec<HandlerEntry>> = const { RefCell::new(Vec::new()) };
    static NEXT_TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// Identity of a thread whose code is protected by a deadline.
///
/// Holds only a weak handle on the thread's mailbox, so a finished thread is
/// detected rather than kept alive.
#[derive(Clone)]
pub struct TargetThread {
    id: ThreadId,
    name: Option<Arc<str>>,
    mailbox: Weak<Mailbox>,
}

impl TargetThread {
    /// Capture the calling thread.
    pub fn current() -> Self {
        let thread = thread::current();
        let mailbox = MAILBOX.try_with(Arc::downgrade).unwrap_or_default();
        TargetThread {
            id: thread.id(),
            name: thread.name().map(Arc::from),
            mailbox,
        }
    }

    /// The id of the captured thread.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The name of the captured thread, if it had one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the captured thread is still running.
    pub fn is_alive(&self) -> bool {
        self.mailbox.strong_count() > 0
    }

    pub(crate) fn take_pending(&self, activation: ActivationId) -> Option<Expired> {
        self.mailbox.upgrade()?.take(activation)
    }
}

impl Interrupt for TargetThread {
    fn interrupt(&self, activation: ActivationId, expired: Expired) -> Result<(), InterruptError> {
        let mailbox = self
            .mailbox
            .upgrade()
            .context(InvalidTargetSnafu { thread: self.id })?;
        mailbox
            .pending
            .try_lock_for(DELIVERY_LOCK_TIMEOUT)
            .context(UnconfirmedSnafu { thread: self.id })?
            .insert(activation, expired);
        mailbox.thread.unpark();
        Ok(())
    }
}

impl fmt::Debug for TargetThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TargetThread(id={:?}, name={:?}, alive={})",
            self.id,
            self.name,
            self.is_alive()
        )
    }
}

pub(crate) enum Delivery<T> {
    Completed(T),
    Interrupted(Expired),
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

struct ActiveFrame(ActivationId);

impl ActiveFrame {
    fn enter(activation: ActivationId, kind: TypeId) -> Self {
        ACTIVE.with_borrow_mut(|active| active.push(ActiveEntry { activation, kind }));
        ActiveFrame(activation)
    }
}

impl Drop for ActiveFrame {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|entry| entry.activation == self.0) {
                active.remove(pos);
            }
        });
    }
}

fn has_live_handler(activation: ActivationId) -> bool {
    HANDLERS.with_borrow(|handlers| handlers.iter().any(|h| h.activation == activation))
}

/// Drive `future` to completion on the current thread on behalf of `activation`,
/// whose cancellation type is `E`.
///
/// Only `activation`'s own cancellation is raised here. While a handler for the
/// activation is live inside the future, a pending cancellation is left to that
/// handler for one more poll; after that it is raised here.
pub(crate) fn block_on<E: 'static, F: Future>(
    activation: ActivationId,
    future: F,
) -> Delivery<F::Output> {
    let mailbox = MAILBOX.with(Arc::clone);
    let _frame = ActiveFrame::enter(activation, TypeId::of::<E>());
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    let mut handler_polled = false;
    'poll_loop: loop {
        if !has_live_handler(activation) {
            if let Some(expired) = mailbox.take(activation) {
                return Delivery::Interrupted(expired);
            }
        }
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return Delivery::Completed(output);
        }
        if !handler_polled && has_live_handler(activation) && mailbox.has_pending(activation) {
            handler_polled = true;
            continue 'poll_loop;
        }
        handler_polled = false;
        if let Some(expired) = mailbox.take(activation) {
            return Delivery::Interrupted(expired);
        }
        thread::park();
    }
}

struct Registration {
    activation: ActivationId,
    token: u64,
    // Handler bookkeeping is per thread.
    _not_send: PhantomData<*const ()>,
}

impl Registration {
    /// Registers a handler for the innermost running activation, if that
    /// activation raises `kind`.
    fn enter(kind: TypeId) -> Option<Self> {
        let activation = ACTIVE
            .with_borrow(|active| active.last().copied())
            .filter(|entry| entry.kind == kind)?
            .activation;
        let token = NEXT_TOKEN.with(|next| {
            let token = next.get();
            next.set(token.wrapping_add(1));
            token
        });
        HANDLERS.with_borrow_mut(|handlers| handlers.push(HandlerEntry { activation, token }));
        Some(Registration {
            activation,
            token,
            _not_send: PhantomData,
        })
    }

    fn is_innermost(&self) -> bool {
        HANDLERS.with_borrow(|handlers| {
            handlers
                .iter()
                .rev()
                .find(|h| h.activation == self.activation)
                .is_some_and(|h| h.token == self.token)
        })
    }

    fn take_if_innermost(&self) -> Option<Expired> {
        if !self.is_innermost() {
            return None;
        }
        MAILBOX.with(|mailbox| mailbox.take(self.activation))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _ = HANDLERS.try_with(|handlers| {
            handlers.borrow_mut().retain(|h| h.token != self.token);
        });
    }
}

/// Handle the current activation's cancellation inside the protected code.
///
/// While this future is live, it is the nearest handler for the activation that
/// is running it: a cancellation delivered at one of `future`'s suspension points
/// drops `future` and resolves to `Err(E)`, and the code after it keeps running.
/// A cancellation handled here is never raised again by the activation. Nested
/// handlers are innermost-first.
///
/// Only a cancellation of type `E` is handled. If the innermost activation
/// raises some other type, or there is no activation at all, this just runs
/// `future` and the activation raises its own cancellation as usual.
///
/// The handler belongs to the thread that first polls it, so the returned
/// future is not `Send`:
/// ```compile_fail
/// use deadline_guard::{TimedOut, catch_expiry};
///
/// fn assert_send<T: Send>(_: T) {}
/// assert_send(catch_expiry::<TimedOut, _>(async {}));
/// ```
pub fn catch_expiry<E, F>(future: F) -> CatchExpiry<E, F>
where
    E: Cancellation,
    F: Future,
{
    CatchExpiry {
        future: Some(Box::pin(future)),
        registration: None,
        started: false,
        _kind: PhantomData,
    }
}

/// Future returned by [`catch_expiry`].
#[must_use = "futures do nothing unless polled"]
pub struct CatchExpiry<E, F> {
    future: Option<Pin<Box<F>>>,
    registration: Option<Registration>,
    started: bool,
    _kind: PhantomData<fn() -> E>,
}

impl<E, F> CatchExpiry<E, F> {
    fn deliver(&mut self, expired: Expired) -> Poll<Result<F::Output, E>>
    where
        E: Cancellation,
        F: Future,
    {
        self.future = None;
        self.registration = None;
        Poll::Ready(Err(E::deadline_exceeded(expired)))
    }
}

impl<E, F> Future for CatchExpiry<E, F>
where
    E: Cancellation,
    F: Future,
{
    type Output = Result<F::Output, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if !this.started {
            this.started = true;
            this.registration = Registration::enter(TypeId::of::<E>());
        }
        if let Some(expired) = this.registration.as_ref().and_then(Registration::take_if_innermost) {
            return this.deliver(expired);
        }
        let Some(future) = this.future.as_mut() else {
            return Poll::Pending;
        };
        match future.as_mut().poll(cx) {
            Poll::Ready(output) => {
                this.future = None;
                this.registration = None;
                Poll::Ready(Ok(output))
            }
            Poll::Pending => {
                match this.registration.as_ref().and_then(Registration::take_if_innermost) {
                    Some(expired) => this.deliver(expired),
                    None => Poll::Pending,
                }
            }
        }
    }
}

impl<E, F> fmt::Debug for CatchExpiry<E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CatchExpiry(started={}, done={})", self.started, self.future.is_none())
    }
}

/// A suspension point that resumes immediately.
///
/// Long-running computations await this between chunks of work so that a
/// cancellation can be delivered there.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
