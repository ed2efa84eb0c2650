//! Process-wide signal dispatch registry.
//!
//! Several subsystems (slot supervision, the coordinator role, the command
//! line front end) need to react to the same termination signals without
//! clobbering each other's handlers. The registry installs one trampoline per
//! signal and fans each delivery out to every registered callback, lowest
//! priority value first, registration order within a priority.
//!
//! The trampoline itself only writes the signal number into a self-pipe
//! (async-signal-safe). Callbacks run on a dedicated dispatcher thread, so
//! they may take locks, allocate, log and spawn.
//!
//! `register`/`unregister` must not be called from inside a real OS signal
//! handler. Callbacks running on the dispatcher thread are fine.
//!
//! This module is the only code path in the crate that calls `sigaction`.
use crate::config::types::{Result, SandboxError};
use log::{debug, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback invoked with the delivered signal
pub type SignalCallback = Arc<dyn Fn(Signal) + Send + Sync>;

/// Wrap a closure as a registrable callback. Identity for `unregister` is the
/// returned `Arc`, so keep a clone of it.
pub fn callback<F>(f: F) -> SignalCallback
where
    F: Fn(Signal) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Signals that mean "shut down" to every long-running process in guestvisor
pub const TERMINATION_SIGNALS: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

struct SignalEntry {
    /// Disposition in effect before the first registration. Captured once.
    original: SigAction,
    groups: BTreeMap<i32, Vec<SignalCallback>>,
}

impl SignalEntry {
    fn ordered_callbacks(&self) -> Vec<SignalCallback> {
        self.groups.values().flatten().cloned().collect()
    }

    fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<Signal, SignalEntry>,
    dispatcher_started: bool,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

/// Write end of the self-pipe, -1 until the dispatcher thread is running
static WAKE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const MAX_SIGNAL: usize = 65;
#[allow(clippy::declare_interior_mutable_const)]
const NOT_CAUGHT: AtomicBool = AtomicBool::new(false);
static PEEK_CAUGHT: [AtomicBool; MAX_SIGNAL] = [NOT_CAUGHT; MAX_SIGNAL];

fn lock_registry() -> MutexGuard<'static, Registry> {
    // A panicking callback must not wedge signal handling for the whole process.
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

extern "C" fn trampoline(signo: libc::c_int) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let fd = WAKE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
    unsafe {
        *libc::__errno_location() = saved_errno;
    }
}

extern "C" fn peek_catcher(signo: libc::c_int) {
    if let Some(flag) = PEEK_CAUGHT.get(signo as usize) {
        flag.store(true, Ordering::SeqCst);
    }
}

fn trampoline_action() -> SigAction {
    SigAction::new(
        SigHandler::Handler(trampoline),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    )
}

fn install(sig: Signal, action: &SigAction) -> Result<SigAction> {
    // SAFETY: both handlers we install are async-signal-safe; restoring a
    // previously returned SigAction reinstates whatever was there before.
    unsafe { signal::sigaction(sig, action) }
        .map_err(|e| SandboxError::Process(format!("sigaction({}) failed: {}", sig, e)))
}

fn ensure_dispatcher(registry: &mut Registry) -> Result<()> {
    if registry.dispatcher_started {
        return Ok(());
    }

    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(SandboxError::Process(format!(
            "pipe2(signal dispatch) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    // A full pipe must never block the trampoline.
    unsafe {
        let flags = libc::fcntl(write_fd, libc::F_GETFL);
        libc::fcntl(write_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }

    std::thread::Builder::new()
        .name("signal-dispatch".to_string())
        .spawn(move || dispatch_loop(read_fd))
        .map_err(|e| SandboxError::Process(format!("spawn(signal dispatcher): {}", e)))?;

    WAKE_WRITE_FD.store(write_fd, Ordering::SeqCst);
    registry.dispatcher_started = true;
    Ok(())
}

fn dispatch_loop(read_fd: libc::c_int) {
    let mut byte = 0u8;
    loop {
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n == 1 {
            match Signal::try_from(byte as i32) {
                Ok(sig) => dispatch(sig),
                Err(_) => warn!("Signal dispatcher woke up for unknown signal {}", byte),
            }
            continue;
        }
        if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        warn!("Signal dispatcher pipe closed; signal callbacks disabled");
        return;
    }
}

fn dispatch(sig: Signal) {
    let callbacks = {
        let registry = lock_registry();
        match registry.entries.get(&sig) {
            Some(entry) => entry.ordered_callbacks(),
            None => Vec::new(),
        }
    };
    if callbacks.is_empty() {
        debug!("Dropping queued {}: no callbacks registered any more", sig);
        return;
    }
    debug!("Dispatching {} to {} callback(s)", sig, callbacks.len());
    for cb in callbacks {
        cb(sig);
    }
}

/// Normalize "TERM", "SIGTERM", "sigterm" or "15" to a signal
pub fn normalize_signal(name: &str) -> Result<Signal> {
    let trimmed = name.trim();
    if let Ok(num) = trimmed.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| SandboxError::InvalidSignal(name.to_string()));
    }

    let upper = trimmed.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| SandboxError::InvalidSignal(name.to_string()))
}

fn normalize_all<I, S>(signals: I) -> Result<Vec<Signal>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for s in signals {
        let sig = normalize_signal(s.as_ref())?;
        if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
            return Err(SandboxError::InvalidSignal(format!(
                "{} cannot be caught",
                s.as_ref()
            )));
        }
        if !out.contains(&sig) {
            out.push(sig);
        }
    }
    Ok(out)
}

fn add_one(registry: &mut Registry, sig: Signal, cb: &SignalCallback, priority: i32) -> Result<()> {
    ensure_dispatcher(registry)?;
    match registry.entries.get_mut(&sig) {
        Some(entry) => {
            install(sig, &trampoline_action())?;
            entry.groups.entry(priority).or_default().push(cb.clone());
        }
        None => {
            let original = install(sig, &trampoline_action())?;
            let mut groups = BTreeMap::new();
            groups.insert(priority, vec![cb.clone()]);
            registry.entries.insert(sig, SignalEntry { original, groups });
        }
    }
    Ok(())
}

fn remove_one(registry: &mut Registry, sig: Signal, cb: &SignalCallback) -> Result<()> {
    let Some(entry) = registry.entries.get_mut(&sig) else {
        debug!("No callbacks registered for {}; nothing to remove", sig);
        return Ok(());
    };

    for group in entry.groups.values_mut() {
        group.retain(|existing| !Arc::ptr_eq(existing, cb));
    }
    entry.groups.retain(|_, group| !group.is_empty());

    if entry.is_empty() {
        let original = entry.original;
        registry.entries.remove(&sig);
        install(sig, &original)?;
    } else {
        install(sig, &trampoline_action())?;
    }
    Ok(())
}

/// Add `cb` for each named signal at `priority` (lower runs first)
pub fn register<I, S>(signals: I, cb: &SignalCallback, priority: i32) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let signals = normalize_all(signals)?;
    register_signals(&signals, cb, priority)
}

/// Typed variant of [`register`]
pub fn register_signals(signals: &[Signal], cb: &SignalCallback, priority: i32) -> Result<()> {
    let mut registry = lock_registry();
    for (done, &sig) in signals.iter().enumerate() {
        if let Err(e) = add_one(&mut registry, sig, cb, priority) {
            // all or nothing
            for &added in &signals[..done] {
                if let Err(undo) = remove_one(&mut registry, added, cb) {
                    warn!("Failed to roll back {} registration: {}", added, undo);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Remove `cb` from each named signal. When a signal loses its last callback
/// the pre-registry disposition is reinstated before this returns.
pub fn unregister<I, S>(signals: I, cb: &SignalCallback) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let signals = normalize_all(signals)?;
    unregister_signals(&signals, cb)
}

/// Typed variant of [`unregister`]
pub fn unregister_signals(signals: &[Signal], cb: &SignalCallback) -> Result<()> {
    let mut registry = lock_registry();
    for &sig in signals {
        remove_one(&mut registry, sig, cb)?;
    }
    Ok(())
}

/// RAII registration; unregisters on drop
pub struct Registration {
    signals: Vec<Signal>,
    cb: SignalCallback,
}

impl Registration {
    pub fn new(signals: &[Signal], cb: &SignalCallback, priority: i32) -> Result<Self> {
        register_signals(signals, cb, priority)?;
        Ok(Self {
            signals: signals.to_vec(),
            cb: cb.clone(),
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(e) = unregister_signals(&self.signals, &self.cb) {
            warn!("Failed to remove signal callback for {:?}: {}", self.signals, e);
        }
    }
}

/// Run `body` with `cb` registered; the callback is removed on every exit
/// path, unwinding included.
pub fn with<I, S, F, R>(signals: I, cb: &SignalCallback, priority: i32, body: F) -> Result<R>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: FnOnce() -> R,
{
    let signals = normalize_all(signals)?;
    let _registration = Registration::new(&signals, cb, priority)?;
    Ok(body())
}

/// The disposition that was in effect before the registry started tracking
/// `sig`. Untracked signals are inspected without losing a delivery.
pub fn original_handler(sig: Signal) -> Result<SigAction> {
    peek_original(sig, || {})
}

/// `during_peek` runs while the capturing handler is installed
fn peek_original<F: FnOnce()>(sig: Signal, during_peek: F) -> Result<SigAction> {
    let registry = lock_registry();
    if let Some(entry) = registry.entries.get(&sig) {
        return Ok(entry.original);
    }

    let idx = sig as usize;
    if let Some(flag) = PEEK_CAUGHT.get(idx) {
        flag.store(false, Ordering::SeqCst);
    }
    let catcher = SigAction::new(
        SigHandler::Handler(peek_catcher),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let original = install(sig, &catcher)?;
    during_peek();
    install(sig, &original)?;

    let caught = PEEK_CAUGHT
        .get(idx)
        .map(|flag| flag.swap(false, Ordering::SeqCst))
        .unwrap_or(false);
    drop(registry);

    if caught {
        debug!("{} arrived while probing; re-delivering", sig);
        signal::raise(sig)
            .map_err(|e| SandboxError::Process(format!("raise({}) failed: {}", sig, e)))?;
    }
    Ok(original)
}

/// Number of callbacks currently registered for `sig`
pub fn callback_count(sig: Signal) -> usize {
    lock_registry()
        .entries
        .get(&sig)
        .map(|entry| entry.groups.values().map(Vec::len).sum())
        .unwrap_or(0)
}

/// Restore every original disposition and forget all registrations.
/// Test isolation only.
#[doc(hidden)]
pub fn reset() {
    let mut registry = lock_registry();
    for (sig, entry) in registry.entries.drain() {
        if let Err(e) = install(sig, &entry.original) {
            warn!("Failed to restore {} during reset: {}", sig, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::{Duration, Instant};

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_normalize_signal_forms() {
        assert_eq!(normalize_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(normalize_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(normalize_signal("usr1").unwrap(), Signal::SIGUSR1);
        assert_eq!(
            normalize_signal(&libc::SIGHUP.to_string()).unwrap(),
            Signal::SIGHUP
        );
        assert!(matches!(
            normalize_signal("NOPE"),
            Err(SandboxError::InvalidSignal(_))
        ));
        assert!(normalize_signal("999").is_err());
    }

    #[test]
    #[serial]
    fn test_invalid_signal_registers_nothing() {
        reset();
        let cb = callback(|_| {});
        let err = register(["USR1", "BOGUS"], &cb, 0).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidSignal(_)));
        assert_eq!(callback_count(Signal::SIGUSR1), 0);

        assert!(register(["KILL"], &cb, 0).is_err());
    }

    #[test]
    #[serial]
    fn test_priority_order_and_single_delivery() {
        reset();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let late = {
            let calls = calls.clone();
            callback(move |_| calls.lock().unwrap().push(5))
        };
        let early = {
            let calls = calls.clone();
            callback(move |_| calls.lock().unwrap().push(1))
        };
        register(["USR1"], &late, 5).unwrap();
        register(["SIGUSR1"], &early, 1).unwrap();

        signal::raise(Signal::SIGUSR1).unwrap();
        assert!(wait_until(|| calls.lock().unwrap().len() >= 2));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*calls.lock().unwrap(), vec![1, 5]);

        unregister(["USR1"], &late).unwrap();
        unregister(["USR1"], &early).unwrap();
        assert_eq!(callback_count(Signal::SIGUSR1), 0);
    }

    #[test]
    #[serial]
    fn test_ties_run_in_registration_order() {
        reset();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut cbs = Vec::new();
        for i in 0..3 {
            let calls = calls.clone();
            let cb = callback(move |_| calls.lock().unwrap().push(i));
            register(["USR2"], &cb, 0).unwrap();
            cbs.push(cb);
        }

        signal::raise(Signal::SIGUSR2).unwrap();
        assert!(wait_until(|| calls.lock().unwrap().len() == 3));
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);

        for cb in &cbs {
            unregister(["USR2"], cb).unwrap();
        }
    }

    #[test]
    #[serial]
    fn test_unregister_last_restores_original() {
        reset();
        let before = original_handler(Signal::SIGUSR2).unwrap();

        let cb1 = callback(|_| {});
        let cb2 = callback(|_| {});
        register(["USR2"], &cb1, 0).unwrap();
        register(["USR2"], &cb2, 3).unwrap();
        assert_eq!(
            original_handler(Signal::SIGUSR2).unwrap().handler(),
            before.handler()
        );

        unregister(["USR2"], &cb1).unwrap();
        assert_eq!(callback_count(Signal::SIGUSR2), 1);
        unregister(["USR2"], &cb2).unwrap();

        let after = original_handler(Signal::SIGUSR2).unwrap();
        assert_eq!(after.handler(), before.handler());
        assert_eq!(after.flags(), before.flags());
    }

    #[test]
    #[serial]
    fn test_with_unregisters_after_panic() {
        reset();
        let cb = callback(|_| {});
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = with(["HUP"], &cb, 0, || {
                assert_eq!(callback_count(Signal::SIGHUP), 1);
                panic!("body failed");
            });
        }));
        assert!(result.is_err());
        assert_eq!(callback_count(Signal::SIGHUP), 0);
    }

    #[test]
    #[serial]
    fn test_nested_scopes_share_signal() {
        reset();
        let outer_hits = Arc::new(Mutex::new(0));
        let inner_hits = Arc::new(Mutex::new(0));
        let outer = {
            let hits = outer_hits.clone();
            callback(move |_| *hits.lock().unwrap() += 1)
        };
        let inner = {
            let hits = inner_hits.clone();
            callback(move |_| *hits.lock().unwrap() += 1)
        };

        with(["USR1"], &outer, 0, || {
            with(["USR1"], &inner, 0, || {
                signal::raise(Signal::SIGUSR1).unwrap();
                assert!(wait_until(|| *inner_hits.lock().unwrap() == 1));
            })
            .unwrap();
            signal::raise(Signal::SIGUSR1).unwrap();
            assert!(wait_until(|| *outer_hits.lock().unwrap() == 2));
        })
        .unwrap();

        assert_eq!(*inner_hits.lock().unwrap(), 1);
        assert_eq!(callback_count(Signal::SIGUSR1), 0);
    }

    #[test]
    #[serial]
    fn test_partial_registration_is_rolled_back() {
        reset();
        let cb = callback(|_| {});
        // the typed entry point skips name validation, so sigaction rejects KILL
        assert!(register_signals(&[Signal::SIGUSR2, Signal::SIGKILL], &cb, 0).is_err());
        assert_eq!(callback_count(Signal::SIGUSR2), 0);
        assert_eq!(
            original_handler(Signal::SIGUSR2).unwrap().handler(),
            SigHandler::SigDfl
        );
    }

    #[test]
    #[serial]
    fn test_untracked_signal_is_inspected_in_place() {
        reset();
        let first = original_handler(Signal::SIGWINCH).unwrap();
        assert_eq!(first.handler(), SigHandler::SigDfl);
        assert_eq!(callback_count(Signal::SIGWINCH), 0);
        // probing leaves the disposition untouched
        let second = original_handler(Signal::SIGWINCH).unwrap();
        assert_eq!(second.handler(), SigHandler::SigDfl);
    }

    static URG_HITS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    extern "C" fn count_urg(_: libc::c_int) {
        URG_HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    #[serial]
    fn test_signal_during_peek_reaches_original_handler() {
        reset();
        let counting = SigAction::new(
            SigHandler::Handler(count_urg),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous = install(Signal::SIGURG, &counting).unwrap();
        URG_HITS.store(0, Ordering::SeqCst);

        let original = peek_original(Signal::SIGURG, || {
            signal::raise(Signal::SIGURG).unwrap();
        })
        .unwrap();

        assert_eq!(original.handler(), SigHandler::Handler(count_urg));
        assert_eq!(URG_HITS.load(Ordering::SeqCst), 1);
        install(Signal::SIGURG, &previous).unwrap();
    }
}
