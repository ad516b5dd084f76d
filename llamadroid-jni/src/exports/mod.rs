//! `extern "system"` entry points for `android.llama.cpp.LLamaAndroid`
//!
//! Each export converts its JNI arguments, runs one [`Bridge`] call on the
//! calling thread's bridge and raises a Java exception on failure. The
//! managed side drives every call from a single run-loop thread, so the
//! bridge lives in a thread local and handles from other threads are unknown.

use std::cell::RefCell;
use std::sync::RwLock;

use jni::JNIEnv;
use jni::objects::JString;
use jni::sys::jstring;
use llamadroid_engine::{EngineError, LlamaCppBackend, SamplerDefaults, Settings};
use tracing::{error, info, warn};

use crate::bridge::{Bridge, exception_class};

mod completion;
mod lifecycle;

/// Return `$default` for a zero handle without creating the bridge.
macro_rules! require_handle {
    ($raw:expr, $default:expr) => {{
        if $raw == 0 {
            tracing::debug!("{} is null", stringify!($raw));
            return $default;
        }
        $raw
    }};
    ($raw:expr) => {{
        if $raw == 0 {
            tracing::debug!("{} is null", stringify!($raw));
            return;
        }
        $raw
    }};
}

pub(crate) use require_handle;

type JniBridge = Bridge<LlamaCppBackend>;

thread_local! {
    static BRIDGE: RefCell<Option<JniBridge>> = const { RefCell::new(None) };
}

/// Temperature, top-p and max tokens set from the managed side
static DEFAULTS: RwLock<SamplerDefaults> = RwLock::new(SamplerDefaults::new());

fn defaults() -> SamplerDefaults {
    match DEFAULTS.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn update_defaults<T>(f: impl FnOnce(&mut SamplerDefaults) -> T) -> T {
    let mut guard = DEFAULTS.write().unwrap_or_else(|p| p.into_inner());
    f(&mut guard)
}

fn new_bridge() -> Result<JniBridge, EngineError> {
    let backend = LlamaCppBackend::new()?;
    // Load user settings from config.toml, fall back to defaults
    let settings = Settings::load().unwrap_or_else(|e| {
        warn!("failed to load settings, using defaults: {e}");
        Settings::default()
    });
    info!(
        n_ctx = settings.context.n_ctx,
        prefill_batch = settings.generation.prefill_batch,
        "bridge created"
    );
    Ok(Bridge::with_settings(backend, settings))
}

/// Run `f` on this thread's bridge, creating it (and the llama.cpp backend)
/// on first use.
fn with_bridge<T>(f: impl FnOnce(&mut JniBridge) -> T) -> Result<T, EngineError> {
    BRIDGE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let bridge = match slot.take() {
            Some(bridge) => bridge,
            None => new_bridge()?,
        };
        Ok(f(slot.insert(bridge)))
    })
}

/// Run `f` only if this thread already has a bridge.
fn with_existing_bridge<T>(f: impl FnOnce(&mut JniBridge) -> T) -> Option<T> {
    BRIDGE.with(|cell| cell.borrow_mut().as_mut().map(f))
}

fn drop_bridge() -> bool {
    BRIDGE.with(|cell| cell.borrow_mut().take()).is_some()
}

fn throw(env: &mut JNIEnv, class: &str, msg: &str) {
    if let Err(e) = env.throw_new(class, msg) {
        error!("failed to raise {class}: {e}");
    }
}

/// Log `e` and raise it as the matching Java exception.
fn throw_error(env: &mut JNIEnv, e: &EngineError) {
    error!("{e}");
    throw(env, exception_class(e), &e.to_string());
}

/// `None` for a null reference or a string the JVM cannot hand over.
fn read_string(env: &mut JNIEnv, s: &JString) -> Option<String> {
    if s.is_null() {
        return None;
    }
    match env.get_string(s) {
        Ok(s) => Some(s.into()),
        Err(e) => {
            warn!("failed to read java string: {e}");
            None
        }
    }
}

fn new_jstring(env: &mut JNIEnv, s: &str) -> jstring {
    match env.new_string(s) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("failed to create java string: {e}");
            std::ptr::null_mut()
        }
    }
}
