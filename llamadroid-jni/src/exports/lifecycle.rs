use std::path::Path;

use jni::JNIEnv;
use jni::objects::{JObject, JString};
use jni::sys::{JNI_FALSE, JNI_TRUE, jboolean, jfloat, jint, jlong, jstring};
use tracing::{info, warn};

use super::{
    defaults, drop_bridge, new_jstring, read_string, require_handle, throw, throw_error,
    update_defaults, with_bridge, with_existing_bridge,
};
use crate::bridge::{ILLEGAL_ARGUMENT, catch_panic};
use crate::logging::init_logging;

/// Route library and llama.cpp logs to logcat.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_log_1to_1android<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
) {
    init_logging();
    info!("logging routed to android");
}

/// Initialize the llama.cpp backend and this thread's bridge.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_backend_1init<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    numa: jboolean,
) {
    init_logging();
    catch_panic("backend_init", (), || {
        if numa != JNI_FALSE {
            warn!("NUMA placement is not supported, ignoring");
        }
        if let Err(e) = with_bridge(|_| ()) {
            throw_error(&mut env, &e);
        }
    })
}

/// Free every model, context and sampler created on this thread.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_backend_1free<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
) {
    catch_panic("backend_free", (), || {
        if drop_bridge() {
            info!("bridge released");
        }
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_system_1info<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
) -> jstring {
    catch_panic("system_info", std::ptr::null_mut(), || {
        match with_bridge(|bridge| bridge.system_info(&defaults())) {
            Ok(info) => new_jstring(&mut env, &info),
            Err(e) => {
                throw_error(&mut env, &e);
                std::ptr::null_mut()
            }
        }
    })
}

/// Returns the model handle, or 0 with a pending exception.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_load_1model<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    filename: JString<'local>,
) -> jlong {
    init_logging();
    catch_panic("load_model", 0, || {
        let Some(path) = read_string(&mut env, &filename) else {
            throw(&mut env, ILLEGAL_ARGUMENT, "model path is null");
            return 0;
        };
        info!("Loading model from {path}");
        match with_bridge(|bridge| bridge.load_model(&path)).and_then(|r| r) {
            Ok(model) => model,
            Err(e) => {
                throw_error(&mut env, &e);
                0
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_free_1model<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    model: jlong,
) {
    let model = require_handle!(model);
    catch_panic("free_model", (), || {
        with_existing_bridge(|bridge| bridge.free_model(model));
    })
}

/// Returns the context handle, or 0 with a pending exception.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_new_1context<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    model: jlong,
) -> jlong {
    catch_panic("new_context", 0, || {
        match with_bridge(|bridge| bridge.new_context(model)).and_then(|r| r) {
            Ok(ctx) => ctx,
            Err(e) => {
                throw_error(&mut env, &e);
                0
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_free_1context<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    context: jlong,
) {
    let context = require_handle!(context);
    catch_panic("free_context", (), || {
        with_existing_bridge(|bridge| bridge.free_context(context));
    })
}

/// The sampler takes the temperature and top-p set at this moment.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_new_1sampler<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    model: jlong,
) -> jlong {
    catch_panic("new_sampler", 0, || {
        let defaults = defaults();
        match with_bridge(|bridge| bridge.new_sampler(model, &defaults)).and_then(|r| r) {
            Ok(sampler) => sampler,
            Err(e) => {
                throw_error(&mut env, &e);
                0
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_free_1sampler<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    sampler: jlong,
) {
    let sampler = require_handle!(sampler);
    catch_panic("free_sampler", (), || {
        with_existing_bridge(|bridge| bridge.free_sampler(sampler));
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_nativeSetTemperature<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    temp: jfloat,
) {
    let applied = update_defaults(|d| d.set_temperature(temp));
    info!("Temperature set to {applied:.2}");
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_nativeSetTopP<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    top_p: jfloat,
) {
    let applied = update_defaults(|d| d.set_top_p(top_p));
    info!("Top P set to {applied:.2}");
}

/// Caps the fragments returned after each `completion_init`.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_nativeSetMaxGenerateTokens<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    max_tokens: jint,
) {
    let applied = update_defaults(|d| d.set_max_tokens(i64::from(max_tokens)));
    info!("Max tokens set to {applied}");
}

/// Load a TOML settings file for contexts and samplers created afterwards.
/// On failure the previous settings stay in effect.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_nativeLoadSettings<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    path: JString<'local>,
) -> jboolean {
    catch_panic("nativeLoadSettings", JNI_FALSE, || {
        let Some(path) = read_string(&mut env, &path) else {
            throw(&mut env, ILLEGAL_ARGUMENT, "settings path is null");
            return JNI_FALSE;
        };
        let loaded = match with_bridge(|bridge| bridge.load_settings(Path::new(&path))) {
            Ok(loaded) => loaded,
            Err(e) => {
                throw_error(&mut env, &e);
                return JNI_FALSE;
            }
        };
        match loaded {
            Ok(()) => JNI_TRUE,
            Err(e) => {
                warn!("failed to load settings from {path}: {e:#}");
                JNI_FALSE
            }
        }
    })
}
