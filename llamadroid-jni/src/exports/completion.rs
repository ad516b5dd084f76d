use jni::JNIEnv;
use jni::objects::{JObject, JString};
use jni::sys::{jint, jlong, jstring};
use tracing::{debug, warn};

use super::{
    defaults, new_jstring, read_string, require_handle, throw, throw_error, with_bridge,
    with_existing_bridge,
};
use crate::bridge::{ILLEGAL_ARGUMENT, catch_panic};

#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_get_1chat_1format_1single<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    model: jlong,
    role: JString<'local>,
    content: JString<'local>,
) -> jstring {
    catch_panic("get_chat_format_single", std::ptr::null_mut(), || {
        let role = read_string(&mut env, &role).unwrap_or_default();
        let content = read_string(&mut env, &content).unwrap_or_default();
        match with_bridge(|bridge| bridge.chat_format_single(model, &role, &content))
            .and_then(|r| r)
        {
            Ok(text) => new_jstring(&mut env, &text),
            Err(e) => {
                throw_error(&mut env, &e);
                std::ptr::null_mut()
            }
        }
    })
}

/// Context window in tokens, 0 for an unknown handle.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_getContextSize<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    context: jlong,
) -> jint {
    let context = require_handle!(context, 0);
    catch_panic("getContextSize", 0, || {
        with_existing_bridge(|bridge| bridge.context_size(context)).unwrap_or(0)
    })
}

/// Prefill `text` and return the new `n_past`, or -1 with a pending
/// exception. `n_len` is accepted for signature compatibility; the
/// generation budget comes from `nativeSetMaxGenerateTokens`.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_completion_1init<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    context: jlong,
    sampler: jlong,
    text: JString<'local>,
    n_len: jint,
) -> jlong {
    catch_panic("completion_init", -1, || {
        let Some(text) = read_string(&mut env, &text) else {
            throw(&mut env, ILLEGAL_ARGUMENT, "prompt is null");
            return -1;
        };
        let max_tokens = defaults().max_tokens;
        debug!(n_len, max_tokens, "completion_init");
        match with_bridge(|bridge| bridge.completion_init(context, sampler, &text, max_tokens))
            .and_then(|r| r)
        {
            Ok(n_past) => n_past,
            Err(e) => {
                throw_error(&mut env, &e);
                -1
            }
        }
    })
}

/// One generation step: a fragment of complete UTF-8 text (possibly empty),
/// or null when generation has ended. Increments `ncur` for each fragment.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_completion_1loop<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    context: jlong,
    sampler: jlong,
    _n_len: jint,
    ncur: JObject<'local>,
) -> jstring {
    let context = require_handle!(context, std::ptr::null_mut());
    let sampler = require_handle!(sampler, std::ptr::null_mut());
    catch_panic("completion_loop", std::ptr::null_mut(), || {
        let Some(fragment) =
            with_existing_bridge(|bridge| bridge.completion_loop(context, sampler)).flatten()
        else {
            return std::ptr::null_mut();
        };
        if !ncur.is_null()
            && let Err(e) = env.call_method(&ncur, "inc", "()V", &[])
        {
            warn!("failed to advance ncur: {e}");
            let _ = env.exception_clear();
        }
        new_jstring(&mut env, &fragment)
    })
}

/// Clear the KV cache and the context's generation state.
#[unsafe(no_mangle)]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_kv_1cache_1clear<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    context: jlong,
) {
    catch_panic("kv_cache_clear", (), || {
        if let Err(e) = with_bridge(|bridge| bridge.kv_cache_clear(context)).and_then(|r| r) {
            throw_error(&mut env, &e);
        }
    })
}
