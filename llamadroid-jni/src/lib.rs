//! llamadroid-jni: llama.cpp text generation for `android.llama.cpp.LLamaAndroid`
//!
//! The exported `Java_android_llama_cpp_LLamaAndroid_*` symbols replace the
//! C++ adapter the managed class used to load. Handles are opaque `Long`s
//! minted by the engine registry.

pub mod bridge;
mod exports;
mod logging;

pub use bridge::Bridge;
