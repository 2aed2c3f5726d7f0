pub mod method_handles;
pub mod reflection;

mod java_lang;
mod java_unsafe;

use crate::jvm::call::NativeRegistry;

/// Install the VM's bundled native methods. Registration happens before any
/// class is defined, so defining a class can bind its native handles
/// immediately.
pub fn register_natives(registry: &mut NativeRegistry) {
    java_lang::register(registry);
    java_unsafe::register(registry);
}
