// Fallbacks for sends that find no method.
//
// - a forwarding hook may name a substitute receiver, retried once
// - under the type-strict policy, a type mismatch hook picks the
//   implementation when only a differently typed method exists
// - nil receivers and unhandled selectors get zero-returning stubs chosen
//   by the call site's return type
//
// Hook slots are last-writer-wins and read only on the slow path. Hooks run
// without the runtime lock held and may send messages.

use crate::runtime::Runtime;
use crate::runtime::class::{Imp, Method};
use crate::runtime::encoding::ReturnKind;
use crate::runtime::object::{ObjectPtr, Receiver};
use crate::runtime::selector::Selector;

// ============================================================================
// Hook Types
// ============================================================================

/// Called when `receiver`'s class has no method for a selector.
///
/// Returning `Some(target)` retries the lookup once on `target`.
pub type ForwardingHook = fn(receiver: &Receiver, sel: Selector) -> Option<Receiver>;

/// Called under the type-strict policy when a call site's signature
/// disagrees with the only method found for the selector's name.
///
/// Returns the implementation to use.
pub type TypeMismatchHook = fn(receiver: &Receiver, sel: Selector, found: &Method) -> Imp;

// ============================================================================
// Zero-returning stubs
// ============================================================================

unsafe fn zero_fill(ret: *mut u8, kind: ReturnKind) {
    if !ret.is_null() {
        // SAFETY: the caller sized `ret` for the call site's return type.
        unsafe { std::ptr::write_bytes(ret, 0, kind.zero_width()) };
    }
}

unsafe extern "C-unwind" fn return_void(_: ObjectPtr, _: Selector, _: *const *mut u8, _: *mut u8) {}

unsafe extern "C-unwind" fn return_zero_word(
    _: ObjectPtr,
    _: Selector,
    _: *const *mut u8,
    ret: *mut u8,
) {
    unsafe { zero_fill(ret, ReturnKind::Word) };
}

unsafe extern "C-unwind" fn return_zero_float(
    _: ObjectPtr,
    _: Selector,
    _: *const *mut u8,
    ret: *mut u8,
) {
    unsafe { zero_fill(ret, ReturnKind::Float) };
}

unsafe extern "C-unwind" fn return_zero_double(
    _: ObjectPtr,
    _: Selector,
    _: *const *mut u8,
    ret: *mut u8,
) {
    unsafe { zero_fill(ret, ReturnKind::Double) };
}

unsafe extern "C-unwind" fn return_zero_long_double(
    _: ObjectPtr,
    _: Selector,
    _: *const *mut u8,
    ret: *mut u8,
) {
    unsafe { zero_fill(ret, ReturnKind::LongDouble) };
}

/// Implementation that writes a zero of `kind` into the return slot.
#[must_use]
pub fn zero_stub(kind: ReturnKind) -> Imp {
    match kind {
        ReturnKind::Void => return_void,
        ReturnKind::Word => return_zero_word,
        ReturnKind::Float => return_zero_float,
        ReturnKind::Double => return_zero_double,
        ReturnKind::LongDouble => return_zero_long_double,
    }
}

// ============================================================================
// Hook Storage
// ============================================================================

impl Runtime {
    /// Installs the forwarding hook. Last writer wins.
    pub fn set_forwarding_hook(&self, hook: ForwardingHook) {
        *self.forwarding_hook.write() = Some(hook);
    }

    /// Removes the forwarding hook.
    pub fn clear_forwarding_hook(&self) {
        *self.forwarding_hook.write() = None;
    }

    /// The installed forwarding hook.
    #[must_use]
    pub fn forwarding_hook(&self) -> Option<ForwardingHook> {
        *self.forwarding_hook.read()
    }

    /// Installs the type mismatch hook. Last writer wins.
    pub fn set_type_mismatch_hook(&self, hook: TypeMismatchHook) {
        *self.mismatch_hook.write() = Some(hook);
    }

    /// Removes the type mismatch hook; mismatches then warn and use the
    /// method found.
    pub fn clear_type_mismatch_hook(&self) {
        *self.mismatch_hook.write() = None;
    }

    /// The installed type mismatch hook.
    #[must_use]
    pub fn type_mismatch_hook(&self) -> Option<TypeMismatchHook> {
        *self.mismatch_hook.read()
    }
}
