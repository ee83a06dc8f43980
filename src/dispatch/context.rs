//! Per-thread dispatch state
//!
//! Each execution context (thread) carries its own disable mask plus tracing
//! and compiled-mode switches. They are only changed through the guards
//! below, which restore the exact value they saw on entry when dropped,
//! including during unwinding.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::tensor::Flags;

thread_local! {
    static GLOBAL_DISABLE: Cell<Flags> = const { Cell::new(Flags::empty()) };
    static IS_TRACING: Cell<bool> = const { Cell::new(false) };
    static IS_COMPILED: Cell<bool> = const { Cell::new(false) };
}

/// Flags whose code paths are currently suppressed on this thread
pub fn disabled() -> Flags {
    GLOBAL_DISABLE.with(Cell::get)
}

pub fn is_tracing() -> bool {
    IS_TRACING.with(Cell::get)
}

/// Whether traced requests replay a compiled trace instead of recording
pub fn is_compiled() -> bool {
    IS_COMPILED.with(Cell::get)
}

/// TRACE when tracing mode is active, otherwise empty
pub fn ambient_flags() -> Flags {
    if is_tracing() {
        Flags::TRACE
    } else {
        Flags::empty()
    }
}

/// Adds bits to the disable mask for the guard's lifetime
#[must_use = "the mask is restored as soon as the guard is dropped"]
pub struct ScopedDisable {
    saved: Flags,
    _not_send: PhantomData<*const ()>,
}

impl ScopedDisable {
    pub fn new(flags: Flags) -> Self {
        let saved = GLOBAL_DISABLE.with(|mask| {
            let saved = mask.get();
            mask.set(saved | flags);
            saved
        });
        Self {
            saved,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedDisable {
    fn drop(&mut self) {
        GLOBAL_DISABLE.with(|mask| mask.set(self.saved));
    }
}

/// Switches tracing mode for the guard's lifetime
#[must_use = "tracing mode is restored as soon as the guard is dropped"]
pub struct ScopedTracing {
    saved: bool,
    _not_send: PhantomData<*const ()>,
}

impl ScopedTracing {
    pub fn new(enabled: bool) -> Self {
        let saved = IS_TRACING.with(|flag| flag.replace(enabled));
        Self {
            saved,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedTracing {
    fn drop(&mut self) {
        IS_TRACING.with(|flag| flag.set(self.saved));
    }
}

/// Switches compiled mode for the guard's lifetime
#[must_use = "compiled mode is restored as soon as the guard is dropped"]
pub struct ScopedCompiled {
    saved: bool,
    _not_send: PhantomData<*const ()>,
}

impl ScopedCompiled {
    pub fn new(enabled: bool) -> Self {
        let saved = IS_COMPILED.with(|flag| flag.replace(enabled));
        Self {
            saved,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedCompiled {
    fn drop(&mut self) {
        IS_COMPILED.with(|flag| flag.set(self.saved));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_nested_guards_restore_lifo() {
        assert_eq!(disabled(), Flags::empty());
        {
            let _outer = ScopedDisable::new(Flags::GRAD);
            assert_eq!(disabled(), Flags::GRAD);
            {
                let _inner = ScopedDisable::new(Flags::GRAD | Flags::TRACE);
                assert_eq!(disabled(), Flags::GRAD | Flags::TRACE);
            }
            // the inner guard re-added GRAD; restoring must not clear it
            assert_eq!(disabled(), Flags::GRAD);
        }
        assert_eq!(disabled(), Flags::empty());
    }

    #[test]
    fn test_random_patterns_restore_exactly() {
        let mut rng = rand::thread_rng();
        for _ in 0..256 {
            let base = Flags::from_bits_retain(rng.gen::<u64>());
            let a = Flags::from_bits_retain(rng.gen::<u64>());
            let b = Flags::from_bits_retain(rng.gen::<u64>());

            let _base = ScopedDisable::new(base);
            let before = disabled();
            {
                let _a = ScopedDisable::new(a);
                let _b = ScopedDisable::new(b);
                assert_eq!(disabled(), before | a | b);
            }
            assert_eq!(disabled(), before);
        }
        assert_eq!(disabled(), Flags::empty());
    }

    #[test]
    fn test_guard_restores_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = ScopedDisable::new(Flags::GRAD);
            panic!("unwind through the guard");
        });
        assert!(result.is_err());
        assert_eq!(disabled(), Flags::empty());
    }

    #[test]
    fn test_mask_is_per_thread() {
        let _guard = ScopedDisable::new(Flags::GRAD);
        let other = std::thread::spawn(disabled).join().unwrap();
        assert_eq!(other, Flags::empty());
        assert_eq!(disabled(), Flags::GRAD);
    }

    #[test]
    fn test_tracing_guard() {
        assert!(!is_tracing());
        assert_eq!(ambient_flags(), Flags::empty());
        {
            let _on = ScopedTracing::new(true);
            assert_eq!(ambient_flags(), Flags::TRACE);
            {
                let _off = ScopedTracing::new(false);
                assert!(!is_tracing());
            }
            assert!(is_tracing());
        }
        assert!(!is_tracing());
    }

    #[test]
    fn test_compiled_guard_is_independent() {
        assert!(!is_compiled());
        {
            let _compiled = ScopedCompiled::new(true);
            let _no_trace = ScopedDisable::new(Flags::TRACE);
            assert!(is_compiled());
            assert!(!is_tracing());
            assert_eq!(disabled(), Flags::TRACE);
            assert_eq!(ambient_flags(), Flags::empty());
            {
                let _off = ScopedCompiled::new(false);
                assert!(!is_compiled());
                assert_eq!(disabled(), Flags::TRACE);
            }
            assert!(is_compiled());
        }
        assert!(!is_compiled());
        assert_eq!(disabled(), Flags::empty());
    }
}
