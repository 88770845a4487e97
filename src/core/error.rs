// ============================================================================
// filament - Runtime Errors
// ============================================================================

use thiserror::Error;

/// Errors raised by the reactive runtime.
///
/// The infallible entry points (`Signal::set`, the effect constructors, the
/// flush loop) abort with the `Display` text of these variants; `try_`
/// variants return them where caller recovery is plausible.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// An effect constructor ran with no component context and no parent
    /// effect. Use a `managed_*` constructor for top-level effects.
    #[error("cannot create an effect outside a component context or parent effect")]
    EffectOutsideInit,

    /// A strict-mode write happened while a derived was computing.
    #[error("cannot write to a source while a derived is computing")]
    MutationDuringDerivation,

    /// The flush drained more effects than the configured bound allows,
    /// which means an effect keeps scheduling itself.
    #[error("maximum update depth exceeded ({limit}): an effect is caught in an infinite update loop")]
    UpdateDepthExceeded {
        /// The bound that was exceeded.
        limit: u32,
    },

    /// A destroyed node was read before it ever produced a value.
    #[error("read of a destroyed node that holds no value")]
    AccessAfterDestroy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failure() {
        let err = RuntimeError::UpdateDepthExceeded { limit: 100 };
        let text = err.to_string();
        assert!(text.contains("100"));
        assert!(text.contains("update depth"));

        assert!(RuntimeError::MutationDuringDerivation
            .to_string()
            .contains("derived"));
    }
}
