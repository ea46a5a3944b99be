//! Registry trait for self-registering implementations.

/// Base trait for implementation registries.
///
/// Each pluggable module (storage backends, cloud implementations, ...) exposes
/// a `Registry` struct implementing this trait, declaring the name used in the
/// configuration file and the factory that builds it.
pub trait ImplementationRegistry {
	/// Name used in configuration, e.g. `memory` for
	/// `[storage.implementations.memory]` or `emulated` for
	/// `[clouds.default] implementation = "emulated"`.
	const NAME: &'static str;

	/// Factory function type of the module this implementation belongs to.
	type Factory;

	fn factory() -> Self::Factory;
}
