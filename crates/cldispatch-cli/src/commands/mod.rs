//! CLI command implementations

pub mod compile;
pub mod info;
pub mod run;

pub use compile::CompileCommand;
pub use info::InfoCommand;
pub use run::RunCommand;

/// Dispatch failure behind CLI context, if any.
pub fn dispatch_error(err: &anyhow::Error) -> Option<&cldispatch::DispatchError> {
    err.downcast_ref::<cldispatch::DispatchError>()
}
