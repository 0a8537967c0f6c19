//! The `Implementation` trait -- the capability interface for a language
//! variant of the worker/client pair.
//!
//! The trait is object-safe so variants can be stored as
//! `Box<dyn Implementation>` in the [`super::ImplementationRegistry`].

use crate::error::Result;
use crate::supervisor::{ProcessSpec, ProcessSupervisor, SupervisedProcess};

use super::{ImplementationTag, LaunchContext, Role};

/// Builds and spawns the processes for one implementation.
pub trait Implementation: Send + Sync {
    fn tag(&self) -> ImplementationTag;

    /// Output label for a process in `role` (e.g. `pyclient-add`).
    fn label(&self, role: Role) -> String;

    /// The command line for `role`.
    fn command(&self, role: Role, launch: &LaunchContext) -> ProcessSpec;

    /// Spawn a supervised process in `role`.
    fn spawn(
        &self,
        supervisor: &ProcessSupervisor,
        role: Role,
        launch: &LaunchContext,
    ) -> Result<SupervisedProcess> {
        supervisor.spawn(&self.label(role), &self.command(role, launch))
    }
}

// Compile-time assertion: Implementation must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Implementation) {}
};
