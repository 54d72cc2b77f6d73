// Test modules for the vimarsh-core crate
//
// Per-component unit tests live beside their source in #[cfg(test)]
// modules; the modules here exercise cross-component flows that need the
// assembled core.

// Shared fixtures for pipeline-level tests
pub mod helpers;
