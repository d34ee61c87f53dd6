/// sqlgate - an identity-aware MySQL access proxy
///
/// This is the root crate that provides workspace-level documentation.
/// Actual implementation is in the subcrates:
/// - `sqlgate-core`: Session model, access checks, clocks and distributed leases
/// - `sqlgate-proxy`: MySQL wire-protocol engine and proxy server

/// This module is intentionally empty as the actual implementation
/// is in the subcrates.
/// Returns the version of the package.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
