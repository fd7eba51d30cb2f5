//! Derive macros for the slotvm crate.
//!
//! Provides `#[derive(Error)]`, the error type boilerplate used by every
//! subsystem (storage, interpreter, supervisor, dispatcher).

mod error;

use proc_macro::TokenStream;

/// Implements `Display`, `Error` and optional `From` conversions for error types.
///
/// Fields marked `#[from]` get a `From` impl and are returned by `source()`.
#[proc_macro_derive(Error, attributes(error, from))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
