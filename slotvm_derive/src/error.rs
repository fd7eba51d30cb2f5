//! Derive macro for error enums.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations, and a
//! `From` conversion for every single-field variant whose field carries `#[from]`.
//!
//! # Usage
//!
//! ```ignore
//! use slotvm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum SlotError {
//!     #[error("program of {size} bytes exceeds the {max} byte limit")]
//!     ProgramTooLarge { size: usize, max: usize },
//!
//!     #[error("storage failure: {0}")]
//!     Storage(#[from] StoreError),
//!
//!     #[error("slot index {0} is out of range")]
//!     InvalidSlot(u8),
//! }
//! ```
//!
//! Positional fields are referenced as `{0}`, `{1}`; named fields by name.
//! Only enums are supported: every error in the crate is a closed set of variants.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DataEnum, DeriveInput, Fields, Lit, Meta, Variant, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "Error can only be derived for enums",
        ));
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let display_arms = display_arms(data)?;
    let source_arms = source_arms(data)?;
    let from_impls = from_impls(input, data)?;

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    #(#display_arms)*
                }
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {
            fn source(&self) -> ::std::option::Option<&(dyn ::std::error::Error + 'static)> {
                match self {
                    #(#source_arms)*
                    _ => ::std::option::Option::None,
                }
            }
        }

        #(#from_impls)*
    })
}

fn display_arms(data: &DataEnum) -> syn::Result<Vec<TokenStream2>> {
    data.variants
        .iter()
        .map(|variant| {
            let ident = &variant.ident;
            let message = message_of(variant)?;

            Ok(match &variant.fields {
                Fields::Unit => quote! {
                    Self::#ident => write!(f, #message),
                },
                Fields::Unnamed(fields) => {
                    let message = rename_positional(&message, fields.unnamed.len());
                    let mut patterns = Vec::new();
                    let mut used = Vec::new();
                    for i in 0..fields.unnamed.len() {
                        let binding = format_ident!("f{}", i);
                        if references(&message, &binding.to_string()) {
                            patterns.push(quote! { #binding });
                            used.push(binding);
                        } else {
                            patterns.push(quote! { _ });
                        }
                    }
                    quote! {
                        Self::#ident(#(#patterns),*) => write!(f, #message, #(#used = #used),*),
                    }
                }
                Fields::Named(fields) => {
                    let used: Vec<_> = fields
                        .named
                        .iter()
                        .filter_map(|f| f.ident.as_ref())
                        .filter(|ident| references(&message, &ident.to_string()))
                        .collect();
                    quote! {
                        Self::#ident { #(#used,)* .. } => write!(f, #message, #(#used = #used),*),
                    }
                }
            })
        })
        .collect()
}

/// Returns `true` if the format string interpolates the named argument.
fn references(message: &str, name: &str) -> bool {
    message.contains(&format!("{{{name}}}")) || message.contains(&format!("{{{name}:"))
}

fn source_arms(data: &DataEnum) -> syn::Result<Vec<TokenStream2>> {
    let mut arms = Vec::new();
    for variant in &data.variants {
        if from_field(variant)?.is_some() {
            let ident = &variant.ident;
            arms.push(quote! {
                Self::#ident(inner) => ::std::option::Option::Some(inner),
            });
        }
    }
    Ok(arms)
}

fn from_impls(input: &DeriveInput, data: &DataEnum) -> syn::Result<Vec<TokenStream2>> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let mut impls = Vec::new();
    for variant in &data.variants {
        if let Some(ty) = from_field(variant)? {
            let ident = &variant.ident;
            impls.push(quote! {
                impl #impl_generics ::std::convert::From<#ty> for #name #ty_generics #where_clause {
                    fn from(inner: #ty) -> Self {
                        Self::#ident(inner)
                    }
                }
            });
        }
    }
    Ok(impls)
}

/// Returns the field type of a `#[from]` variant, rejecting misplaced attributes.
fn from_field(variant: &Variant) -> syn::Result<Option<&syn::Type>> {
    let marked = |field: &syn::Field| field.attrs.iter().any(|a| a.path().is_ident("from"));

    match &variant.fields {
        Fields::Unnamed(fields) => {
            let count = fields.unnamed.iter().filter(|f| marked(f)).count();
            match (count, fields.unnamed.len()) {
                (0, _) => Ok(None),
                (1, 1) => Ok(fields.unnamed.first().map(|f| &f.ty)),
                _ => Err(syn::Error::new_spanned(
                    variant,
                    "#[from] requires a variant with exactly one unnamed field",
                )),
            }
        }
        Fields::Named(fields) if fields.named.iter().any(marked) => Err(syn::Error::new_spanned(
            variant,
            "#[from] is only supported on tuple variants",
        )),
        _ => Ok(None),
    }
}

/// Extracts the message from a variant's `#[error("...")]` attribute.
fn message_of(variant: &Variant) -> syn::Result<String> {
    let Some(attr) = variant.attrs.iter().find(|a| a.path().is_ident("error")) else {
        return Err(syn::Error::new_spanned(
            &variant.ident,
            format!(
                "missing #[error(\"...\")] attribute on variant `{}`",
                variant.ident
            ),
        ));
    };

    let Meta::List(list) = &attr.meta else {
        return Err(syn::Error::new_spanned(
            &attr.meta,
            "expected #[error(\"message\")]",
        ));
    };

    match syn::parse2::<Lit>(list.tokens.clone()) {
        Ok(Lit::Str(lit)) => Ok(lit.value()),
        _ => Err(syn::Error::new_spanned(
            &attr.meta,
            "#[error] message must be a single string literal",
        )),
    }
}

/// Rewrites `{0}`, `{1:?}` into `{f0}`, `{f1:?}` so tuple fields bind by name.
fn rename_positional(message: &str, field_count: usize) -> String {
    let mut out = message.to_string();
    for i in (0..field_count).rev() {
        out = out
            .replace(&format!("{{{i}}}"), &format!("{{f{i}}}"))
            .replace(&format!("{{{i}:"), &format!("{{f{i}:"));
    }
    out
}
