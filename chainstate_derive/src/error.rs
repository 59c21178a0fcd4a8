//! Derive macro for error types.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations from
//! `#[error("...")]` attributes, so error enums stay declarative.
//!
//! # Usage
//!
//! ```ignore
//! use chainstate_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum StateError {
//!     #[error("key not found")]
//!     KeyNotFound,
//!
//!     #[error("account {0} already exists")]
//!     AlreadyExists(String),
//!
//!     #[error("balance overflow: {current} + {increment}")]
//!     Overflow { current: u128, increment: u128 },
//! }
//! ```
//!
//! Supports unit variants, tuple variants with positional `{0}` args, and
//! struct variants with `{field}` args. Plain structs work the same way with
//! a type-level `#[error("...")]` attribute.

use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{parse_macro_input, Data, DeriveInput, Fields, Lit, Meta};

/// Derives `Display` and `Error` for an enum or struct.
pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_error_derive(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_error_derive(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    match &input.data {
        Data::Enum(data_enum) => {
            let display_arms = data_enum
                .variants
                .iter()
                .map(|variant| {
                    let variant_name = &variant.ident;
                    let message = message_from_attrs(
                        &variant.attrs,
                        &variant.ident,
                        &format!("variant `{}`", variant.ident),
                    )?;

                    let arm = match &variant.fields {
                        Fields::Unit => quote! {
                            Self::#variant_name => write!(f, #message),
                        },
                        Fields::Unnamed(fields) => {
                            let bindings: Vec<_> = (0..fields.unnamed.len())
                                .map(|i| quote::format_ident!("f{}", i))
                                .collect();
                            let format_str =
                                positional_to_named(&message, fields.unnamed.len());
                            quote! {
                                Self::#variant_name(#(#bindings),*) =>
                                    write!(f, #format_str, #(#bindings = #bindings),*),
                            }
                        }
                        Fields::Named(fields) => {
                            let bindings: Vec<_> =
                                fields.named.iter().map(|f| &f.ident).collect();
                            quote! {
                                Self::#variant_name { #(#bindings),* } =>
                                    write!(f, #message, #(#bindings = #bindings),*),
                            }
                        }
                    };

                    Ok(arm)
                })
                .collect::<syn::Result<Vec<_>>>()?;

            Ok(quote! {
                impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
                    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                        match self {
                            #(#display_arms)*
                        }
                    }
                }

                impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
            })
        }
        Data::Struct(data_struct) => {
            let message = message_from_attrs(
                &input.attrs,
                &input.ident,
                &format!("type `{}`", input.ident),
            )?;

            let display_body = match &data_struct.fields {
                Fields::Unit => quote! { write!(f, #message) },
                Fields::Named(fields) => {
                    let bindings: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                    quote! { write!(f, #message, #(#bindings = self.#bindings),*) }
                }
                Fields::Unnamed(fields) => {
                    let bindings: Vec<_> = (0..fields.unnamed.len())
                        .map(|i| quote::format_ident!("f{}", i))
                        .collect();
                    let indices: Vec<_> =
                        (0..fields.unnamed.len()).map(syn::Index::from).collect();
                    let format_str = positional_to_named(&message, fields.unnamed.len());
                    quote! { write!(f, #format_str, #(#bindings = self.#indices),*) }
                }
            };

            Ok(quote! {
                impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
                    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                        #display_body
                    }
                }

                impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
            })
        }
        Data::Union(_) => Err(syn::Error::new_spanned(
            input,
            "Error derive does not support unions",
        )),
    }
}

/// Extracts the display message from an `#[error("...")]` attribute.
fn message_from_attrs<T: ToTokens>(
    attrs: &[syn::Attribute],
    target: &T,
    target_desc: &str,
) -> syn::Result<String> {
    for attr in attrs {
        if attr.path().is_ident("error") {
            if let Meta::List(meta_list) = &attr.meta {
                let lit = syn::parse2::<Lit>(meta_list.tokens.clone()).map_err(|_| {
                    syn::Error::new_spanned(
                        &attr.meta,
                        "failed to parse #[error] attribute; expected a string literal like #[error(\"key not found: {0}\")]",
                    )
                })?;

                if let Lit::Str(lit_str) = lit {
                    return Ok(lit_str.value());
                }

                return Err(syn::Error::new_spanned(
                    &attr.meta,
                    "invalid #[error] attribute: message must be a string literal",
                ));
            }

            return Err(syn::Error::new_spanned(
                &attr.meta,
                "invalid #[error] attribute; use #[error(\"message\")] to describe the error",
            ));
        }
    }

    Err(syn::Error::new_spanned(
        target,
        format!(
            "missing #[error(\"...\")] attribute on {}; every error variant must declare a display message",
            target_desc
        ),
    ))
}

/// Rewrites positional format args `{0}`, `{1}` to named args `{f0}`, `{f1}`.
fn positional_to_named(format_str: &str, field_count: usize) -> String {
    let mut result = format_str.to_string();
    for i in (0..field_count).rev() {
        result = result.replace(&format!("{{{}}}", i), &format!("{{f{}}}", i));
    }
    result
}
