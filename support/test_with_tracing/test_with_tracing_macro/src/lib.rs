// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Proc-macro half of the `test_with_tracing` crate.

use proc_macro2::TokenStream;
use quote::quote;
use syn::Error;
use syn::ItemFn;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Marks a synchronous test that should have `tracing` output captured.
///
/// Expands to a standard `#[test]` function that installs the subscriber and
/// then runs the original body as a nested function, so `?` and early
/// returns behave exactly as in a plain test.
#[proc_macro_attribute]
pub fn test(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let attr = TokenStream::from(attr);
    let item = parse_macro_input!(item as ItemFn);
    expand(attr, item)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

fn expand(attr: TokenStream, item: ItemFn) -> syn::Result<TokenStream> {
    if !attr.is_empty() {
        return Err(Error::new(attr.span(), "unexpected arguments"));
    }
    let sig = &item.sig;
    if let Some(asyncness) = &sig.asyncness {
        return Err(Error::new(asyncness.span(), "async tests are not supported"));
    }
    if !sig.inputs.is_empty() {
        return Err(Error::new(sig.inputs.span(), "tests take no arguments"));
    }
    if !sig.generics.params.is_empty() {
        return Err(Error::new(sig.generics.span(), "tests cannot be generic"));
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = item;
    let name = &sig.ident;
    let output = &sig.output;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() #output {
            #sig #block
            ::test_with_tracing::init();
            #name()
        }
    })
}
