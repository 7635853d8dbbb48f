use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemStruct, parse_macro_input};

extern crate proc_macro;

/// Marks a struct as a statistic snapshot.
///
/// Statistics travel between worker processes and the controller, so every one of
/// them needs the same serde and comparison derives. Field level `#[serde(...)]`
/// attributes are kept as written.
#[proc_macro_attribute]
pub fn stat(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast
    };

    TokenStream::from(expanded)
}

/// Marks a struct as a wire message exchanged over the remote protocol.
///
/// Unlike [`stat`], messages use camelCase field names on the wire.
#[proc_macro_attribute]
pub fn message(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #[serde(rename_all = "camelCase")]
        #ast
    };

    TokenStream::from(expanded)
}
