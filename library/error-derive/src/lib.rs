extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Marks a type as a first class executor error. The actual requirements of the
/// trait (Error, Kind, Retryable) are fulfilled by their own derive macros; this
/// one merely provides the empty marker impl.
#[proc_macro_derive(ExecError)]
pub fn exec_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;
    quote!(
        impl ExecError for #name {}
    )
    .into()
}
