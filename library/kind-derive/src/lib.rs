extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DataEnum, DataStruct, DataUnion, DeriveInput, Fields};

/// Derives [Kind] for structs and enums.
///
/// Structs report their type name. Enum values report `TypeName::VariantName` so
/// that, for example, an error counter keyed by kind can distinguish which variant
/// of an error enum actually fired.
#[proc_macro_derive(Kind)]
pub fn kind(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;
    match input.data {
        Data::Struct(DataStruct { .. }) => quote!(
            impl Kind for #name {
                fn kind(&self) -> String {
                    stringify!(#name).to_string()
                }
            }
        ),
        Data::Enum(DataEnum { variants, .. }) => {
            let arms = variants.iter().map(|variant| {
                let v = &variant.ident;
                let pattern = match variant.fields {
                    Fields::Unnamed(_) => quote!(#name::#v(..)),
                    Fields::Named(_) => quote!(#name::#v { .. }),
                    Fields::Unit => quote!(#name::#v),
                };
                quote! {
                    #pattern => concat!(stringify!(#name), stringify!(::), stringify!(#v)).to_string()
                }
            });
            quote!(
                impl Kind for #name {
                    fn kind(&self) -> String {
                        match self {
                            #(#arms),*
                        }
                    }
                }
            )
        }
        Data::Union(DataUnion { .. }) => {
            // Unions are for FFI and that is simply not our use case. The panic
            // message tells the user how to proceed if they truly want one.
            panic!(
                r#"kind-derive does not support Unions. Perhaps you should try manually implementing Kind?

impl Kind for {} {{
    fn kind(&self) -> String {{
        ...
    }}
}}"#,
                name
            )
        }
    }
    .into()
}
