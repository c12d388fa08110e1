extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DataEnum, DataStruct, DeriveInput, Expr, Fields};

// https://blog.turbo.fish/proc-macro-simple-derive/

/// Derives [Retryable] from `#[retry(<EXPR>)]` annotations.
///
/// Structs take a single annotation on the type. Enums take one annotation per
/// variant, which allows a single error enum to mix transient and fatal
/// dispositions.
#[proc_macro_derive(Retryable, attributes(retry))]
pub fn derive_retryable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;
    match input.data {
        Data::Struct(DataStruct { .. }) => {
            let attr: Option<&Attribute> =
                input.attrs.iter().find(|attr| attr.path.is_ident("retry"));
            match attr {
                Some(attribute) => {
                    let disposition: Expr = attribute.parse_args().unwrap();
                    quote!(
                        impl Retryable for #name {
                            fn retry(&self) -> retry::Retry {
                                #disposition
                            }
                        }
                    )
                    .into()
                }
                None => panic!("struct must have a #[retry(<DISPOSITION>)] attribute"),
            }
        }
        Data::Enum(DataEnum { variants, .. }) => {
            let arms = variants.iter().map(|variant| {
                let v = &variant.ident;
                let attr: Option<&Attribute> = variant
                    .attrs
                    .iter()
                    .find(|attr| attr.path.is_ident("retry"));
                if attr.is_none() {
                    panic!("variant {} is missing its retry attribute", v);
                }
                let disposition: Expr = attr.unwrap().parse_args().unwrap();
                match variant.fields {
                    Fields::Unnamed(_) => quote! {
                        #name::#v(..) => { #disposition }
                    },
                    Fields::Named(_) => quote! {
                        #name::#v { .. } => { #disposition }
                    },
                    Fields::Unit => quote! {
                        #name::#v => { #disposition }
                    },
                }
            });
            quote!(
                impl Retryable for #name {
                    fn retry(&self) -> retry::Retry {
                        match self {
                            #(#arms),*
                        }
                    }
                }
            )
            .into()
        }
        Data::Union(..) => panic!("just say no to unions"),
    }
}
