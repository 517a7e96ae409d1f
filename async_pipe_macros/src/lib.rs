use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Runs an `async fn main` on a fresh `async_pipe` runtime.
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    if input.sig.ident != "main" {
        return quote! {
            compile_error!("#[async_pipe::main] can only be applied to the 'main' function");
        }
        .into();
    }

    expand(input, quote! {}, "#[async_pipe::main]")
}

/// Runs an `async fn` test on a fresh `async_pipe` runtime.
#[proc_macro_attribute]
pub fn test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    expand(input, quote! { #[::core::prelude::v1::test] }, "#[async_pipe::test]")
}

fn expand(input: ItemFn, marker: proc_macro2::TokenStream, name: &str) -> TokenStream {
    if input.sig.asyncness.is_none() {
        let message = format!("the {name} function must be async");
        return quote! { compile_error!(#message); }.into();
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = input;
    sig.asyncness = None;

    quote! {
        #marker
        #(#attrs)*
        #vis #sig {
            let runtime = ::async_pipe::runtime::Runtime::new()
                .expect("failed to initialize the async_pipe runtime");
            runtime.block_on(async move #block)
        }
    }
    .into()
}
