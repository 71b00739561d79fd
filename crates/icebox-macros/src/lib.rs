use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, parse_quote, punctuated::Punctuated, Expr, ItemFn, Token};

/// Wraps a function returning `crate::Result<T>` so that any error it yields
/// gets a context frame pointing at the caller.
///
/// The attribute takes either a single message expression or `format!`-style
/// arguments: `#[error_context("storing {}", name)]`.
#[proc_macro_attribute]
pub fn error_context(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Expr, Token![,]>::parse_terminated);
    let mut function = parse_macro_input!(item as ItemFn);
    let block = function.block;

    let message: Expr = if args.len() == 1 {
        let only = &args[0];
        parse_quote!(#only)
    } else {
        let parts = args.iter();
        parse_quote!(format!(#(#parts),*))
    };

    function.attrs.push(parse_quote!(#[track_caller]));
    function.block = Box::new(parse_quote!({
        let __icebox_location = std::panic::Location::caller();
        let __icebox_result: crate::Result<_> = (|| { #block })();
        __icebox_result.map_err(|__icebox_error| {
            __icebox_error.context_at(#message, __icebox_location)
        })
    }));

    TokenStream::from(quote!(#function))
}
