//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one on a fresh
//! current-thread runtime. Both take an optional limit in seconds
//! (default 60) and run the body on a watchdog thread.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy)]
enum Body {
    Sync,
    Tokio,
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(attr.into(), item, Body::Tokio)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(attr.into(), item, Body::Sync)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(attr: TokenStream2, item: ItemFn, body: Body) -> syn::Result<TokenStream2> {
    let timeout_secs = parse_timeout(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = item;

    let run = match body {
        Body::Sync => {
            if sig.asyncness.is_some() {
                return Err(syn::Error::new(
                    sig.ident.span(),
                    "`timeout` expects a synchronous test; use `tokio_timeout_test` for async",
                ));
            }
            quote! { (|| #block)() }
        }
        Body::Tokio => {
            if sig.asyncness.take().is_none() {
                return Err(syn::Error::new(
                    sig.ident.span(),
                    "`tokio_timeout_test` can only be applied to async functions",
                ));
            }
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build Tokio runtime")
                    .block_on(async {
                        tokio::time::timeout(limit, async move #block)
                            .await
                            .expect("test timed out")
                    })
            }
        }
    };

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#timeout_secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #run));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {}s", #timeout_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse2(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let path: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    path == ["test"] || path == ["tokio", "test"]
}
