//! `#[tokio_timeout_test]`: run an async test on a fresh current-thread runtime inside
//! its own OS thread, failing it when it exceeds a wall-clock budget.
//!
//! Arguments are optional and comma separated: an integer number of seconds
//! (default 30) and the `paused` flag, which starts the runtime with a paused clock so
//! debounce windows and backpressure fallbacks elapse instantly.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

enum TestArg {
    Seconds(LitInt),
    Paused,
}

impl Parse for TestArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return input.parse().map(TestArg::Seconds);
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TestArg::Paused)
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a timeout in seconds or `paused`",
            ))
        }
    }
}

struct TestArgs {
    timeout_secs: u64,
    paused: bool,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        for arg in Punctuated::<TestArg, Token![,]>::parse_terminated(input)? {
            match arg {
                TestArg::Seconds(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    args.timeout_secs = secs;
                }
                TestArg::Paused => args.paused = true,
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TestArgs {
        timeout_secs,
        paused,
    } = parse_macro_input!(attr as TestArgs);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let builder = if paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread().enable_all()
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
