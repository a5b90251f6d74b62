//! Test attributes that bound every test by a wall-clock deadline.
//!
//! `#[tokio_timeout_test]` accepts an optional timeout in seconds followed by
//! runtime options:
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(10, flavor = "multi_thread", start_paused = true)]
//! async fn negotiates() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, Lit, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

enum Arg {
    Seconds(LitInt),
    Option { name: Ident, value: Lit },
}

impl Parse for Arg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(Arg::Seconds(input.parse()?));
        }
        let name: Ident = input.parse()?;
        input.parse::<Token![=]>()?;
        Ok(Arg::Option {
            name,
            value: input.parse()?,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Settings {
    timeout_secs: u64,
    flavor: Flavor,
    start_paused: bool,
}

impl Settings {
    fn from_args(args: Punctuated<Arg, Token![,]>) -> syn::Result<Self> {
        let mut settings = Settings {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            start_paused: false,
        };
        for arg in args {
            match arg {
                Arg::Seconds(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    settings.timeout_secs = secs;
                }
                Arg::Option { name, value } => match (name.to_string().as_str(), value) {
                    ("flavor", Lit::Str(flavor)) => {
                        settings.flavor = match flavor.value().as_str() {
                            "current_thread" => Flavor::CurrentThread,
                            "multi_thread" => Flavor::MultiThread,
                            _ => {
                                return Err(syn::Error::new_spanned(
                                    flavor,
                                    "flavor must be \"current_thread\" or \"multi_thread\"",
                                ));
                            }
                        };
                    }
                    ("start_paused", Lit::Bool(paused)) => settings.start_paused = paused.value,
                    (_, _) => {
                        return Err(syn::Error::new_spanned(
                            name,
                            "expected `flavor = \"..\"` or `start_paused = bool`",
                        ));
                    }
                },
            }
        }
        if settings.start_paused && settings.flavor == Flavor::MultiThread {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "start_paused requires the current_thread flavor",
            ));
        }
        Ok(settings)
    }

    fn runtime_builder(&self) -> TokenStream2 {
        let builder = match self.flavor {
            Flavor::CurrentThread => quote!(tokio::runtime::Builder::new_current_thread()),
            Flavor::MultiThread => quote!(tokio::runtime::Builder::new_multi_thread()),
        };
        let paused = if self.start_paused {
            quote!(.start_paused(true))
        } else {
            quote!()
        };
        quote!(#builder.enable_all() #paused .build())
    }
}

/// Runs an async test on its own tokio runtime and fails it if it has not
/// finished within the timeout.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Arg, Token![,]>::parse_terminated);
    let settings = match Settings::from_args(args) {
        Ok(settings) => settings,
        Err(err) => return err.to_compile_error().into(),
    };

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

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();
    let timeout = settings.timeout_secs;
    let runtime = settings.runtime_builder();
    let body = quote! {
        let runtime = #runtime.expect("failed to build tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    guarded(attrs, vis, sig, timeout, body)
}

/// Deadline guard for synchronous tests.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut timeout_secs = DEFAULT_TIMEOUT_SECS;
    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        timeout_secs = match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into();
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        };
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !attr.path().is_ident("test"))
        .collect();
    guarded(attrs, vis, sig, timeout_secs, quote!(#block))
}

/// Runs `body` on a fresh thread and waits for it up to `timeout` seconds.
fn guarded(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    timeout: u64,
    body: TokenStream2,
) -> TokenStream {
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
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
